//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Clustermail.
//
// Clustermail is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Clustermail is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Clustermail. If not, see <http://www.gnu.org/licenses/>.

//! Utilities for working with threads.
//!
//! Asynchronous operations, both inside the in-process object store and the
//! asynchronous forms of the engine's relocation operations, run on small
//! pools of worker threads. Completion callbacks therefore fire on a thread
//! other than the one which submitted the operation.

use std::thread;

use lazy_static::lazy_static;
use log::error;

lazy_static! {
    static ref MAX_THREADS: usize =
        std::env::var("CLUSTERMAIL_MAX_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or_else(num_cpus::get)
            .max(2);
}

type Task = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of threads which run submitted tasks in FIFO order.
///
/// Dropping the pool closes the queue; threads exit once the tasks already
/// queued have run. They are not joined, since the last reference to the pool
/// may well be dropped by one of its own tasks.
pub struct WorkerPool {
    sender: crossbeam::channel::Sender<Task>,
}

impl WorkerPool {
    /// Create a pool with `threads` threads, named after `name`.
    pub fn new(name: &str, threads: usize) -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded::<Task>();

        for ix in 0..threads.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, ix))
                .spawn(move || {
                    for task in receiver.iter() {
                        task();
                    }
                });

            if let Err(e) = spawned {
                error!("Failed to spawn worker thread for {}: {}", name, e);
            }
        }

        WorkerPool { sender }
    }

    /// Create a pool sized from the number of CPUs, which can be overridden
    /// with the `CLUSTERMAIL_MAX_THREADS` environment variable.
    pub fn with_default_size(name: &str) -> Self {
        Self::new(name, *MAX_THREADS)
    }

    /// Run the given task on one of the pool's threads.
    ///
    /// If the pool has no live threads, the task runs synchronously.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if let Err(e) = self.sender.send(Box::new(task)) {
            (e.into_inner())();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_all_tasks_off_thread() {
        let pool = WorkerPool::new("test", 3);
        let (tx, rx) = crossbeam::channel::unbounded();
        let submitter = thread::current().id();

        for i in 0..100 {
            let tx = tx.clone();
            pool.execute(move || {
                tx.send((i, thread::current().id() != submitter)).unwrap();
            });
        }
        drop(tx);

        let mut seen: Vec<(i32, bool)> = rx.iter().collect();
        seen.sort();
        assert_eq!(100, seen.len());
        for (ix, &(i, off_thread)) in seen.iter().enumerate() {
            assert_eq!(ix as i32, i);
            assert!(off_thread);
        }
    }

    #[test]
    fn tasks_may_drop_the_pool() {
        let pool = Arc::new(Mutex::new(Some(WorkerPool::new("test", 1))));
        let (tx, rx) = crossbeam::channel::bounded(1);

        let pool2 = Arc::clone(&pool);
        pool.lock().unwrap().as_ref().unwrap().execute(move || {
            drop(pool2.lock().unwrap().take());
            tx.send(()).unwrap();
        });

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(pool.lock().unwrap().is_none());
    }
}
