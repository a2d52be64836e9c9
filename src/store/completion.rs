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

//! Completion handles for asynchronous operations.
//!
//! A `Completion` is the consumer side of one asynchronous operation; the
//! matching `Completer` is held by whatever performs the operation. The
//! consumer may block on `wait()`, poll `is_complete()`, or register a
//! callback with `on_complete()`, which then runs on the thread that
//! completes the operation.
//!
//! A `Completer` dropped without completing resolves its completion as
//! cancelled, so a waiter can never hang on a lost operation.

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex};

use super::ChannelError;

/// Error types which can represent an operation that was cancelled or
/// abandoned before running.
pub trait FromCancel {
    fn cancelled() -> Self;
}

impl FromCancel for ChannelError {
    fn cancelled() -> Self {
        ChannelError::Cancelled
    }
}

type Callback<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    cond: Condvar,
    cancel_requested: AtomicBool,
    abandon: fn() -> E,
}

struct State<T, E> {
    complete: bool,
    result: Option<Result<T, E>>,
    callback: Option<Callback<T, E>>,
}

#[must_use]
pub struct Completion<T, E = ChannelError> {
    shared: Arc<Shared<T, E>>,
}

pub struct Completer<T, E = ChannelError> {
    shared: Option<Arc<Shared<T, E>>>,
}

impl<T: Send + 'static, E: Send + 'static> Completion<T, E> {
    /// Create a pending completion and the completer which resolves it.
    pub fn new() -> (Self, Completer<T, E>)
    where
        E: FromCancel,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                complete: false,
                result: None,
                callback: None,
            }),
            cond: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            abandon: E::cancelled,
        });

        (
            Completion {
                shared: Arc::clone(&shared),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// Create a completion which is already resolved.
    pub fn ready(result: Result<T, E>) -> Self
    where
        E: FromCancel,
    {
        let (completion, completer) = Self::new();
        completer.complete(result);
        completion
    }

    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().unwrap().complete
    }

    /// Request cancellation.
    ///
    /// This only has an effect if the operation has not started yet; an
    /// operation already in flight runs to completion or failure. Returns
    /// whether the operation was still pending when the request was made.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_requested.store(true, SeqCst);
        !self.is_complete()
    }

    /// Block until the operation completes and return its result.
    pub fn wait(self) -> Result<T, E> {
        let mut state = self.shared.state.lock().unwrap();
        while !state.complete {
            state = self.shared.cond.wait(state).unwrap();
        }

        state
            .result
            .take()
            .unwrap_or_else(|| Err((self.shared.abandon)()))
    }

    /// Arrange for `f` to be called with the result.
    ///
    /// If the operation is already complete, `f` is called immediately on
    /// the current thread; otherwise it is called on the thread which
    /// completes the operation.
    pub fn on_complete(self, f: impl FnOnce(Result<T, E>) + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if state.complete {
            let result = state
                .result
                .take()
                .unwrap_or_else(|| Err((self.shared.abandon)()));
            drop(state);
            f(result);
        } else {
            state.callback = Some(Box::new(f));
        }
    }

    /// Derive a completion which resolves to `f` applied to this one's
    /// result.
    ///
    /// Cancellation requested on the derived completion does not propagate.
    pub fn map<U, E2>(
        self,
        f: impl FnOnce(Result<T, E>) -> Result<U, E2> + Send + 'static,
    ) -> Completion<U, E2>
    where
        U: Send + 'static,
        E2: FromCancel + Send + 'static,
    {
        let (mapped, completer) = Completion::new();
        self.on_complete(move |result| completer.complete(f(result)));
        mapped
    }
}

impl<T> Completion<T, ChannelError> {
    /// The RADOS-style return value: `None` while pending, `Some(0)` on
    /// success, and the negative error code on failure.
    pub fn get_return_value(&self) -> Option<i32> {
        let state = self.shared.state.lock().unwrap();
        if !state.complete {
            return None;
        }

        Some(match state.result {
            Some(Ok(_)) => 0,
            Some(Err(e)) => e.code(),
            None => ChannelError::Cancelled.code(),
        })
    }
}

impl<T, E> Completer<T, E> {
    /// Whether the consumer asked for the operation not to be started.
    pub fn is_cancelled(&self) -> bool {
        self.shared
            .as_ref()
            .map_or(true, |s| s.cancel_requested.load(SeqCst))
    }

    pub fn complete(mut self, result: Result<T, E>) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, result);
        }
    }
}

impl<T, E> Drop for Completer<T, E> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let abandoned = (shared.abandon)();
            resolve(&shared, Err(abandoned));
        }
    }
}

fn resolve<T, E>(shared: &Shared<T, E>, result: Result<T, E>) {
    let mut state = shared.state.lock().unwrap();
    state.complete = true;
    if let Some(callback) = state.callback.take() {
        drop(state);
        callback(result);
    } else {
        state.result = Some(result);
        drop(state);
        shared.cond.notify_all();
    }
}

/// A set of outstanding completions which can be joined as a unit.
pub struct CompletionSet<K, T, E = ChannelError> {
    pending: Vec<(K, Completion<T, E>)>,
}

impl<K, T: Send + 'static, E: Send + 'static> CompletionSet<K, T, E> {
    pub fn new() -> Self {
        CompletionSet {
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, key: K, completion: Completion<T, E>) {
        self.pending.push((key, completion));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The number of members which have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.pending.iter().filter(|(_, c)| !c.is_complete()).count()
    }

    /// Wait for every member to complete, returning the results in
    /// submission order.
    pub fn wait_all(self) -> Vec<(K, Result<T, E>)> {
        self.pending
            .into_iter()
            .map(|(key, completion)| (key, completion.wait()))
            .collect()
    }
}

impl<K, T: Send + 'static, E: Send + 'static> Default
    for CompletionSet<K, T, E>
{
    fn default() -> Self {
        Self::new()
    }
}
