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

//! An in-process object store.
//!
//! `MemoryCluster` implements the full channel capability against in-memory
//! maps. Asynchronous operations run on a worker pool, so completions fire on
//! other threads exactly as they would against a real cluster. Each
//! `WriteOp` is applied to a copy of the object and committed only if every
//! step succeeds.
//!
//! For testing failure handling, the cluster counts operations by kind and
//! namespace, and faults can be injected to fail a chosen operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use chrono::prelude::*;

use super::{
    ChannelError, Completion, MapEntries, ObjectLocator, ObjectStat,
    ObjectStoreChannel, ObjectStoreCluster, WriteOp, WriteStep, Xattrs,
};
use crate::support::threading::WorkerPool;

/// The kinds of operation counted and faultable by `MemoryCluster`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Operate,
    Read,
    Stat,
    GetXattrs,
    MapGet,
    Delete,
    AtomicAdd,
    CopyFrom,
    List,
}

/// The complete state of one stored object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub xattrs: Xattrs,
    pub omap: MapEntries,
    pub version: u64,
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ObjectKey {
    namespace: String,
    oid: String,
}

struct Fault {
    kind: OpKind,
    oid: Option<String>,
    skip: usize,
    error: ChannelError,
}

#[derive(Default)]
struct ClusterState {
    pools: Mutex<HashMap<String, HashMap<ObjectKey, StoredObject>>>,
    faults: Mutex<Vec<Fault>>,
    counts: Mutex<HashMap<(OpKind, String), usize>>,
    next_version: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
    workers: Arc<WorkerPool>,
}

pub struct MemoryChannel {
    state: Arc<ClusterState>,
    workers: Arc<WorkerPool>,
    pool: String,
    namespace: Mutex<String>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        MemoryCluster {
            state: Arc::new(ClusterState::default()),
            workers: Arc::new(WorkerPool::new("memstore", 4)),
        }
    }

    /// Open a channel to `pool`, concretely typed.
    pub fn channel(&self, pool: &str) -> Arc<MemoryChannel> {
        self.state
            .pools
            .lock()
            .unwrap()
            .entry(pool.to_owned())
            .or_default();

        Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            workers: Arc::clone(&self.workers),
            pool: pool.to_owned(),
            namespace: Mutex::new(String::new()),
        })
    }

    /// Fail the operation of `kind` (optionally only those targeting `oid`)
    /// which comes after `skip` other matching operations. The fault fires
    /// once.
    pub fn inject_fault(
        &self,
        kind: OpKind,
        oid: Option<&str>,
        skip: usize,
        error: ChannelError,
    ) {
        self.state.faults.lock().unwrap().push(Fault {
            kind,
            oid: oid.map(str::to_owned),
            skip,
            error,
        });
    }

    /// The number of operations of `kind` submitted in `namespace` of any
    /// pool.
    pub fn op_count(&self, kind: OpKind, namespace: &str) -> usize {
        self.state
            .counts
            .lock()
            .unwrap()
            .get(&(kind, namespace.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    /// Directly inspect an object, bypassing counters and faults.
    pub fn object(
        &self,
        pool: &str,
        namespace: &str,
        oid: &str,
    ) -> Option<StoredObject> {
        self.state.pools.lock().unwrap().get(pool).and_then(|p| {
            p.get(&ObjectKey {
                namespace: namespace.to_owned(),
                oid: oid.to_owned(),
            })
            .cloned()
        })
    }

    pub fn exists(&self, pool: &str, namespace: &str, oid: &str) -> bool {
        self.object(pool, namespace, oid).is_some()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStoreCluster for MemoryCluster {
    fn open_channel(
        &self,
        pool: &str,
    ) -> Result<Arc<dyn ObjectStoreChannel>, ChannelError> {
        Ok(self.channel(pool))
    }
}

impl ClusterState {
    fn record(&self, kind: OpKind, namespace: &str) {
        *self
            .counts
            .lock()
            .unwrap()
            .entry((kind, namespace.to_owned()))
            .or_insert(0) += 1;
    }

    fn check_fault(&self, kind: OpKind, oid: &str) -> Result<(), ChannelError> {
        let mut faults = self.faults.lock().unwrap();
        let mut fired = None;
        for (ix, fault) in faults.iter_mut().enumerate() {
            if fault.kind != kind
                || fault.oid.as_ref().map_or(false, |o| o != oid)
            {
                continue;
            }

            if fault.skip > 0 {
                fault.skip -= 1;
            } else {
                fired = Some(ix);
                break;
            }
        }

        match fired {
            Some(ix) => Err(faults.remove(ix).error),
            None => Ok(()),
        }
    }

    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, SeqCst) + 1
    }

    fn with_object<T>(
        &self,
        pool: &str,
        key: &ObjectKey,
        f: impl FnOnce(&StoredObject) -> T,
    ) -> Result<T, ChannelError> {
        self.pools
            .lock()
            .unwrap()
            .get(pool)
            .and_then(|p| p.get(key))
            .map(f)
            .ok_or(ChannelError::NotFound)
    }

    fn operate(
        &self,
        pool: &str,
        key: &ObjectKey,
        op: WriteOp,
    ) -> Result<(), ChannelError> {
        let mut pools = self.pools.lock().unwrap();
        let objects = pools.entry(pool.to_owned()).or_default();
        let existing = objects.get(key);
        let exists = existing.is_some();
        let mut object = existing.cloned().unwrap_or_default();
        let mut creates = false;

        for step in op.into_steps() {
            match step {
                WriteStep::Create { exclusive } => {
                    if exclusive && exists {
                        return Err(ChannelError::AlreadyExists);
                    }
                    creates = true;
                },
                WriteStep::WriteFull(data) => {
                    object.data = data;
                    creates = true;
                },
                WriteStep::Write { offset, data } => {
                    let offset = offset as usize;
                    let end = offset + data.len();
                    if object.data.len() < end {
                        object.data.resize(end, 0);
                    }
                    object.data[offset..end].copy_from_slice(&data);
                    creates = true;
                },
                WriteStep::Append(mut data) => {
                    object.data.append(&mut data);
                    creates = true;
                },
                WriteStep::SetXattr(name, value) => {
                    object.xattrs.insert(name, value);
                    creates = true;
                },
                WriteStep::RemoveXattr(name) => {
                    object.xattrs.remove(&name);
                },
                WriteStep::MapSet(entries) => {
                    object.omap.extend(entries);
                    creates = true;
                },
                WriteStep::MapRemoveKeys(keys) => {
                    for key in keys {
                        object.omap.remove(&key);
                    }
                },
            }
        }

        if !exists && !creates {
            return Err(ChannelError::NotFound);
        }

        object.version = self.next_version();
        object.mtime = Some(Utc::now());
        objects.insert(key.clone(), object);
        Ok(())
    }

    fn delete(&self, pool: &str, key: &ObjectKey) -> Result<(), ChannelError> {
        self.pools
            .lock()
            .unwrap()
            .get_mut(pool)
            .and_then(|p| p.remove(key))
            .map(|_| ())
            .ok_or(ChannelError::NotFound)
    }
}

impl MemoryChannel {
    fn key(&self, oid: &str) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace(),
            oid: oid.to_owned(),
        }
    }

    /// Run `f` on the worker pool against the object addressed by `oid` in
    /// the current namespace.
    fn submit<T: Send + 'static>(
        &self,
        kind: OpKind,
        oid: &str,
        f: impl FnOnce(
                &ClusterState,
                &str,
                &ObjectKey,
            ) -> Result<T, ChannelError>
            + Send
            + 'static,
    ) -> Completion<T> {
        let (completion, completer) = Completion::new();
        let key = self.key(oid);
        let pool = self.pool.clone();
        let state = Arc::clone(&self.state);
        state.record(kind, &key.namespace);

        self.workers.execute(move || {
            if completer.is_cancelled() {
                completer.complete(Err(ChannelError::Cancelled));
                return;
            }

            let result = state
                .check_fault(kind, &key.oid)
                .and_then(|()| f(&*state, pool.as_str(), &key));
            completer.complete(result);
        });

        completion
    }

    /// Account for and fault-check an operation run inline.
    fn inline(
        &self,
        kind: OpKind,
        oid: &str,
    ) -> Result<ObjectKey, ChannelError> {
        let key = self.key(oid);
        self.state.record(kind, &key.namespace);
        self.state.check_fault(kind, oid)?;
        Ok(key)
    }
}

impl ObjectStoreChannel for MemoryChannel {
    fn pool(&self) -> &str {
        &self.pool
    }

    fn namespace(&self) -> String {
        self.namespace.lock().unwrap().clone()
    }

    fn set_namespace(&self, namespace: &str) {
        *self.namespace.lock().unwrap() = namespace.to_owned();
    }

    fn aio_operate(&self, oid: &str, op: WriteOp) -> Completion<()> {
        self.submit(OpKind::Operate, oid, move |state, pool, key| {
            state.operate(pool, key, op)
        })
    }

    fn aio_read(
        &self,
        oid: &str,
        max_len: u64,
        offset: u64,
    ) -> Completion<Vec<u8>> {
        self.submit(OpKind::Read, oid, move |state, pool, key| {
            state.with_object(pool, key, |object| {
                let len = object.data.len() as u64;
                let start = offset.min(len);
                let end = offset.saturating_add(max_len).min(len);
                object.data[start as usize..end as usize].to_vec()
            })
        })
    }

    fn aio_stat(&self, oid: &str) -> Completion<ObjectStat> {
        self.submit(OpKind::Stat, oid, |state, pool, key| {
            state.with_object(pool, key, |object| ObjectStat {
                size: object.data.len() as u64,
                mtime: object.mtime.unwrap_or_else(Utc::now),
                version: object.version,
            })
        })
    }

    fn aio_get_xattrs(&self, oid: &str) -> Completion<Xattrs> {
        self.submit(OpKind::GetXattrs, oid, |state, pool, key| {
            state.with_object(pool, key, |object| object.xattrs.clone())
        })
    }

    fn aio_map_get(
        &self,
        oid: &str,
        keys: Option<Vec<String>>,
    ) -> Completion<MapEntries> {
        self.submit(OpKind::MapGet, oid, move |state, pool, key| {
            state.with_object(pool, key, |object| match keys {
                None => object.omap.clone(),
                Some(keys) => keys
                    .into_iter()
                    .filter_map(|k| {
                        object.omap.get(&k).map(|v| (k.clone(), v.clone()))
                    })
                    .collect(),
            })
        })
    }

    fn aio_delete(&self, oid: &str) -> Completion<()> {
        self.submit(OpKind::Delete, oid, |state, pool, key| {
            state.delete(pool, key)
        })
    }

    fn atomic_add(
        &self,
        oid: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64, ChannelError> {
        let object_key = self.inline(OpKind::AtomicAdd, oid)?;
        let mut pools = self.state.pools.lock().unwrap();
        let object = pools
            .entry(self.pool.clone())
            .or_default()
            .entry(object_key)
            .or_default();

        let current = match object.omap.get(key) {
            None => 0,
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or(ChannelError::Failed(-22))?,
        };
        let updated = current.checked_add(delta).ok_or(ChannelError::Range)?;

        object
            .omap
            .insert(key.to_owned(), updated.to_string().into_bytes());
        object.version = self.state.next_version();
        object.mtime = Some(Utc::now());
        Ok(updated)
    }

    fn copy_from(
        &self,
        dest_oid: &str,
        src: &ObjectLocator,
        version: Option<u64>,
    ) -> Result<(), ChannelError> {
        let dest_key = self.inline(OpKind::CopyFrom, dest_oid)?;
        let mut pools = self.state.pools.lock().unwrap();
        let mut copied = pools
            .get(&src.pool)
            .and_then(|p| {
                p.get(&ObjectKey {
                    namespace: src.namespace.clone(),
                    oid: src.oid.clone(),
                })
            })
            .cloned()
            .ok_or(ChannelError::NotFound)?;

        if version.map_or(false, |v| v != copied.version) {
            return Err(ChannelError::Range);
        }

        copied.version = self.state.next_version();
        copied.mtime = Some(Utc::now());
        pools
            .entry(self.pool.clone())
            .or_default()
            .insert(dest_key, copied);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, ChannelError> {
        let namespace = self.namespace();
        self.state.record(OpKind::List, &namespace);
        self.state.check_fault(OpKind::List, "")?;

        let pools = self.state.pools.lock().unwrap();
        let mut oids: Vec<String> = pools
            .get(&self.pool)
            .map(|p| {
                p.keys()
                    .filter(|k| k.namespace == namespace)
                    .map(|k| k.oid.clone())
                    .collect()
            })
            .unwrap_or_default();
        oids.sort();
        Ok(oids)
    }
}
