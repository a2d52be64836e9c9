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

//! The object store capability consumed by the engine.
//!
//! The engine is written purely against `ObjectStoreChannel`, which mirrors
//! the shape of a RADOS I/O context: a handle bound to one pool and, at any
//! given moment, one namespace within it. Objects are addressed by id within
//! that namespace and carry three kinds of data: a byte payload, a set of
//! small extended attributes ("xattrs"), and an ordered key/value map.
//!
//! Multi-step mutations of one object are expressed as a `WriteOp`, which the
//! channel applies atomically and reports with a single completion. This is
//! what lets the engine combine a chunked content write with the metadata
//! writes of a save in one round trip.
//!
//! `MemoryCluster` (in `memory`) is a complete in-process implementation used
//! by the tests and by embedders which do not need a real cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::prelude::*;
use thiserror::Error;

pub mod completion;
pub mod handle;
pub mod memory;

pub use self::completion::{Completer, Completion, CompletionSet};
pub use self::handle::{ChannelHandle, ChannelScope};

/// Errors reported by an object store channel.
///
/// The codes follow the negative-errno convention of RADOS.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("No such object")]
    NotFound,
    #[error("Object already exists")]
    AlreadyExists,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Object version mismatch")]
    Range,
    #[error("Channel error {0}")]
    Failed(i32),
}

impl ChannelError {
    pub fn code(self) -> i32 {
        match self {
            ChannelError::NotFound => -2,
            ChannelError::AlreadyExists => -17,
            ChannelError::Range => -34,
            ChannelError::TimedOut => -110,
            ChannelError::Cancelled => -125,
            ChannelError::Failed(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -2 => ChannelError::NotFound,
            -17 => ChannelError::AlreadyExists,
            -34 => ChannelError::Range,
            -110 => ChannelError::TimedOut,
            -125 => ChannelError::Cancelled,
            code => ChannelError::Failed(code),
        }
    }
}

/// Size and modification time of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Incremented by every mutation of the object.
    pub version: u64,
}

/// Fully-qualified address of an object, used as the source of server-side
/// copies.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectLocator {
    pub pool: String,
    pub namespace: String,
    pub oid: String,
}

/// One mutation within a `WriteOp`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteStep {
    /// Create the object. If `exclusive`, fail if it already exists.
    Create { exclusive: bool },
    /// Replace the payload entirely.
    WriteFull(Vec<u8>),
    /// Write at the given offset, extending the payload as needed.
    Write { offset: u64, data: Vec<u8> },
    /// Append to the payload.
    Append(Vec<u8>),
    SetXattr(String, Vec<u8>),
    RemoveXattr(String),
    MapSet(BTreeMap<String, Vec<u8>>),
    MapRemoveKeys(Vec<String>),
}

/// A batch of mutations applied atomically to one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOp {
    steps: Vec<WriteStep>,
}

impl WriteOp {
    pub fn new() -> Self {
        WriteOp::default()
    }

    pub fn create(&mut self, exclusive: bool) -> &mut Self {
        self.steps.push(WriteStep::Create { exclusive });
        self
    }

    pub fn write_full(&mut self, data: Vec<u8>) -> &mut Self {
        self.steps.push(WriteStep::WriteFull(data));
        self
    }

    pub fn write(&mut self, offset: u64, data: Vec<u8>) -> &mut Self {
        self.steps.push(WriteStep::Write { offset, data });
        self
    }

    pub fn append(&mut self, data: Vec<u8>) -> &mut Self {
        self.steps.push(WriteStep::Append(data));
        self
    }

    pub fn set_xattr(&mut self, name: String, value: Vec<u8>) -> &mut Self {
        self.steps.push(WriteStep::SetXattr(name, value));
        self
    }

    pub fn remove_xattr(&mut self, name: String) -> &mut Self {
        self.steps.push(WriteStep::RemoveXattr(name));
        self
    }

    pub fn map_set(
        &mut self,
        entries: BTreeMap<String, Vec<u8>>,
    ) -> &mut Self {
        if !entries.is_empty() {
            self.steps.push(WriteStep::MapSet(entries));
        }
        self
    }

    pub fn map_remove_keys(&mut self, keys: Vec<String>) -> &mut Self {
        if !keys.is_empty() {
            self.steps.push(WriteStep::MapRemoveKeys(keys));
        }
        self
    }

    pub fn steps(&self) -> &[WriteStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<WriteStep> {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

pub type Xattrs = BTreeMap<String, Vec<u8>>;
pub type MapEntries = BTreeMap<String, Vec<u8>>;

/// A handle onto one pool of the object store.
///
/// All object ids are interpreted within the namespace current at the time
/// the operation is submitted; asynchronous operations capture the namespace
/// at submission, so switching afterwards does not affect them.
///
/// Implementations must be usable from multiple threads, and completions may
/// fire on any thread.
pub trait ObjectStoreChannel: Send + Sync {
    /// The name of the pool this channel is bound to.
    fn pool(&self) -> &str;
    /// The namespace operations are currently directed to.
    fn namespace(&self) -> String;
    fn set_namespace(&self, namespace: &str);

    /// Apply `op` atomically to `oid`.
    fn aio_operate(&self, oid: &str, op: WriteOp) -> Completion<()>;
    /// Read up to `max_len` bytes starting at `offset`.
    fn aio_read(
        &self,
        oid: &str,
        max_len: u64,
        offset: u64,
    ) -> Completion<Vec<u8>>;
    fn aio_stat(&self, oid: &str) -> Completion<ObjectStat>;
    fn aio_get_xattrs(&self, oid: &str) -> Completion<Xattrs>;
    /// Fetch map entries. `None` fetches the whole map.
    fn aio_map_get(
        &self,
        oid: &str,
        keys: Option<Vec<String>>,
    ) -> Completion<MapEntries>;
    fn aio_delete(&self, oid: &str) -> Completion<()>;

    /// Atomically add `delta` to the decimal integer stored under `key` in
    /// the object's map, creating object and key as needed. Returns the new
    /// value.
    fn atomic_add(
        &self,
        oid: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64, ChannelError>;

    /// Server-side copy of `src` (payload, xattrs and map) over `dest_oid`.
    ///
    /// If `version` is given, the copy fails with `Range` unless the source
    /// is still at that version.
    fn copy_from(
        &self,
        dest_oid: &str,
        src: &ObjectLocator,
        version: Option<u64>,
    ) -> Result<(), ChannelError>;

    /// List the object ids in the current namespace.
    fn list(&self) -> Result<Vec<String>, ChannelError>;

    fn operate(&self, oid: &str, op: WriteOp) -> Result<(), ChannelError> {
        self.aio_operate(oid, op).wait()
    }

    fn write_full(&self, oid: &str, data: &[u8]) -> Result<(), ChannelError> {
        let mut op = WriteOp::new();
        op.write_full(data.to_vec());
        self.operate(oid, op)
    }

    fn write_at(
        &self,
        oid: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        let mut op = WriteOp::new();
        op.write(offset, data.to_vec());
        self.operate(oid, op)
    }

    fn append(&self, oid: &str, data: &[u8]) -> Result<(), ChannelError> {
        let mut op = WriteOp::new();
        op.append(data.to_vec());
        self.operate(oid, op)
    }

    fn read(
        &self,
        oid: &str,
        max_len: u64,
        offset: u64,
    ) -> Result<Vec<u8>, ChannelError> {
        self.aio_read(oid, max_len, offset).wait()
    }

    fn stat(&self, oid: &str) -> Result<ObjectStat, ChannelError> {
        self.aio_stat(oid).wait()
    }

    fn set_xattr(
        &self,
        oid: &str,
        name: &str,
        value: &[u8],
    ) -> Result<(), ChannelError> {
        let mut op = WriteOp::new();
        op.set_xattr(name.to_owned(), value.to_vec());
        self.operate(oid, op)
    }

    fn get_xattrs(&self, oid: &str) -> Result<Xattrs, ChannelError> {
        self.aio_get_xattrs(oid).wait()
    }

    fn map_set(
        &self,
        oid: &str,
        entries: MapEntries,
    ) -> Result<(), ChannelError> {
        let mut op = WriteOp::new();
        op.map_set(entries);
        self.operate(oid, op)
    }

    fn map_get_by_keys(
        &self,
        oid: &str,
        keys: &[String],
    ) -> Result<MapEntries, ChannelError> {
        self.aio_map_get(oid, Some(keys.to_vec())).wait()
    }

    fn map_get_all(&self, oid: &str) -> Result<MapEntries, ChannelError> {
        self.aio_map_get(oid, None).wait()
    }

    fn map_remove_keys(
        &self,
        oid: &str,
        keys: &[String],
    ) -> Result<(), ChannelError> {
        let mut op = WriteOp::new();
        op.map_remove_keys(keys.to_vec());
        self.operate(oid, op)
    }

    fn delete(&self, oid: &str) -> Result<(), ChannelError> {
        self.aio_delete(oid).wait()
    }
}

/// A connection to the object store cluster, from which channels onto
/// individual pools are opened.
pub trait ObjectStoreCluster: Send + Sync {
    fn open_channel(
        &self,
        pool: &str,
    ) -> Result<Arc<dyn ObjectStoreChannel>, ChannelError>;
}
