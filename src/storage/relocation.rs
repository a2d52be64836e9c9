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

//! The step-by-step execution of moves, copies, and pool relocations.
//!
//! A relocation passes through the states
//!
//! ```text
//! LogPending -> Copied -> AttrsUpdated -> SourceDeleted -> Satisfied
//! ```
//!
//! Leaving `LogPending` appends the intent to the relocation log (if there is
//! one) and performs the server-side copy. Leaving `SourceDeleted` appends
//! the `done` marker. The log is therefore the only persistent record of the
//! state: an intent without a marker is an unfinished relocation, which
//! replay resumes from the state implied by which objects exist.
//!
//! The source and destination may be the same channel handle, so the two are
//! never scoped at the same time.

use log::{debug, info, warn};

use crate::mail::codec::{MetadataCodec, MetadataStorage};
use crate::mail::model::AttrKey;
use crate::relocation_log::{
    LogEntry, Operation, RelocationLog, RelocationSource,
};
use crate::store::{ChannelHandle, ObjectLocator, ObjectStat, Xattrs};
use crate::support::error::Error;
use crate::support::error_kinds::IgnoreKinds;
use crate::support::log_prefix::LogPrefix;

/// Describes one move or copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocationRequest {
    pub src_oid: String,
    pub src_namespace: String,
    /// The principal owning the source, recorded for index repair.
    pub src_principal: String,
    pub dest_oid: String,
    pub dest_namespace: String,
    /// Attributes rewritten on the destination once copied.
    pub updates: Vec<(AttrKey, Vec<u8>)>,
    pub delete_source: bool,
}

impl RelocationRequest {
    /// A relocation of `oid` to the same id in another namespace.
    pub fn new(oid: &str, src_namespace: &str, dest_namespace: &str) -> Self {
        RelocationRequest {
            src_oid: oid.to_owned(),
            src_namespace: src_namespace.to_owned(),
            src_principal: String::new(),
            dest_oid: oid.to_owned(),
            dest_namespace: dest_namespace.to_owned(),
            updates: vec![],
            delete_source: true,
        }
    }

    pub(crate) fn from_entry(entry: &LogEntry) -> Option<Self> {
        let source = entry.source.as_ref()?;
        Some(RelocationRequest {
            src_oid: source.oid.clone(),
            src_namespace: source.namespace.clone(),
            src_principal: source.principal.clone(),
            dest_oid: entry.oid.clone(),
            dest_namespace: entry.namespace.clone(),
            updates: entry.updates.clone(),
            delete_source: Operation::Move == entry.operation,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MoveState {
    LogPending,
    Copied,
    AttrsUpdated,
    SourceDeleted,
    Satisfied,
}

pub(crate) struct Relocation<'a> {
    pub log_prefix: &'a LogPrefix,
    pub codec: &'a MetadataStorage,
    pub log: Option<&'a RelocationLog>,
    pub src: &'a ChannelHandle,
    pub dest: &'a ChannelHandle,
    pub request: &'a RelocationRequest,
    pub operation: Operation,
    state: MoveState,
    logged: bool,
}

impl<'a> Relocation<'a> {
    pub fn new(
        log_prefix: &'a LogPrefix,
        codec: &'a MetadataStorage,
        log: Option<&'a RelocationLog>,
        src: &'a ChannelHandle,
        dest: &'a ChannelHandle,
        request: &'a RelocationRequest,
        operation: Operation,
    ) -> Self {
        Relocation {
            log_prefix,
            codec,
            log,
            src,
            dest,
            request,
            operation,
            state: MoveState::LogPending,
            logged: false,
        }
    }

    /// Continue a relocation whose intent is already in the log, starting at
    /// `state`.
    pub fn resume_at(mut self, state: MoveState) -> Self {
        self.state = state;
        self.logged = true;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> MoveState {
        self.state
    }

    pub fn entry(&self) -> LogEntry {
        LogEntry {
            operation: self.operation,
            pool: self.dest.pool().to_owned(),
            namespace: self.request.dest_namespace.clone(),
            oid: self.request.dest_oid.clone(),
            source: Some(RelocationSource {
                pool: if self.src.pool() == self.dest.pool() {
                    None
                } else {
                    Some(self.src.pool().to_owned())
                },
                namespace: self.request.src_namespace.clone(),
                oid: self.request.src_oid.clone(),
                principal: self.request.src_principal.clone(),
            }),
            updates: self.request.updates.clone(),
        }
    }

    /// Run the remaining steps.
    pub fn run(&mut self) -> Result<(), Error> {
        while MoveState::Satisfied != self.state {
            self.step()?;
        }
        Ok(())
    }

    /// Advance by one state.
    ///
    /// On failure the state is unchanged, and whatever partial effect the
    /// step had is left for replay.
    pub fn step(&mut self) -> Result<(), Error> {
        // Deleting the source would delete the only copy
        if MoveState::Satisfied != self.state && self.is_in_place() {
            return Err(Error::RelocationInPlace);
        }

        self.state = match self.state {
            MoveState::LogPending => {
                self.log_intent()?;
                self.copy()?;
                MoveState::Copied
            },
            MoveState::Copied => {
                self.update_attributes()?;
                MoveState::AttrsUpdated
            },
            MoveState::AttrsUpdated => {
                self.delete_source()?;
                MoveState::SourceDeleted
            },
            MoveState::SourceDeleted => {
                self.log_done()?;
                MoveState::Satisfied
            },
            MoveState::Satisfied => MoveState::Satisfied,
        };

        debug!(
            "{} {} -> {}: {:?}",
            self.log_prefix,
            self.request.src_oid,
            self.request.dest_oid,
            self.state
        );
        Ok(())
    }

    fn is_in_place(&self) -> bool {
        self.src.pool() == self.dest.pool()
            && self.request.src_namespace == self.request.dest_namespace
            && self.request.src_oid == self.request.dest_oid
    }

    fn log_intent(&mut self) -> Result<(), Error> {
        if self.logged {
            return Ok(());
        }

        if let Some(log) = self.log {
            match log.append_intent(&self.entry()) {
                Ok(()) => (),
                // A copy leaves the source in place, so the log is only
                // advisory for it.
                Err(e) if Operation::Move != self.operation => warn!(
                    "{} Failed to log copy of {}: {}",
                    self.log_prefix, self.request.src_oid, e
                ),
                Err(e) => return Err(e),
            }
        }

        self.logged = true;
        Ok(())
    }

    fn source_locator(&self) -> ObjectLocator {
        ObjectLocator {
            pool: self.src.pool().to_owned(),
            namespace: self.request.src_namespace.clone(),
            oid: self.request.src_oid.clone(),
        }
    }

    fn source_state(&self) -> Result<(ObjectStat, Xattrs), Error> {
        let scope = self.src.in_namespace(&self.request.src_namespace);
        let stat = scope.aio_stat(&self.request.src_oid);
        let xattrs = scope.aio_get_xattrs(&self.request.src_oid);
        Ok((
            stat.wait().map_err(Error::from_read)?,
            xattrs.wait().map_err(Error::from_read)?,
        ))
    }

    fn copy(&self) -> Result<(), Error> {
        let (src_stat, src_xattrs) = self.source_state()?;

        let scope = self.dest.in_namespace(&self.request.dest_namespace);
        scope
            .copy_from(
                &self.request.dest_oid,
                &self.source_locator(),
                Some(src_stat.version),
            )
            .map_err(Error::from_write)?;

        let dest_stat = scope
            .stat(&self.request.dest_oid)
            .map_err(Error::from_read)?;
        let dest_xattrs = scope
            .get_xattrs(&self.request.dest_oid)
            .map_err(Error::from_read)?;

        if dest_stat.size != src_stat.size || dest_xattrs != src_xattrs {
            warn!(
                "{} Copy of {} to {}/{} does not match source",
                self.log_prefix,
                self.request.src_oid,
                self.request.dest_namespace,
                self.request.dest_oid
            );
            return Err(Error::VerificationFailed);
        }

        Ok(())
    }

    fn update_attributes(&self) -> Result<(), Error> {
        if self.request.updates.is_empty() {
            return Ok(());
        }

        let scope = self.dest.in_namespace(&self.request.dest_namespace);
        self.codec.update_attributes(
            &*scope,
            &self.request.dest_oid,
            &self.request.updates,
        )
    }

    fn delete_source(&self) -> Result<(), Error> {
        if !self.request.delete_source {
            return Ok(());
        }

        self.src
            .in_namespace(&self.request.src_namespace)
            .delete(&self.request.src_oid)
            .ignore_not_found()
            .map_err(Error::from_write)
    }

    fn log_done(&self) -> Result<(), Error> {
        if let Some(log) = self.log {
            if let Err(e) = log.append_done(self.entry().destination()) {
                // The relocation itself is complete; replay will find it so.
                warn!(
                    "{} Failed to mark relocation of {} done: {}",
                    self.log_prefix, self.request.src_oid, e
                );
            }
        }

        if self.request.delete_source {
            info!(
                "{} Moved {}/{} to {}/{}",
                self.log_prefix,
                self.request.src_namespace,
                self.request.src_oid,
                self.request.dest_namespace,
                self.request.dest_oid
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::mail::codec::DefaultCodec;
    use crate::relocation_log::LogLine;
    use crate::store::memory::{MemoryCluster, OpKind};
    use crate::store::{ChannelError, ObjectStoreChannel};

    struct Setup {
        cluster: MemoryCluster,
        handle: ChannelHandle,
        codec: MetadataStorage,
        prefix: LogPrefix,
        _root: TempDir,
        log: RelocationLog,
    }

    fn setup() -> Setup {
        let cluster = MemoryCluster::new();
        let channel = cluster.channel("mail");
        channel.set_namespace("a");
        channel.write_full("m1", b"message body").unwrap();
        channel.set_xattr("m1", "G", b"guid").unwrap();
        channel.set_xattr("m1", "U", b"1").unwrap();

        let root = TempDir::new().unwrap();
        let log = RelocationLog::open(root.path().join("reloc.log")).unwrap();
        Setup {
            handle: ChannelHandle::new(channel),
            cluster,
            codec: MetadataStorage::Default(DefaultCodec),
            prefix: LogPrefix::new("test".to_owned()),
            _root: root,
            log,
        }
    }

    fn request() -> RelocationRequest {
        RelocationRequest {
            src_principal: "alice".to_owned(),
            updates: vec![(AttrKey::MailUid, b"9".to_vec())],
            ..RelocationRequest::new("m1", "a", "b")
        }
    }

    fn relocation<'a>(
        setup: &'a Setup,
        request: &'a RelocationRequest,
        operation: Operation,
    ) -> Relocation<'a> {
        Relocation::new(
            &setup.prefix,
            &setup.codec,
            Some(&setup.log),
            &setup.handle,
            &setup.handle,
            request,
            operation,
        )
    }

    #[test]
    fn relocation_onto_itself_is_refused() {
        let setup = setup();
        let request = RelocationRequest::new("m1", "a", "a");
        for &operation in &[Operation::Move, Operation::Copy] {
            assert_matches!(
                Err(Error::RelocationInPlace),
                relocation(&setup, &request, operation).run()
            );
            // Even when resumed past the copy
            assert_matches!(
                Err(Error::RelocationInPlace),
                relocation(&setup, &request, operation)
                    .resume_at(MoveState::AttrsUpdated)
                    .run()
            );
        }

        assert_eq!(
            b"message body".to_vec(),
            setup.cluster.object("mail", "a", "m1").unwrap().data
        );
        assert!(setup.log.read_lines().unwrap().is_empty());
    }

    #[test]
    fn move_walks_all_states() {
        let setup = setup();
        let request = request();
        let mut reloc = relocation(&setup, &request, Operation::Move);

        let mut states = vec![reloc.state()];
        while MoveState::Satisfied != reloc.state() {
            reloc.step().unwrap();
            states.push(reloc.state());
        }
        assert_eq!(
            vec![
                MoveState::LogPending,
                MoveState::Copied,
                MoveState::AttrsUpdated,
                MoveState::SourceDeleted,
                MoveState::Satisfied,
            ],
            states
        );

        assert!(!setup.cluster.exists("mail", "a", "m1"));
        let dest = setup.cluster.object("mail", "b", "m1").unwrap();
        assert_eq!(b"message body".to_vec(), dest.data);
        assert_eq!(b"9".to_vec(), dest.xattrs["U"]);
        assert_eq!(b"guid".to_vec(), dest.xattrs["G"]);
        assert_eq!("a", setup.handle.namespace());

        let lines: Vec<LogLine> = setup
            .log
            .read_lines()
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            vec![
                LogLine::Intent(reloc.entry()),
                LogLine::Done(reloc.entry().destination()),
            ],
            lines
        );
    }

    #[test]
    fn copy_keeps_source() {
        let setup = setup();
        let request = RelocationRequest {
            delete_source: false,
            ..request()
        };
        relocation(&setup, &request, Operation::Copy).run().unwrap();

        assert!(setup.cluster.exists("mail", "a", "m1"));
        assert_eq!(
            b"1".to_vec(),
            setup.cluster.object("mail", "a", "m1").unwrap().xattrs["U"]
        );
        assert_eq!(
            b"9".to_vec(),
            setup.cluster.object("mail", "b", "m1").unwrap().xattrs["U"]
        );
    }

    #[test]
    fn copy_failure_stays_in_log_pending() {
        let setup = setup();
        let request = request();
        setup.cluster.inject_fault(
            OpKind::CopyFrom,
            None,
            0,
            ChannelError::Failed(-5),
        );

        let mut reloc = relocation(&setup, &request, Operation::Move);
        assert_matches!(Err(Error::WriteFailed(-5)), reloc.step());
        assert_eq!(MoveState::LogPending, reloc.state());
        assert!(setup.cluster.exists("mail", "a", "m1"));
        assert!(!setup.cluster.exists("mail", "b", "m1"));
        assert_eq!("a", setup.handle.namespace());

        // The intent is recorded without a marker
        assert_eq!(1, setup.log.read_lines().unwrap().len());
    }

    #[test]
    fn missing_source_is_not_found() {
        let setup = setup();
        let request = RelocationRequest::new("nx", "a", "b");
        let mut reloc = relocation(&setup, &request, Operation::Move);
        assert_matches!(Err(Error::NotFound), reloc.run());
        assert!(!setup.cluster.exists("mail", "b", "nx"));
    }

    #[test]
    fn relocation_between_pools_records_source_pool() {
        let setup = setup();
        let alt = ChannelHandle::new(setup.cluster.channel("alt"));
        let request = RelocationRequest::new("m1", "a", "a");
        let mut reloc = Relocation::new(
            &setup.prefix,
            &setup.codec,
            Some(&setup.log),
            &setup.handle,
            &alt,
            &request,
            Operation::Move,
        );
        assert_eq!(Some("mail"), reloc.entry().source_pool());
        assert_eq!(
            Some("mail".to_owned()),
            reloc.entry().source.unwrap().pool
        );
        reloc.run().unwrap();

        assert!(!setup.cluster.exists("mail", "a", "m1"));
        assert!(setup.cluster.exists("alt", "a", "m1"));
    }

    #[test]
    fn from_entry_round_trip() {
        let setup = setup();
        let request = request();
        let reloc = relocation(&setup, &request, Operation::Move);
        assert_eq!(
            Some(request.clone()),
            RelocationRequest::from_entry(&reloc.entry())
        );
    }
}
