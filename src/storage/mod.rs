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

//! The storage engine.
//!
//! `MailStorage` owns the channels onto the primary and (optional) alt pools,
//! the metadata codec selected by configuration, the namespace manager, and
//! the relocation log. It is cheaply cloneable; clones share all of these.
//!
//! Every operation is directed at the namespace currently selected on the
//! engine (see `select_user()`), except for relocations, which name their
//! source and destination namespaces explicitly.

use std::sync::Arc;

use chrono::prelude::*;
use log::{debug, error, info, warn};

use crate::mail::codec::{apply_decoded, MetadataCodec, MetadataStorage};
use crate::mail::model::{AttrKey, MailObject};
use crate::namespace::NamespaceManager;
use crate::relocation_log::{
    replay, Destination, LogEntry, Operation, RelocationLog, ReplayReport,
};
use crate::store::{
    ChannelError, ChannelHandle, Completion, CompletionSet, MapEntries,
    ObjectStat, ObjectStoreCluster, WriteOp, Xattrs,
};
use crate::support::error::Error;
use crate::support::error_kinds::IgnoreKinds;
use crate::support::log_prefix::LogPrefix;
use crate::support::safe_name::is_safe_name;
use crate::support::storage_config::StorageConfig;
use crate::support::threading::WorkerPool;

pub mod chunks;
pub mod relocation;

use self::relocation::Relocation;
pub use self::relocation::{MoveState, RelocationRequest};

/// Handle onto the mail storage of one pool (plus its alt pool).
///
/// Clones share everything, including the selected namespace: selecting a
/// namespace on one clone redirects the operations of all of them. Code
/// serving several principals at once should open one `MailStorage` per
/// principal rather than cloning.
#[derive(Clone)]
pub struct MailStorage {
    inner: Arc<Inner>,
}

struct Inner {
    log_prefix: LogPrefix,
    config: StorageConfig,
    primary: Arc<ChannelHandle>,
    alt: Option<Arc<ChannelHandle>>,
    codec: MetadataStorage,
    namespaces: NamespaceManager,
    relocation_log: Option<RelocationLog>,
    workers: WorkerPool,
}

/// A save submitted with `MailStorage::save_async()`.
///
/// The pending save owns the mail until the save completes. Dropping it
/// before then blocks until the write has finished.
pub struct PendingSave {
    mail: Option<MailObject>,
    completion: Option<Completion<(), Error>>,
}

impl MailStorage {
    /// Open the pools named by `config` on `cluster`.
    pub fn open(
        cluster: &dyn ObjectStoreCluster,
        config: StorageConfig,
    ) -> Result<Self, Error> {
        Self::open_with_namespaces(cluster, config, NamespaceManager::new)
    }

    /// Like `open()`, but with namespace ids for new principals drawn from
    /// `generator`.
    pub fn open_with_generator(
        cluster: &dyn ObjectStoreCluster,
        config: StorageConfig,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        Self::open_with_namespaces(
            cluster,
            config,
            move |log_prefix, handle, config| {
                NamespaceManager::with_generator(
                    log_prefix,
                    handle,
                    config,
                    Box::new(generator),
                )
            },
        )
    }

    fn open_with_namespaces(
        cluster: &dyn ObjectStoreCluster,
        config: StorageConfig,
        namespaces: impl FnOnce(
            LogPrefix,
            Arc<ChannelHandle>,
            &StorageConfig,
        ) -> NamespaceManager,
    ) -> Result<Self, Error> {
        config.validate()?;

        let log_prefix = LogPrefix::new("storage".to_owned());
        let primary = Arc::new(ChannelHandle::new(
            cluster.open_channel(&config.pool).map_err(Error::from_read)?,
        ));
        let alt = match config.alt_pool {
            Some(ref pool) => Some(Arc::new(ChannelHandle::new(
                cluster.open_channel(pool).map_err(Error::from_read)?,
            ))),
            None => None,
        };
        let relocation_log = match config.relocation_log {
            Some(ref path) => Some(RelocationLog::open(path)?),
            None => None,
        };

        let namespaces =
            namespaces(log_prefix.clone(), Arc::clone(&primary), &config);
        let codec = MetadataStorage::from_config(&config)?;

        info!(
            "{} Opened pool {}{}",
            log_prefix,
            config.pool,
            config
                .alt_pool
                .as_ref()
                .map(|alt| format!(" with alt pool {}", alt))
                .unwrap_or_default()
        );

        Ok(MailStorage {
            inner: Arc::new(Inner {
                log_prefix,
                config,
                primary,
                alt,
                codec,
                namespaces,
                relocation_log,
                workers: WorkerPool::with_default_size("storage"),
            }),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &MetadataStorage {
        &self.inner.codec
    }

    pub fn namespaces(&self) -> &NamespaceManager {
        &self.inner.namespaces
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.inner.log_prefix
    }

    /// The namespace operations are currently directed to.
    pub fn namespace(&self) -> String {
        self.inner.primary.namespace()
    }

    /// Direct subsequent operations to the mail of `principal`.
    ///
    /// This affects every clone of this `MailStorage`. Returns the selected
    /// namespace.
    pub fn select_user(&self, principal: &str) -> Result<String, Error> {
        let namespace = self.inner.namespaces.user_namespace(principal)?;
        self.select_namespace(&namespace)?;
        if !principal.is_empty() {
            self.inner.log_prefix.set_principal(principal.to_owned());
        }
        Ok(namespace)
    }

    /// Direct subsequent operations to the shared namespace.
    pub fn select_public(&self) -> Result<String, Error> {
        let namespace = self.inner.namespaces.public_namespace().to_owned();
        self.select_namespace(&namespace)?;
        Ok(namespace)
    }

    pub fn select_namespace(&self, namespace: &str) -> Result<(), Error> {
        if !namespace.is_empty() && !is_safe_name(namespace) {
            return Err(Error::UnsafeName);
        }

        self.inner.primary.select(namespace);
        if let Some(ref alt) = self.inner.alt {
            alt.select(namespace);
        }
        self.inner.log_prefix.set_namespace(namespace.to_owned());
        Ok(())
    }

    /// Persist the metadata and content of `mail` in one batch.
    ///
    /// Content longer than the configured maximum write size is split into
    /// several writes within the batch.
    pub fn save(&self, mail: &mut MailObject) -> Result<(), Error> {
        let completion = self.submit_save(mail)?;
        let result = completion.wait();
        if result.is_ok() {
            finish_save(mail);
        }
        result
    }

    /// Submit a save without waiting for it.
    ///
    /// On failure to submit, the mail is returned with the error.
    pub fn save_async(
        &self,
        mail: MailObject,
    ) -> Result<PendingSave, (MailObject, Error)> {
        match self.submit_save(&mail) {
            Ok(completion) => Ok(PendingSave {
                mail: Some(mail),
                completion: Some(completion),
            }),
            Err(e) => Err((mail, e)),
        }
    }

    fn submit_save(
        &self,
        mail: &MailObject,
    ) -> Result<Completion<(), Error>, Error> {
        if let Some(key) = mail.missing_required() {
            return Err(Error::IncompleteMetadata(key.tag()));
        }

        let size = mail.content().len() as u64;
        if size > self.inner.config.max_object_size {
            return Err(Error::ObjectTooLarge(size));
        }

        let mut op = WriteOp::new();
        self.inner.codec.save_into(&mut op, mail);
        chunks::append_content(
            &mut op,
            mail.content(),
            self.inner.config.max_write_size,
        );

        // The handle is not held while the intent is appended; the write
        // goes to the namespace the intent names.
        let namespace = self.inner.primary.namespace();
        let intent =
            LogEntry::save(self.inner.primary.pool(), &namespace, mail.oid());
        if let Some(ref log) = self.inner.relocation_log {
            if let Err(e) = log.append_intent(&intent) {
                warn!(
                    "{} Failed to log save of {}: {}",
                    self.inner.log_prefix,
                    mail.oid(),
                    e
                );
            }
        }

        debug!(
            "{} Saving {} ({} bytes, {} steps)",
            self.inner.log_prefix,
            mail.oid(),
            size,
            op.len()
        );
        let completion = self
            .inner
            .primary
            .in_namespace(&namespace)
            .aio_operate(mail.oid(), op);

        let pending = mail.begin_op();
        let log = self.inner.relocation_log.clone();
        let log_prefix = self.inner.log_prefix.clone();
        Ok(completion.map(move |result| {
            drop(pending);
            match result {
                Ok(()) => {
                    if let Some(log) = log {
                        if let Err(e) = log.append_done(intent.destination()) {
                            warn!(
                                "{} Failed to mark save of {} done: {}",
                                log_prefix, intent.oid, e
                            );
                        }
                    }
                    Ok(())
                },
                Err(e) => {
                    error!(
                        "{} Save of {} failed: {}",
                        log_prefix, intent.oid, e
                    );
                    Err(Error::from_write(e))
                },
            }
        }))
    }

    /// Read the whole content of `oid`.
    pub fn read(&self, oid: &str) -> Result<Vec<u8>, Error> {
        self.read_async(oid).wait()
    }

    pub fn read_async(&self, oid: &str) -> Completion<Vec<u8>, Error> {
        self.inner
            .primary
            .current()
            .aio_read(oid, self.inner.config.max_object_size, 0)
            .map(|r| r.map_err(Error::from_read))
    }

    /// Read the content of `mail` and, if not yet loaded, its metadata.
    pub fn read_mail(&self, mail: &mut MailObject) -> Result<(), Error> {
        let content = self.read(mail.oid())?;
        self.load_metadata(mail, false)?;
        mail.set_content(content);
        Ok(())
    }

    pub fn stat(&self, oid: &str) -> Result<ObjectStat, Error> {
        self.stat_async(oid).wait()
    }

    pub fn stat_async(&self, oid: &str) -> Completion<ObjectStat, Error> {
        self.inner
            .primary
            .current()
            .aio_stat(oid)
            .map(|r| r.map_err(Error::from_read))
    }

    /// Fill in the content size and save timestamp of `mail` from its
    /// object.
    pub fn stat_mail(&self, mail: &mut MailObject) -> Result<(), Error> {
        let stat = self.stat(mail.oid())?;
        mail.set_content_size(stat.size);
        mail.set_save_timestamp(stat.mtime.timestamp());
        Ok(())
    }

    /// Delete `oid`. Deleting an object which does not exist succeeds.
    pub fn delete(&self, oid: &str) -> Result<(), Error> {
        self.inner
            .primary
            .current()
            .delete(oid)
            .ignore_not_found()
            .map_err(Error::from_write)
    }

    pub fn delete_mail(&self, mail: &MailObject) -> Result<(), Error> {
        self.delete(mail.oid())
    }

    /// Load the metadata of `mail`.
    ///
    /// If the object exists but has no metadata, `mail` is marked invalid
    /// and `NoMetadata` is returned.
    pub fn load_metadata(
        &self,
        mail: &mut MailObject,
        full_reload: bool,
    ) -> Result<(), Error> {
        let result = {
            let scope = self.inner.primary.current();
            self.inner.codec.load(&*scope, mail, full_reload)
        };

        if let Err(Error::NoMetadata) = result {
            mail.set_valid(false);
        }
        result
    }

    /// Load the metadata of many mails, with all reads in flight at once.
    ///
    /// Returns one result per mail, in order. Mails which already have
    /// metadata are not reloaded.
    pub fn load_metadata_many(
        &self,
        mails: &mut [MailObject],
    ) -> Vec<Result<(), Error>> {
        let mut xattr_reads = CompletionSet::<usize, Xattrs>::new();
        let mut map_reads = CompletionSet::<usize, MapEntries>::new();
        {
            let scope = self.inner.primary.current();
            for (ix, mail) in mails.iter().enumerate() {
                if !mail.has_metadata() {
                    xattr_reads.push(ix, scope.aio_get_xattrs(mail.oid()));
                    map_reads.push(ix, scope.aio_map_get(mail.oid(), None));
                }
            }
        }

        let mut results: Vec<Result<(), Error>> =
            mails.iter().map(|_| Ok(())).collect();
        for ((ix, xattrs), (_, map)) in
            xattr_reads.wait_all().into_iter().zip(map_reads.wait_all())
        {
            let decoded = xattrs
                .map_err(Error::from_read)
                .and_then(|xattrs| {
                    Ok((xattrs, map.map_err(Error::from_read)?))
                })
                .and_then(|(xattrs, map)| {
                    self.inner.codec.decode(xattrs, map)
                });

            let mail = &mut mails[ix];
            results[ix] = match decoded {
                Ok(decoded) => {
                    apply_decoded(decoded, mail);
                    Ok(())
                },
                Err(e) => {
                    if let Error::NoMetadata = e {
                        mail.set_valid(false);
                    }
                    Err(e)
                },
            };
        }

        results
    }

    /// Update one attribute of an already-saved mail.
    pub fn set_metadata(
        &self,
        mail: &mut MailObject,
        key: AttrKey,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let scope = self.inner.primary.current();
        self.inner.codec.set_single(&*scope, mail, key, value)
    }

    pub fn set_keyword(
        &self,
        mail: &mut MailObject,
        keyword: &str,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let scope = self.inner.primary.current();
        self.inner.codec.set_extended(&*scope, mail, keyword, value)
    }

    pub fn remove_keyword(
        &self,
        mail: &mut MailObject,
        keyword: &str,
    ) -> Result<(), Error> {
        let scope = self.inner.primary.current();
        self.inner.codec.remove_extended(&*scope, mail, keyword)
    }

    /// Best-effort rewrite of several attributes of `oid`.
    ///
    /// Returns whether the update was applied.
    pub fn update_metadata(
        &self,
        oid: &str,
        updates: &[(AttrKey, Vec<u8>)],
    ) -> Result<bool, Error> {
        let scope = self.inner.primary.current();
        self.inner.codec.update_batch(&*scope, oid, updates)
    }

    /// Atomically add `delta` to the counter `key` on `oid`, returning the
    /// new value.
    pub fn add_counter(
        &self,
        oid: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64, Error> {
        self.inner
            .primary
            .current()
            .atomic_add(oid, key, delta)
            .map_err(Error::from_write)
    }

    /// List the object ids in the current namespace.
    pub fn list_objects(&self) -> Result<Vec<String>, Error> {
        self.inner
            .primary
            .current()
            .list()
            .map_err(Error::from_read)
    }

    /// Move a mail between namespaces of the primary pool.
    ///
    /// The intent is durably logged before anything else happens, so if
    /// the relocation log cannot be written, the move fails without effect.
    pub fn move_mail(&self, request: &RelocationRequest) -> Result<(), Error> {
        let primary = &*self.inner.primary;
        self.relocation(request, primary, primary, Operation::Move)
            .run()
    }

    /// Copy a mail between namespaces of the primary pool.
    ///
    /// `request.delete_source` is ignored.
    pub fn copy_mail(&self, request: &RelocationRequest) -> Result<(), Error> {
        let request = RelocationRequest {
            delete_source: false,
            ..request.clone()
        };
        let primary = &*self.inner.primary;
        self.relocation(&request, primary, primary, Operation::Copy)
            .run()
    }

    pub fn move_async(
        &self,
        request: RelocationRequest,
    ) -> Completion<(), Error> {
        self.in_background(move |this| this.move_mail(&request))
    }

    pub fn copy_async(
        &self,
        request: RelocationRequest,
    ) -> Completion<(), Error> {
        self.in_background(move |this| this.copy_mail(&request))
    }

    /// Move `oid` in the current namespace from the primary to the alt pool.
    pub fn relocate_to_alt(&self, oid: &str) -> Result<(), Error> {
        let alt = self.inner.alt.as_ref().ok_or(Error::NoAltStorage)?;
        self.relocate_between(oid, &self.inner.primary, alt)
    }

    /// Move `oid` in the current namespace from the alt to the primary pool.
    pub fn relocate_from_alt(&self, oid: &str) -> Result<(), Error> {
        let alt = self.inner.alt.as_ref().ok_or(Error::NoAltStorage)?;
        self.relocate_between(oid, alt, &self.inner.primary)
    }

    /// Whether `oid` in the current namespace is in the alt pool.
    pub fn is_in_alt(&self, oid: &str) -> Result<bool, Error> {
        let alt = self.inner.alt.as_ref().ok_or(Error::NoAltStorage)?;
        let result = alt.current().stat(oid);
        match result {
            Ok(_) => Ok(true),
            Err(ChannelError::NotFound) => Ok(false),
            Err(e) => Err(Error::from_read(e)),
        }
    }

    fn relocate_between(
        &self,
        oid: &str,
        src: &ChannelHandle,
        dest: &ChannelHandle,
    ) -> Result<(), Error> {
        let namespace = self.namespace();
        let request = RelocationRequest::new(oid, &namespace, &namespace);
        self.relocation(&request, src, dest, Operation::Move).run()
    }

    /// Resolve every unfinished intent in the relocation log.
    pub fn replay_relocation_log(&self) -> Result<ReplayReport, Error> {
        let log = self
            .inner
            .relocation_log
            .as_ref()
            .ok_or(Error::NoRelocationLog)?;
        replay::replay(self, log)
    }

    pub(crate) fn relocation<'a>(
        &'a self,
        request: &'a RelocationRequest,
        src: &'a ChannelHandle,
        dest: &'a ChannelHandle,
        operation: Operation,
    ) -> Relocation<'a> {
        Relocation::new(
            &self.inner.log_prefix,
            &self.inner.codec,
            self.inner.relocation_log.as_ref(),
            src,
            dest,
            request,
            operation,
        )
    }

    pub(crate) fn handle_for_pool(
        &self,
        pool: &str,
    ) -> Result<&ChannelHandle, Error> {
        if self.inner.primary.pool() == pool {
            return Ok(&*self.inner.primary);
        }

        match self.inner.alt {
            Some(ref alt) if alt.pool() == pool => Ok(&**alt),
            _ => Err(Error::BadConfig(format!("unknown pool {}", pool))),
        }
    }

    /// Delete the destination of an intent, if it exists.
    pub(crate) fn discard(
        &self,
        destination: &Destination,
    ) -> Result<(), Error> {
        self.handle_for_pool(&destination.pool)?
            .in_namespace(&destination.namespace)
            .delete(&destination.oid)
            .ignore_not_found()
            .map_err(Error::from_write)
    }

    fn in_background(
        &self,
        f: impl FnOnce(&MailStorage) -> Result<(), Error> + Send + 'static,
    ) -> Completion<(), Error> {
        let (completion, completer) = Completion::new();
        let this = self.clone();
        self.inner.workers.execute(move || {
            if completer.is_cancelled() {
                completer.complete(Err(Error::Cancelled));
            } else {
                completer.complete(f(&this));
            }
        });
        completion
    }
}

fn finish_save(mail: &mut MailObject) {
    let size = mail.content().len() as u64;
    mail.set_content_size(size);
    mail.set_save_timestamp(Utc::now().timestamp());
}

impl PendingSave {
    pub fn mail(&self) -> Option<&MailObject> {
        self.mail.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.completion.as_ref().map_or(true, Completion::is_complete)
    }

    /// Wait for the save to finish, returning ownership of the mail.
    pub fn wait(mut self) -> (MailObject, Result<(), Error>) {
        let result = self
            .completion
            .take()
            .map_or(Ok(()), Completion::wait);
        // Both are always present until wait() or drop
        let mut mail = self.mail.take().unwrap_or_else(|| MailObject::new(""));
        if result.is_ok() {
            finish_save(&mut mail);
        }
        (mail, result)
    }
}

impl Drop for PendingSave {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.wait();
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::store::memory::{MemoryCluster, OpKind};
    use crate::support::storage_config::MetadataStorageKind;

    struct Setup {
        cluster: MemoryCluster,
        storage: MailStorage,
        root: TempDir,
    }

    fn config(root: &TempDir) -> StorageConfig {
        StorageConfig {
            pool: "mail".to_owned(),
            alt_pool: Some("alt".to_owned()),
            max_write_size: 16,
            max_object_size: 1024,
            relocation_log: Some(root.path().join("relocation.log")),
            ..StorageConfig::default()
        }
    }

    fn setup_with(f: impl FnOnce(&mut StorageConfig)) -> Setup {
        crate::init_test_log();

        let root = TempDir::new().unwrap();
        let cluster = MemoryCluster::new();
        let mut config = config(&root);
        f(&mut config);
        let storage = MailStorage::open(&cluster, config).unwrap();
        storage.select_user("alice").unwrap();

        Setup {
            cluster,
            storage,
            root,
        }
    }

    fn setup() -> Setup {
        setup_with(|_| ())
    }

    fn mail(oid: &str, content: &[u8]) -> MailObject {
        let mut mail = MailObject::new(oid);
        mail.add_metadata(AttrKey::Guid, format!("guid-{}", oid));
        mail.add_metadata(AttrKey::MailUid, "1");
        mail.add_metadata(AttrKey::MailboxGuid, "inbox");
        mail.add_extended_metadata("$Seen", "");
        mail.set_content(content.to_vec());
        mail
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn chunked_save_round_trip() {
        let setup = setup();
        // Shorter than, equal to, and 2.5 times the write size
        for &len in &[0usize, 5, 16, 40] {
            let oid = format!("len{}", len);
            let body = content(len);
            let mut saved = mail(&oid, &body);
            setup.storage.save(&mut saved).unwrap();
            assert_eq!(len as u64, saved.content_size());
            assert!(saved.save_timestamp().is_some());
            assert!(!saved.has_active_op());

            assert_eq!(body, setup.storage.read(&oid).unwrap());

            let mut loaded = MailObject::new(oid.clone());
            setup.storage.read_mail(&mut loaded).unwrap();
            assert_eq!(body, loaded.content());
            assert_eq!(saved.attributes(), loaded.attributes());
            assert_eq!(saved.extended(), loaded.extended());
        }

        // One batch per save, regardless of chunk count
        assert_eq!(4, setup.cluster.op_count(OpKind::Operate, "alice_u"));
    }

    #[test]
    fn resave_with_shorter_content_truncates() {
        let setup = setup();
        let mut m = mail("m", &content(40));
        setup.storage.save(&mut m).unwrap();
        m.set_content(b"short".to_vec());
        setup.storage.save(&mut m).unwrap();
        assert_eq!(b"short".to_vec(), setup.storage.read("m").unwrap());
    }

    #[test]
    fn save_rejects_incomplete_or_oversized() {
        let setup = setup();
        let mut m = MailObject::new("m");
        m.add_metadata(AttrKey::Guid, "g");
        assert_matches!(
            Err(Error::IncompleteMetadata('U')),
            setup.storage.save(&mut m)
        );

        let mut m = mail("big", &content(1025));
        assert_matches!(
            Err(Error::ObjectTooLarge(1025)),
            setup.storage.save(&mut m)
        );
        assert_eq!(0, setup.cluster.op_count(OpKind::Operate, "alice_u"));
    }

    #[test]
    fn failed_save_reports_write_failure() {
        let setup = setup();
        setup.cluster.inject_fault(
            OpKind::Operate,
            Some("m"),
            0,
            ChannelError::Failed(-28),
        );

        let mut m = mail("m", &content(40));
        assert_matches!(
            Err(Error::WriteFailed(-28)),
            setup.storage.save(&mut m)
        );
        assert!(!m.has_active_op());
        assert_eq!(None, m.save_timestamp());
        assert_matches!(Err(Error::NotFound), setup.storage.read("m"));
    }

    #[test]
    fn save_async_owns_mail_until_complete() {
        let setup = setup();
        let pending: Vec<PendingSave> = (0..8)
            .map(|i| {
                setup
                    .storage
                    .save_async(mail(&format!("m{}", i), &content(i * 10)))
                    .map_err(|(_, e)| e)
                    .unwrap()
            })
            .collect();

        for (i, pending) in pending.into_iter().enumerate() {
            let (mail, result) = pending.wait();
            result.unwrap();
            assert_eq!(format!("m{}", i), mail.oid());
            assert!(!mail.has_active_op());
            assert_eq!(
                content(i * 10),
                setup.storage.read(mail.oid()).unwrap()
            );
        }

        let (mail, e) = setup
            .storage
            .save_async(MailObject::new("nope"))
            .err()
            .unwrap();
        assert_eq!("nope", mail.oid());
        assert_matches!(Error::IncompleteMetadata('G'), e);
    }

    #[test]
    fn delete_is_idempotent() {
        let setup = setup();
        setup.storage.delete("never-existed").unwrap();
        setup.storage.delete("never-existed").unwrap();

        let mut m = mail("m", b"x");
        setup.storage.save(&mut m).unwrap();
        setup.storage.delete_mail(&m).unwrap();
        setup.storage.delete_mail(&m).unwrap();
        assert_matches!(Err(Error::NotFound), setup.storage.stat("m"));
    }

    #[test]
    fn stat_reports_size() {
        let setup = setup();
        let mut m = mail("m", &content(33));
        setup.storage.save(&mut m).unwrap();

        let mut loaded = MailObject::new("m");
        setup.storage.stat_mail(&mut loaded).unwrap();
        assert_eq!(33, loaded.content_size());
        assert!(loaded.save_timestamp().is_some());
    }

    #[test]
    fn bulk_metadata_load() {
        let setup = setup();
        for i in 0..5 {
            setup
                .storage
                .save(&mut mail(&format!("m{}", i), b"body"))
                .unwrap();
        }
        // An object without metadata
        setup
            .storage
            .inner
            .primary
            .current()
            .write_full("bare", b"raw")
            .unwrap();

        let mut mails: Vec<MailObject> = (0..5)
            .map(|i| MailObject::new(format!("m{}", i)))
            .chain(vec![MailObject::new("bare"), MailObject::new("absent")])
            .collect();
        let results = setup.storage.load_metadata_many(&mut mails);

        for i in 0..5 {
            results[i].as_ref().unwrap();
            assert_eq!(
                Some(format!("guid-m{}", i).as_str()),
                mails[i].attribute_str(AttrKey::Guid)
            );
            assert!(mails[i].is_valid());
        }
        assert_matches!(Err(Error::NoMetadata), &results[5]);
        assert!(!mails[5].is_valid());
        assert_matches!(Err(Error::NotFound), &results[6]);
        assert!(mails[6].is_valid());
    }

    #[test]
    fn load_metadata_marks_bare_object_invalid() {
        let setup = setup();
        setup
            .storage
            .inner
            .primary
            .current()
            .write_full("bare", b"raw")
            .unwrap();

        let mut m = MailObject::new("bare");
        assert_matches!(
            Err(Error::NoMetadata),
            setup.storage.load_metadata(&mut m, false)
        );
        assert!(!m.is_valid());
    }

    #[test]
    fn set_metadata_after_save() {
        for &kind in
            &[MetadataStorageKind::Default, MetadataStorageKind::Combined]
        {
            let setup = setup_with(|c| c.metadata_storage = kind);
            let mut m = mail("m", b"body");
            setup.storage.save(&mut m).unwrap();
            setup
                .storage
                .set_metadata(&mut m, AttrKey::MailUid, b"77".to_vec())
                .unwrap();
            setup
                .storage
                .set_metadata(&mut m, AttrKey::Pop3Uidl, b"uidl".to_vec())
                .unwrap();
            setup
                .storage
                .set_keyword(&mut m, "$Important", vec![])
                .unwrap();
            setup.storage.remove_keyword(&mut m, "$Seen").unwrap();

            let mut loaded = MailObject::new("m");
            setup.storage.load_metadata(&mut loaded, false).unwrap();
            assert_eq!(m.attributes(), loaded.attributes());
            assert_eq!(m.extended(), loaded.extended());
            assert_eq!(Some("77"), loaded.attribute_str(AttrKey::MailUid));

            assert!(setup
                .storage
                .update_metadata("m", &[(AttrKey::Flags, b"1".to_vec())])
                .unwrap());
            setup.storage.load_metadata(&mut loaded, true).unwrap();
            assert_eq!(Some("1"), loaded.attribute_str(AttrKey::Flags));
        }
    }

    #[test]
    fn counters_have_no_lost_updates() {
        let setup = setup();
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let storage = setup.storage.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        storage.add_counter("dict", "quota", 10).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(
            5000,
            setup.storage.add_counter("dict", "quota", 0).unwrap()
        );
    }

    #[test]
    fn move_and_copy_between_namespaces() {
        let setup = setup();
        let mut m = mail("m", b"hello");
        setup.storage.save(&mut m).unwrap();

        let request = RelocationRequest {
            src_principal: "alice".to_owned(),
            updates: vec![(AttrKey::OrigMailbox, b"Archive".to_vec())],
            ..RelocationRequest::new("m", "alice_u", "archive")
        };
        setup.storage.copy_mail(&request).unwrap();
        assert!(setup.cluster.exists("mail", "alice_u", "m"));
        assert!(setup.cluster.exists("mail", "archive", "m"));

        let request = RelocationRequest {
            dest_oid: "m2".to_owned(),
            ..request
        };
        setup.storage.move_async(request).wait().unwrap();
        assert!(!setup.cluster.exists("mail", "alice_u", "m"));
        let moved = setup.cluster.object("mail", "archive", "m2").unwrap();
        assert_eq!(b"hello".to_vec(), moved.data);
        assert_eq!(b"Archive".to_vec(), moved.xattrs["B"]);
        assert_eq!("alice_u", setup.storage.namespace());

        // Nothing left for replay
        let report = setup.storage.replay_relocation_log().unwrap();
        assert_eq!(0, report.discarded);
        assert!(report.moved.is_empty());
    }

    #[test]
    fn save_is_bracketed_by_log_lines() {
        let setup = setup();
        let mut m = mail("m", b"hello");
        setup.storage.save(&mut m).unwrap();

        let log =
            RelocationLog::open(setup.root.path().join("relocation.log"))
                .unwrap();
        let lines: Vec<String> = log
            .read_lines()
            .unwrap()
            .into_iter()
            .map(|l| l.unwrap().to_string())
            .collect();
        assert_eq!(vec!["save;mail;alice_u;m", "done;mail;alice_u;m"], lines);
    }

    #[test]
    fn clones_share_namespace_selection() {
        let setup = setup();
        let clone = setup.storage.clone();
        clone.select_public().unwrap();
        assert_eq!("public", setup.storage.namespace());

        let mut m = mail("m", b"hello");
        setup.storage.save(&mut m).unwrap();
        assert!(setup.cluster.exists("mail", "public", "m"));
    }

    #[test]
    fn move_onto_itself_keeps_mail() {
        let setup = setup();
        let mut m = mail("m", b"hello");
        setup.storage.save(&mut m).unwrap();

        let request = RelocationRequest::new("m", "alice_u", "alice_u");
        assert_matches!(
            Err(Error::RelocationInPlace),
            setup.storage.move_mail(&request)
        );
        assert_matches!(
            Err(Error::RelocationInPlace),
            setup.storage.copy_mail(&request)
        );
        assert_eq!(b"hello".to_vec(), setup.storage.read("m").unwrap());
    }

    #[test]
    fn alt_storage_round_trip() {
        let setup = setup();
        let mut m = mail("m", &content(20));
        setup.storage.save(&mut m).unwrap();

        setup.storage.relocate_to_alt("m").unwrap();
        assert!(!setup.cluster.exists("mail", "alice_u", "m"));
        assert!(setup.storage.is_in_alt("m").unwrap());
        assert_matches!(Err(Error::NotFound), setup.storage.read("m"));

        setup.storage.relocate_from_alt("m").unwrap();
        assert!(!setup.storage.is_in_alt("m").unwrap());
        assert_eq!(content(20), setup.storage.read("m").unwrap());
    }

    #[test]
    fn alt_storage_requires_alt_pool() {
        let setup = setup_with(|c| c.alt_pool = None);
        assert_matches!(
            Err(Error::NoAltStorage),
            setup.storage.relocate_to_alt("m")
        );
    }

    #[test]
    fn open_fails_if_log_unwritable() {
        let root = TempDir::new().unwrap();
        let log_path = root.path().join("log-dir");
        std::fs::create_dir(&log_path).unwrap();

        let config = StorageConfig {
            relocation_log: Some(log_path),
            ..config(&root)
        };
        assert_matches!(
            Err(Error::Io(_)),
            MailStorage::open(&MemoryCluster::new(), config).map(|_| ())
        );
    }

    #[test]
    fn namespace_selection() {
        let setup = setup_with(|c| c.generate_namespace = true);
        let ns = setup.storage.select_user("bob").unwrap();
        assert!(ns.ends_with("_u"));
        assert_eq!(ns, setup.storage.namespace());
        assert_eq!(ns, setup.storage.select_user("bob").unwrap());

        assert_eq!("public", setup.storage.select_public().unwrap());
        assert_eq!("users", setup.storage.select_user("").unwrap());
        assert_matches!(
            Err(Error::UnsafeName),
            setup.storage.select_namespace("a;b")
        );
    }

    #[test]
    fn generator_supplies_namespace_ids() {
        let root = TempDir::new().unwrap();
        let cluster = MemoryCluster::new();
        let config = StorageConfig {
            generate_namespace: true,
            ..config(&root)
        };
        let storage = MailStorage::open_with_generator(&cluster, config, || {
            "fixed".to_owned()
        })
        .unwrap();
        assert_eq!("fixed_u", storage.select_user("carol").unwrap());
        assert!(cluster.exists("mail", "cfg", "carol"));
    }
}
