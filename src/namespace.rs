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

//! Mapping of principals to the namespaces holding their mail.
//!
//! When namespace generation is enabled, each principal is assigned a random
//! namespace id the first time it is seen. The assignment is stored as a
//! small object, named after the principal, in the configuration namespace
//! of the primary pool. Assignments never change once written, so they are
//! cached for the life of the manager.
//!
//! Provisioning creates the mapping object exclusively. If another process
//! wins the race, its value is read back and used instead, so every process
//! converges on the single value held by the store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{info, warn};

use crate::mail::model::generate_oid;
use crate::store::{ChannelError, ChannelHandle, ChannelScope, WriteOp};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::safe_name::is_safe_principal;
use crate::support::storage_config::StorageConfig;

/// Upper bound on the size of a mapping object we are willing to read.
const MAX_MAPPING_SIZE: u64 = 1024;

type Generator = Box<dyn Fn() -> String + Send + Sync>;

pub struct NamespaceManager {
    log_prefix: LogPrefix,
    handle: Arc<ChannelHandle>,
    enabled: bool,
    config_namespace: String,
    user_namespace: String,
    suffix: String,
    public_namespace: String,
    cache: RwLock<HashMap<String, String>>,
    generator: Generator,
}

impl NamespaceManager {
    pub fn new(
        log_prefix: LogPrefix,
        handle: Arc<ChannelHandle>,
        config: &StorageConfig,
    ) -> Self {
        Self::with_generator(log_prefix, handle, config, Box::new(generate_oid))
    }

    /// Like `new()`, but with a custom source of fresh namespace ids.
    pub fn with_generator(
        log_prefix: LogPrefix,
        handle: Arc<ChannelHandle>,
        config: &StorageConfig,
        generator: Generator,
    ) -> Self {
        NamespaceManager {
            log_prefix,
            handle,
            enabled: config.generate_namespace,
            config_namespace: config.config_namespace.clone(),
            user_namespace: config.user_namespace.clone(),
            suffix: config.user_suffix.clone(),
            public_namespace: config.public_namespace.clone(),
            cache: RwLock::new(HashMap::new()),
            generator,
        }
    }

    /// Return the namespace id of `principal`, provisioning one if needed.
    ///
    /// The empty principal, and every principal when generation is disabled,
    /// maps to itself.
    pub fn lookup(&self, principal: &str) -> Result<String, Error> {
        if !is_safe_principal(principal) {
            return Err(Error::UnsafeName);
        }

        if principal.is_empty() || !self.enabled {
            return Ok(principal.to_owned());
        }

        if let Some(id) = self.cached(principal) {
            return Ok(id);
        }

        let scope = self.handle.in_namespace(&self.config_namespace);
        // Another thread may have finished provisioning while we waited for
        // the handle.
        if let Some(id) = self.cached(principal) {
            return Ok(id);
        }

        match read_mapping(&scope, principal) {
            Ok(id) => Ok(self.remember(principal, id)),
            Err(Error::NotFound) => self.provision_in(&scope, principal),
            Err(e) => Err(e),
        }
    }

    /// Assign a fresh namespace id to `principal` and persist it.
    ///
    /// If a mapping already exists, that mapping is returned instead.
    pub fn provision(&self, principal: &str) -> Result<String, Error> {
        if !is_safe_principal(principal) || principal.is_empty() {
            return Err(Error::UnsafeName);
        }

        let scope = self.handle.in_namespace(&self.config_namespace);
        self.provision_in(&scope, principal)
    }

    /// The namespace holding the mail of `principal`.
    pub fn user_namespace(&self, principal: &str) -> Result<String, Error> {
        if principal.is_empty() {
            return Ok(self.user_namespace.clone());
        }

        let mut namespace = self.lookup(principal)?;
        namespace.push_str(&self.suffix);
        Ok(namespace)
    }

    pub fn public_namespace(&self) -> &str {
        &self.public_namespace
    }

    fn cached(&self, principal: &str) -> Option<String> {
        self.cache.read().unwrap().get(principal).cloned()
    }

    fn remember(&self, principal: &str, id: String) -> String {
        self.cache
            .write()
            .unwrap()
            .entry(principal.to_owned())
            .or_insert(id)
            .clone()
    }

    fn provision_in(
        &self,
        scope: &ChannelScope<'_>,
        principal: &str,
    ) -> Result<String, Error> {
        let id = (self.generator)();
        let mut op = WriteOp::new();
        op.create(true).write_full(id.clone().into_bytes());

        match scope.operate(principal, op) {
            Ok(()) => {
                info!(
                    "{} Provisioned namespace {} for {}",
                    self.log_prefix, id, principal
                );
                Ok(self.remember(principal, id))
            },
            Err(ChannelError::AlreadyExists) => {
                warn!(
                    "{} Lost namespace provisioning race for {}",
                    self.log_prefix, principal
                );
                let id = read_mapping(scope, principal)?;
                Ok(self.remember(principal, id))
            },
            Err(e) => Err(Error::from_write(e)),
        }
    }
}

fn read_mapping(
    scope: &ChannelScope<'_>,
    principal: &str,
) -> Result<String, Error> {
    let data = scope
        .read(principal, MAX_MAPPING_SIZE, 0)
        .map_err(Error::from_read)?;
    let id = String::from_utf8(data).map_err(|_| {
        Error::MalformedMetadata(format!(
            "namespace mapping for {} is not UTF-8",
            principal
        ))
    })?;
    let id = id.trim();

    if id.is_empty() {
        return Err(Error::MalformedMetadata(format!(
            "empty namespace mapping for {}",
            principal
        )));
    }

    Ok(id.to_owned())
}
