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

//! Namespace-scoped access to a shared channel.
//!
//! A channel has exactly one current namespace, but several components (the
//! engine's own operations, relocation, namespace lookups) need to direct
//! operations at different namespaces of the same pool. Every use of the
//! channel therefore goes through a `ChannelScope`, which holds the handle's
//! lock for its lifetime and, if it switched the namespace, restores the
//! previous one when dropped. Restoration thus happens on every exit path,
//! including early returns through `?` and unwinding.
//!
//! Scopes must not be nested on the same handle.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use super::ObjectStoreChannel;

pub struct ChannelHandle {
    channel: Arc<dyn ObjectStoreChannel>,
    pool: String,
    lock: Mutex<()>,
}

pub struct ChannelScope<'a> {
    channel: &'a dyn ObjectStoreChannel,
    restore: Option<String>,
    _lock: MutexGuard<'a, ()>,
}

impl ChannelHandle {
    pub fn new(channel: Arc<dyn ObjectStoreChannel>) -> Self {
        ChannelHandle {
            pool: channel.pool().to_owned(),
            channel,
            lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// The namespace operations in a `current()` scope are directed to.
    pub fn namespace(&self) -> String {
        let _lock = self.lock.lock().unwrap();
        self.channel.namespace()
    }

    /// Permanently change the current namespace.
    pub fn select(&self, namespace: &str) {
        let _lock = self.lock.lock().unwrap();
        self.channel.set_namespace(namespace);
    }

    /// Access the channel in its current namespace.
    pub fn current(&self) -> ChannelScope<'_> {
        ChannelScope {
            channel: &*self.channel,
            restore: None,
            _lock: self.lock.lock().unwrap(),
        }
    }

    /// Access the channel switched to `namespace`, restoring the current
    /// namespace when the scope ends.
    pub fn in_namespace(&self, namespace: &str) -> ChannelScope<'_> {
        let lock = self.lock.lock().unwrap();
        let previous = self.channel.namespace();
        let restore = if previous != namespace {
            self.channel.set_namespace(namespace);
            Some(previous)
        } else {
            None
        };

        ChannelScope {
            channel: &*self.channel,
            restore,
            _lock: lock,
        }
    }
}

impl<'a> Deref for ChannelScope<'a> {
    type Target = dyn ObjectStoreChannel + 'a;

    fn deref(&self) -> &Self::Target {
        self.channel
    }
}

impl Drop for ChannelScope<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            self.channel.set_namespace(&previous);
        }
    }
}
