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

//! Persistence of mail objects in a clustered object store.
//!
//! Each mail is one object holding the raw message as payload and its
//! metadata as extended attributes or map entries. `MailStorage` is the
//! entry point; it saves, reads and relocates mails through an
//! `ObjectStoreChannel` and keeps a write-ahead log so that interrupted
//! relocations can be resolved after a crash.

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod mail;
pub mod namespace;
pub mod relocation_log;
pub mod storage;
pub mod store;
pub mod support;

pub use crate::mail::{AttrKey, MailObject, MutabilityPolicy};
pub use crate::relocation_log::ReplayReport;
pub use crate::storage::{
    MailStorage, MoveState, PendingSave, RelocationRequest,
};
pub use crate::support::error::Error;
pub use crate::support::storage_config::StorageConfig;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}][{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message,
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply()
            .unwrap();
    })
}
