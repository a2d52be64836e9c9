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

//! Translation between a mail's metadata and the physical representation on
//! its object.
//!
//! Two layouts exist. The default layout (`DefaultCodec`) stores every field
//! as its own physical attribute, named by the field's tag, and every
//! extended attribute as an entry in the object's map. The combined layout
//! (`CombinedCodec`) folds all fields which the mutability policy does not
//! name into one JSON attribute, so that loading metadata reads far fewer
//! attributes, while still allowing the mutable fields to be rewritten
//! without touching the blob.
//!
//! Codecs never submit I/O for a save themselves; `save_into()` only appends
//! steps to a `WriteOp` so that the engine can send metadata and content in
//! one batch. The single-field update operations do perform their own I/O,
//! since they are used on objects which are already persisted.

use std::collections::BTreeMap;

use log::warn;

use super::model::{AttrKey, MailObject};
use crate::store::{MapEntries, ObjectStoreChannel, WriteOp, Xattrs};
use crate::support::error::Error;
use crate::support::storage_config::{MetadataStorageKind, StorageConfig};

mod combined;
mod default;

pub use self::combined::{CombinedCodec, COMBINED_XATTR};
pub use self::default::DefaultCodec;

/// Metadata extracted from an object's physical representation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedMetadata {
    pub attributes: BTreeMap<AttrKey, Vec<u8>>,
    pub extended: BTreeMap<String, Vec<u8>>,
}

impl DecodedMetadata {
    fn apply_to(self, mail: &mut MailObject) {
        mail.clear_metadata();
        for (key, value) in self.attributes {
            mail.add_metadata(key, value);
        }
        for (key, value) in self.extended {
            mail.add_extended_metadata(key, value);
        }
    }
}

pub trait MetadataCodec {
    /// Append the steps which persist all of `mail`'s metadata to `op`.
    fn save_into(&self, op: &mut WriteOp, mail: &MailObject);

    /// Interpret the raw attributes and map of an object.
    ///
    /// Fails with `NoMetadata` if there are no physical attributes at all,
    /// which means the object exists but is not a persisted mail.
    fn decode(
        &self,
        xattrs: Xattrs,
        map: MapEntries,
    ) -> Result<DecodedMetadata, Error>;

    /// Update one field of an already-persisted mail, both on the object and
    /// in `mail`.
    ///
    /// The in-memory metadata of `mail` must be current, since some layouts
    /// rewrite other fields from it.
    fn set_single(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: AttrKey,
        value: Vec<u8>,
    ) -> Result<(), Error>;

    /// Update one extended attribute of an already-persisted mail.
    fn set_extended(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), Error>;

    /// Remove one extended attribute of an already-persisted mail.
    fn remove_extended(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: &str,
    ) -> Result<(), Error>;

    /// Populate the metadata of `mail` from its object.
    ///
    /// This does nothing if `mail` already has metadata, unless
    /// `full_reload` is set. On failure, `mail` is left unchanged.
    fn load(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        full_reload: bool,
    ) -> Result<(), Error> {
        if !full_reload && mail.has_metadata() {
            return Ok(());
        }

        let xattrs = channel.aio_get_xattrs(mail.oid());
        let map = channel.aio_map_get(mail.oid(), None);
        let xattrs = xattrs.wait().map_err(Error::from_read)?;
        let map = map.wait().map_err(Error::from_read)?;

        self.decode(xattrs, map)?.apply_to(mail);
        Ok(())
    }

    /// Merge `updates` into the persisted metadata of `oid` and rewrite it.
    fn update_attributes(
        &self,
        channel: &dyn ObjectStoreChannel,
        oid: &str,
        updates: &[(AttrKey, Vec<u8>)],
    ) -> Result<(), Error> {
        let mut mail = MailObject::new(oid);
        self.load(channel, &mut mail, true)?;
        for &(key, ref value) in updates {
            mail.add_metadata(key, value.clone());
        }

        let mut op = WriteOp::new();
        self.save_into(&mut op, &mail);
        channel.operate(oid, op).map_err(Error::from_write)
    }

    /// Best-effort form of `update_attributes()`.
    ///
    /// Returns whether the update was applied. Only failures which cannot be
    /// cured by trying again (such as the object having no metadata) are
    /// returned as errors.
    fn update_batch(
        &self,
        channel: &dyn ObjectStoreChannel,
        oid: &str,
        updates: &[(AttrKey, Vec<u8>)],
    ) -> Result<bool, Error> {
        match self.update_attributes(channel, oid, updates) {
            Ok(()) => Ok(true),
            Err(e) if e.is_recoverable() => {
                warn!("Failed to update metadata of {}: {}", oid, e);
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }
}

/// The metadata layout selected by configuration.
#[derive(Clone, Debug)]
pub enum MetadataStorage {
    Default(DefaultCodec),
    Combined(CombinedCodec),
}

impl MetadataStorage {
    pub fn from_config(config: &StorageConfig) -> Result<Self, Error> {
        Ok(match config.metadata_storage {
            MetadataStorageKind::Default => {
                MetadataStorage::Default(DefaultCodec)
            },
            MetadataStorageKind::Combined => MetadataStorage::Combined(
                CombinedCodec::new(config.mutability_policy()?),
            ),
        })
    }

    fn codec(&self) -> &dyn MetadataCodec {
        match *self {
            MetadataStorage::Default(ref c) => c,
            MetadataStorage::Combined(ref c) => c,
        }
    }
}

impl MetadataCodec for MetadataStorage {
    fn save_into(&self, op: &mut WriteOp, mail: &MailObject) {
        self.codec().save_into(op, mail)
    }

    fn decode(
        &self,
        xattrs: Xattrs,
        map: MapEntries,
    ) -> Result<DecodedMetadata, Error> {
        self.codec().decode(xattrs, map)
    }

    fn set_single(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: AttrKey,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        self.codec().set_single(channel, mail, key, value)
    }

    fn set_extended(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        self.codec().set_extended(channel, mail, key, value)
    }

    fn remove_extended(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: &str,
    ) -> Result<(), Error> {
        self.codec().remove_extended(channel, mail, key)
    }
}

/// Apply `mail`'s decoded metadata, used by bulk loads which fetch the raw
/// representation themselves.
pub(crate) fn apply_decoded(decoded: DecodedMetadata, mail: &mut MailObject) {
    decoded.apply_to(mail);
}
