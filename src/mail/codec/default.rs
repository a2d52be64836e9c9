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

use super::{DecodedMetadata, MetadataCodec};
use crate::mail::model::{AttrKey, MailObject};
use crate::store::{MapEntries, ObjectStoreChannel, WriteOp, Xattrs};
use crate::support::error::Error;

/// One physical attribute per field, extended attributes in the object map.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCodec;

impl MetadataCodec for DefaultCodec {
    fn save_into(&self, op: &mut WriteOp, mail: &MailObject) {
        for (&key, value) in mail.attributes() {
            op.set_xattr(key.name(), value.clone());
        }
        op.map_set(mail.extended().clone());
    }

    fn decode(
        &self,
        xattrs: Xattrs,
        map: MapEntries,
    ) -> Result<DecodedMetadata, Error> {
        if xattrs.is_empty() {
            return Err(Error::NoMetadata);
        }

        // Attributes which are not ours (e.g. left by other tools) are
        // ignored.
        let attributes = xattrs
            .into_iter()
            .filter_map(|(name, value)| {
                AttrKey::from_name(&name).map(|key| (key, value))
            })
            .collect();

        Ok(DecodedMetadata {
            attributes,
            extended: map,
        })
    }

    fn set_single(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: AttrKey,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        channel
            .set_xattr(mail.oid(), &key.name(), &value)
            .map_err(Error::from_write)?;
        mail.add_metadata(key, value);
        Ok(())
    }

    fn set_extended(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let mut entries = MapEntries::new();
        entries.insert(key.to_owned(), value.clone());
        channel
            .map_set(mail.oid(), entries)
            .map_err(Error::from_write)?;
        mail.add_extended_metadata(key, value);
        Ok(())
    }

    fn remove_extended(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: &str,
    ) -> Result<(), Error> {
        channel
            .map_remove_keys(mail.oid(), &[key.to_owned()])
            .map_err(Error::from_write)?;
        mail.remove_extended_metadata(key);
        Ok(())
    }
}
