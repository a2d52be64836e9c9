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

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::{DecodedMetadata, MetadataCodec};
use crate::mail::model::{AttrKey, MailObject, MutabilityPolicy, KEYWORDS_TAG};
use crate::store::{MapEntries, ObjectStoreChannel, WriteOp, Xattrs};
use crate::support::error::Error;

/// The name of the physical attribute holding the combined blob.
pub const COMBINED_XATTR: &str = "meta";

/// Values which are not valid UTF-8 are wrapped in an object with this key.
const BASE64_KEY: &str = "base64";

/// Immutable fields in one JSON attribute, mutable fields stored as under
/// `DefaultCodec`.
///
/// The blob is a JSON object keyed by tag. If keywords are not mutable, they
/// are nested as an object under the `K` key instead of being written to the
/// object map. When a field exists both in the blob and as its own attribute
/// (as happens after the mutability policy changes), the individual
/// attribute wins.
#[derive(Clone, Debug)]
pub struct CombinedCodec {
    policy: MutabilityPolicy,
}

impl CombinedCodec {
    pub fn new(policy: MutabilityPolicy) -> Self {
        CombinedCodec { policy }
    }

    pub fn policy(&self) -> &MutabilityPolicy {
        &self.policy
    }

    fn blob(
        &self,
        attributes: &BTreeMap<AttrKey, Vec<u8>>,
        extended: &BTreeMap<String, Vec<u8>>,
    ) -> Vec<u8> {
        let mut root = Map::new();
        for (&key, value) in attributes {
            if !self.policy.is_mutable(key) {
                root.insert(key.name(), encode_value(value));
            }
        }

        if !self.policy.keywords_mutable() && !extended.is_empty() {
            root.insert(
                KEYWORDS_TAG.to_string(),
                Value::Object(
                    extended
                        .iter()
                        .map(|(k, v)| (k.clone(), encode_value(v)))
                        .collect(),
                ),
            );
        }

        Value::Object(root).to_string().into_bytes()
    }

    fn write_blob(
        &self,
        channel: &dyn ObjectStoreChannel,
        oid: &str,
        attributes: &BTreeMap<AttrKey, Vec<u8>>,
        extended: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error> {
        channel
            .set_xattr(oid, COMBINED_XATTR, &self.blob(attributes, extended))
            .map_err(Error::from_write)
    }
}

impl MetadataCodec for CombinedCodec {
    fn save_into(&self, op: &mut WriteOp, mail: &MailObject) {
        op.set_xattr(
            COMBINED_XATTR.to_owned(),
            self.blob(mail.attributes(), mail.extended()),
        );

        for (&key, value) in mail.attributes() {
            if self.policy.is_mutable(key) {
                op.set_xattr(key.name(), value.clone());
            }
        }

        if self.policy.keywords_mutable() {
            op.map_set(mail.extended().clone());
        }
    }

    fn decode(
        &self,
        xattrs: Xattrs,
        map: MapEntries,
    ) -> Result<DecodedMetadata, Error> {
        if xattrs.is_empty() {
            return Err(Error::NoMetadata);
        }

        let mut decoded = DecodedMetadata::default();
        if let Some(blob) = xattrs.get(COMBINED_XATTR) {
            decode_blob(blob, &mut decoded)?;
        }

        for (name, value) in xattrs {
            if let Some(key) = AttrKey::from_name(&name) {
                decoded.attributes.insert(key, value);
            }
        }

        decoded.extended.extend(map);
        Ok(decoded)
    }

    fn set_single(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: AttrKey,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        if self.policy.is_mutable(key) {
            channel
                .set_xattr(mail.oid(), &key.name(), &value)
                .map_err(Error::from_write)?;
        } else {
            let mut attributes = mail.attributes().clone();
            attributes.insert(key, value.clone());
            // An individual attribute left from an earlier policy would
            // shadow the blob.
            let mut op = WriteOp::new();
            op.set_xattr(
                COMBINED_XATTR.to_owned(),
                self.blob(&attributes, mail.extended()),
            )
            .remove_xattr(key.name());
            channel
                .operate(mail.oid(), op)
                .map_err(Error::from_write)?;
        }

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
        if self.policy.keywords_mutable() {
            let mut entries = MapEntries::new();
            entries.insert(key.to_owned(), value.clone());
            channel
                .map_set(mail.oid(), entries)
                .map_err(Error::from_write)?;
        } else {
            let mut extended = mail.extended().clone();
            extended.insert(key.to_owned(), value.clone());
            self.write_blob(channel, mail.oid(), mail.attributes(), &extended)?;
        }

        mail.add_extended_metadata(key, value);
        Ok(())
    }

    fn remove_extended(
        &self,
        channel: &dyn ObjectStoreChannel,
        mail: &mut MailObject,
        key: &str,
    ) -> Result<(), Error> {
        if self.policy.keywords_mutable() {
            channel
                .map_remove_keys(mail.oid(), &[key.to_owned()])
                .map_err(Error::from_write)?;
        } else {
            let mut extended = mail.extended().clone();
            extended.remove(key);
            // The key may also live in the map if keywords used to be
            // mutable.
            let mut op = WriteOp::new();
            op.set_xattr(
                COMBINED_XATTR.to_owned(),
                self.blob(mail.attributes(), &extended),
            )
            .map_remove_keys(vec![key.to_owned()]);
            channel
                .operate(mail.oid(), op)
                .map_err(Error::from_write)?;
        }

        mail.remove_extended_metadata(key);
        Ok(())
    }
}

fn encode_value(value: &[u8]) -> Value {
    match std::str::from_utf8(value) {
        Ok(s) => Value::String(s.to_owned()),
        Err(_) => {
            let mut wrapped = Map::new();
            wrapped.insert(
                BASE64_KEY.to_owned(),
                Value::String(base64::encode(value)),
            );
            Value::Object(wrapped)
        },
    }
}

fn decode_value(name: &str, value: &Value) -> Result<Vec<u8>, Error> {
    match *value {
        Value::String(ref s) => Ok(s.clone().into_bytes()),
        Value::Object(ref o) => match o.get(BASE64_KEY) {
            Some(&Value::String(ref s)) => base64::decode(s).map_err(|_| {
                Error::MalformedMetadata(format!("bad base64 in '{}'", name))
            }),
            _ => Err(Error::MalformedMetadata(format!(
                "unexpected object in '{}'",
                name
            ))),
        },
        _ => Err(Error::MalformedMetadata(format!(
            "unexpected value type in '{}'",
            name
        ))),
    }
}

fn decode_blob(
    blob: &[u8],
    decoded: &mut DecodedMetadata,
) -> Result<(), Error> {
    let root = match serde_json::from_slice::<Value>(blob) {
        Ok(Value::Object(root)) => root,
        Ok(_) => {
            return Err(Error::MalformedMetadata(
                "metadata blob is not an object".to_owned(),
            ))
        },
        Err(e) => return Err(Error::MalformedMetadata(e.to_string())),
    };

    for (name, value) in &root {
        if name.chars().eq(std::iter::once(KEYWORDS_TAG)) {
            let keywords = match *value {
                Value::Object(ref keywords) => keywords,
                _ => {
                    return Err(Error::MalformedMetadata(
                        "keywords are not an object".to_owned(),
                    ))
                },
            };

            for (keyword, value) in keywords {
                decoded
                    .extended
                    .insert(keyword.clone(), decode_value(keyword, value)?);
            }
        } else if let Some(key) = AttrKey::from_name(name) {
            decoded.attributes.insert(key, decode_value(name, value)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::{MemoryCluster, OpKind};
    use crate::store::{ChannelError, WriteStep};

    fn codec(policy: &str) -> CombinedCodec {
        CombinedCodec::new(MutabilityPolicy::parse(policy).unwrap())
    }

    fn blob_of(op: &WriteOp) -> Value {
        op.steps()
            .iter()
            .find_map(|step| match *step {
                WriteStep::SetXattr(ref name, ref value)
                    if name == COMBINED_XATTR =>
                {
                    Some(serde_json::from_slice(value).unwrap())
                },
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn immutable_fields_go_to_blob() {
        let mut mail = MailObject::new("m");
        mail.add_metadata(AttrKey::Guid, "g");
        mail.add_metadata(AttrKey::MailUid, "3");
        mail.add_metadata(AttrKey::ReceivedTime, vec![0xFF, 0x00]);
        mail.add_extended_metadata("$Seen", "");

        let mut op = WriteOp::new();
        codec("MU").save_into(&mut op, &mail);
        let blob = blob_of(&op);
        assert_eq!(Some("g"), blob["G"].as_str());
        assert_eq!(Some("/wA="), blob["R"]["base64"].as_str());
        assert_eq!(Value::Null, blob["U"]);
        assert_eq!(Some(""), blob["K"]["$Seen"].as_str());
        assert!(op
            .steps()
            .contains(&WriteStep::SetXattr("U".to_owned(), b"3".to_vec())));
        assert!(!op
            .steps()
            .iter()
            .any(|s| matches!(*s, WriteStep::MapSet(_))));
    }

    #[test]
    fn blob_written_even_if_everything_mutable() {
        let mut mail = MailObject::new("m");
        mail.add_metadata(AttrKey::Guid, "g");

        let mut op = WriteOp::new();
        codec("GK").save_into(&mut op, &mail);
        assert_eq!(Value::Object(Map::new()), blob_of(&op));
        assert_eq!(2, op.len());
    }

    #[test]
    fn individual_xattr_wins_over_blob() {
        let mut xattrs = Xattrs::new();
        xattrs.insert(
            COMBINED_XATTR.to_owned(),
            br#"{"G":"from-blob","U":"1"}"#.to_vec(),
        );
        xattrs.insert("U".to_owned(), b"2".to_vec());

        let decoded = codec("").decode(xattrs, MapEntries::new()).unwrap();
        assert_eq!(b"from-blob".to_vec(), decoded.attributes[&AttrKey::Guid]);
        assert_eq!(b"2".to_vec(), decoded.attributes[&AttrKey::MailUid]);
    }

    #[test]
    fn set_single_clears_shadowing_attribute() {
        let channel = MemoryCluster::new().channel("pool");
        let mut mail = MailObject::new("m");
        mail.add_metadata(AttrKey::Guid, "g");
        mail.add_metadata(AttrKey::MailUid, "1");

        // Saved while U was mutable, then U became immutable
        let mut op = WriteOp::new();
        codec("U").save_into(&mut op, &mail);
        channel.operate("m", op).unwrap();

        let codec = codec("");
        codec
            .set_single(&*channel, &mut mail, AttrKey::MailUid, b"2".to_vec())
            .unwrap();

        let mut reloaded = MailObject::new("m");
        codec.load(&*channel, &mut reloaded, true).unwrap();
        assert_eq!(Some("2"), reloaded.attribute_str(AttrKey::MailUid));
        assert!(!channel.get_xattrs("m").unwrap().contains_key("U"));
    }

    #[test]
    fn removing_immutable_keyword_clears_map_entry() {
        let channel = MemoryCluster::new().channel("pool");
        let mut mail = MailObject::new("m");
        mail.add_metadata(AttrKey::Guid, "g");
        mail.add_extended_metadata("$Seen", "");

        // Saved while keywords were mutable
        let mut op = WriteOp::new();
        codec("K").save_into(&mut op, &mail);
        channel.operate("m", op).unwrap();

        let codec = codec("");
        codec.remove_extended(&*channel, &mut mail, "$Seen").unwrap();

        let mut reloaded = MailObject::new("m");
        codec.load(&*channel, &mut reloaded, true).unwrap();
        assert!(reloaded.extended().is_empty());
    }

    #[test]
    fn failed_keyword_removal_is_reported() {
        let cluster = MemoryCluster::new();
        let channel = cluster.channel("pool");
        let codec = codec("");
        let mut mail = MailObject::new("m");
        mail.add_metadata(AttrKey::Guid, "g");
        mail.add_extended_metadata("$Seen", "");
        let mut op = WriteOp::new();
        codec.save_into(&mut op, &mail);
        channel.operate("m", op).unwrap();

        cluster.inject_fault(
            OpKind::Operate,
            Some("m"),
            0,
            ChannelError::Failed(-5),
        );
        assert_matches!(
            Err(Error::WriteFailed(-5)),
            codec.remove_extended(&*channel, &mut mail, "$Seen")
        );
        assert!(mail.extended().contains_key("$Seen"));
    }

    #[test]
    fn malformed_blob_rejected() {
        for blob in &[
            &b"not json"[..],
            br#"["G"]"#,
            br#"{"G":5}"#,
            br#"{"G":{"base64":"!!!"}}"#,
            br#"{"K":"x"}"#,
        ] {
            let mut xattrs = Xattrs::new();
            xattrs.insert(COMBINED_XATTR.to_owned(), blob.to_vec());
            assert_matches!(
                Err(Error::MalformedMetadata(_)),
                codec("").decode(xattrs, MapEntries::new())
            );
        }
    }
}
