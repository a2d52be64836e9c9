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

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use rand::{rngs::OsRng, Rng};

use crate::support::error::Error;

/// The fixed metadata fields of a stored mail.
///
/// Each key is identified on disk by a single-character tag, which is also
/// the name of the physical attribute holding it under the default layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttrKey {
    MailboxGuid,
    Guid,
    Pop3Uidl,
    Pop3Order,
    ReceivedTime,
    PhysicalSize,
    VirtualSize,
    Version,
    OrigMailbox,
    MailUid,
    FromEnvelope,
    Flags,
    PvtFlags,
}

/// The tag which designates keyword-style extended attributes in a
/// mutability policy and in the combined metadata blob.
pub const KEYWORDS_TAG: char = 'K';

impl AttrKey {
    pub const ALL: [AttrKey; 13] = [
        AttrKey::MailboxGuid,
        AttrKey::Guid,
        AttrKey::Pop3Uidl,
        AttrKey::Pop3Order,
        AttrKey::ReceivedTime,
        AttrKey::PhysicalSize,
        AttrKey::VirtualSize,
        AttrKey::Version,
        AttrKey::OrigMailbox,
        AttrKey::MailUid,
        AttrKey::FromEnvelope,
        AttrKey::Flags,
        AttrKey::PvtFlags,
    ];

    pub fn tag(self) -> char {
        match self {
            AttrKey::MailboxGuid => 'M',
            AttrKey::Guid => 'G',
            AttrKey::Pop3Uidl => 'P',
            AttrKey::Pop3Order => 'O',
            AttrKey::ReceivedTime => 'R',
            AttrKey::PhysicalSize => 'Z',
            AttrKey::VirtualSize => 'V',
            AttrKey::Version => 'I',
            AttrKey::OrigMailbox => 'B',
            AttrKey::MailUid => 'U',
            AttrKey::FromEnvelope => 'A',
            AttrKey::Flags => 'F',
            AttrKey::PvtFlags => 'C',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        AttrKey::ALL.iter().copied().find(|k| k.tag() == tag)
    }

    /// Parse a physical attribute name, which must be exactly one tag.
    pub fn from_name(name: &str) -> Option<Self> {
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(tag), None) => Self::from_tag(tag),
            _ => None,
        }
    }

    /// The name of the physical attribute holding this key.
    pub fn name(self) -> String {
        self.tag().to_string()
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Which fields may be updated independently of the rest of the metadata.
///
/// Under the combined layout, everything not named here is folded into one
/// JSON attribute, while the fields named here (and keywords, if
/// `keywords`) keep their own physical attribute or map entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutabilityPolicy {
    mutable: BTreeSet<AttrKey>,
    keywords: bool,
}

impl MutabilityPolicy {
    /// Parse a string of tags, such as `"MUFK"`.
    pub fn parse(tags: &str) -> Result<Self, Error> {
        let mut policy = MutabilityPolicy::default();
        for tag in tags.chars().filter(|c| !c.is_whitespace()) {
            if KEYWORDS_TAG == tag {
                policy.keywords = true;
            } else if let Some(key) = AttrKey::from_tag(tag) {
                policy.mutable.insert(key);
            } else {
                return Err(Error::BadConfig(format!(
                    "unknown metadata tag '{}'",
                    tag
                )));
            }
        }

        Ok(policy)
    }

    pub fn is_mutable(&self, key: AttrKey) -> bool {
        self.mutable.contains(&key)
    }

    pub fn keywords_mutable(&self) -> bool {
        self.keywords
    }
}

/// Generate a new random 128-bit identifier, rendered as 32 lowercase hex
/// digits.
pub fn generate_oid() -> String {
    format!("{:032x}", OsRng.gen::<u128>())
}

/// Count of asynchronous operations outstanding against a mail.
///
/// Clones share the same count. Each operation holds a `PendingOp` which
/// decrements the count when dropped, i.e., when the operation's completion
/// has been processed.
#[derive(Clone, Debug, Default)]
pub struct PendingOps(Arc<AtomicUsize>);

#[derive(Debug)]
pub struct PendingOp(Arc<AtomicUsize>);

impl PendingOps {
    pub fn begin(&self) -> PendingOp {
        self.0.fetch_add(1, SeqCst);
        PendingOp(Arc::clone(&self.0))
    }

    pub fn count(&self) -> usize {
        self.0.load(SeqCst)
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.0.fetch_sub(1, SeqCst);
    }
}

/// One stored message: identity, metadata, and content.
///
/// A mail with outstanding asynchronous writes is owned by whatever issued
/// them (see `MailStorage::save_async()`) until they complete, so it cannot
/// be dropped while `has_active_op()`.
#[derive(Debug)]
pub struct MailObject {
    oid: String,
    attributes: BTreeMap<AttrKey, Vec<u8>>,
    extended: BTreeMap<String, Vec<u8>>,
    content: Vec<u8>,
    content_size: u64,
    save_timestamp: Option<i64>,
    pending: PendingOps,
    valid: bool,
    has_index_reference: bool,
}

impl MailObject {
    pub fn new(oid: impl Into<String>) -> Self {
        MailObject {
            oid: oid.into(),
            attributes: BTreeMap::new(),
            extended: BTreeMap::new(),
            content: Vec::new(),
            content_size: 0,
            save_timestamp: None,
            pending: PendingOps::default(),
            valid: true,
            has_index_reference: false,
        }
    }

    /// Create a mail with a freshly generated object id.
    pub fn generate() -> Self {
        Self::new(generate_oid())
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    pub fn attribute(&self, key: AttrKey) -> Option<&[u8]> {
        self.attributes.get(&key).map(|v| &v[..])
    }

    /// Return the attribute as a string, if present and valid UTF-8.
    pub fn attribute_str(&self, key: AttrKey) -> Option<&str> {
        self.attribute(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn attributes(&self) -> &BTreeMap<AttrKey, Vec<u8>> {
        &self.attributes
    }

    pub fn add_metadata(&mut self, key: AttrKey, value: impl Into<Vec<u8>>) {
        self.attributes.insert(key, value.into());
    }

    pub fn remove_metadata(&mut self, key: AttrKey) -> Option<Vec<u8>> {
        self.attributes.remove(&key)
    }

    pub fn extended(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.extended
    }

    pub fn extended_value(&self, key: &str) -> Option<&[u8]> {
        self.extended.get(key).map(|v| &v[..])
    }

    pub fn add_extended_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) {
        self.extended.insert(key.into(), value.into());
    }

    pub fn remove_extended_metadata(&mut self, key: &str) -> Option<Vec<u8>> {
        self.extended.remove(key)
    }

    /// Whether any metadata has been set or loaded.
    pub fn has_metadata(&self) -> bool {
        !self.attributes.is_empty() || !self.extended.is_empty()
    }

    pub fn clear_metadata(&mut self) {
        self.attributes.clear();
        self.extended.clear();
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn set_content(&mut self, content: Vec<u8>) {
        self.content_size = content.len() as u64;
        self.content = content;
    }

    pub fn take_content(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.content)
    }

    /// The size of the content, which is known after a stat even if the
    /// content itself has not been read.
    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    pub fn set_content_size(&mut self, size: u64) {
        self.content_size = size;
    }

    pub fn save_timestamp(&self) -> Option<i64> {
        self.save_timestamp
    }

    pub fn set_save_timestamp(&mut self, timestamp: i64) {
        self.save_timestamp = Some(timestamp);
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.count()
    }

    pub fn has_active_op(&self) -> bool {
        self.pending.count() > 0
    }

    pub(crate) fn begin_op(&self) -> PendingOp {
        self.pending.begin()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn has_index_reference(&self) -> bool {
        self.has_index_reference
    }

    pub fn set_index_reference(&mut self, has_index_reference: bool) {
        self.has_index_reference = has_index_reference;
    }

    /// Return the first required attribute which is missing, if any.
    ///
    /// A mail must have a message guid and a mail uid to be persisted.
    pub fn missing_required(&self) -> Option<AttrKey> {
        [AttrKey::Guid, AttrKey::MailUid]
            .iter()
            .copied()
            .find(|k| !self.attributes.contains_key(k))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tags_are_unique_and_reversible() {
        let tags: BTreeSet<char> =
            AttrKey::ALL.iter().map(|k| k.tag()).collect();
        assert_eq!(AttrKey::ALL.len(), tags.len());
        assert!(!tags.contains(&KEYWORDS_TAG));

        for &key in &AttrKey::ALL {
            assert_eq!(Some(key), AttrKey::from_tag(key.tag()));
            assert_eq!(Some(key), AttrKey::from_name(&key.name()));
        }

        assert_eq!(None, AttrKey::from_name("GG"));
        assert_eq!(None, AttrKey::from_name(""));
        assert_eq!(None, AttrKey::from_name("K"));
    }

    #[test]
    fn parse_policy() {
        let policy = MutabilityPolicy::parse("MU FK").unwrap();
        assert!(policy.is_mutable(AttrKey::MailboxGuid));
        assert!(policy.is_mutable(AttrKey::MailUid));
        assert!(policy.is_mutable(AttrKey::Flags));
        assert!(!policy.is_mutable(AttrKey::Guid));
        assert!(policy.keywords_mutable());

        let policy = MutabilityPolicy::parse("").unwrap();
        assert!(!policy.keywords_mutable());
        assert!(AttrKey::ALL.iter().all(|&k| !policy.is_mutable(k)));

        assert_matches!(
            Err(Error::BadConfig(..)),
            MutabilityPolicy::parse("MQ")
        );
    }

    #[test]
    fn generated_oids_are_distinct_hex() {
        let a = generate_oid();
        let b = generate_oid();
        assert_eq!(32, a.len());
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn metadata_overwrites_by_key() {
        let mut mail = MailObject::new("oid");
        assert!(!mail.has_metadata());
        mail.add_metadata(AttrKey::MailUid, "1");
        mail.add_metadata(AttrKey::MailUid, "2");
        mail.add_extended_metadata("$Junk", "");
        mail.add_extended_metadata("$Junk", "1");

        assert_eq!(Some("2"), mail.attribute_str(AttrKey::MailUid));
        assert_eq!(Some(&b"1"[..]), mail.extended_value("$Junk"));
        assert_eq!(1, mail.attributes().len());
        assert_eq!(1, mail.extended().len());
        assert_eq!(Some(AttrKey::Guid), mail.missing_required());

        mail.add_metadata(AttrKey::Guid, "g");
        assert_eq!(None, mail.missing_required());

        mail.clear_metadata();
        assert!(!mail.has_metadata());
    }

    #[test]
    fn pending_ops_track_guards() {
        let mail = MailObject::new("oid");
        assert!(!mail.has_active_op());

        let a = mail.begin_op();
        let b = mail.begin_op();
        assert_eq!(2, mail.pending_ops());
        drop(a);
        assert!(mail.has_active_op());
        drop(b);
        assert_eq!(0, mail.pending_ops());
    }

    #[test]
    fn content_size_tracks_content() {
        let mut mail = MailObject::generate();
        mail.set_content(b"hello".to_vec());
        assert_eq!(5, mail.content_size());
        assert_eq!(b"hello".to_vec(), mail.take_content());
        assert_eq!(5, mail.content_size());
        assert!(mail.content().is_empty());
    }
}
