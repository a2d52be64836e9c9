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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::mail::model::MutabilityPolicy;
use crate::support::error::Error;
use crate::support::safe_name::is_safe_name;

/// The configuration for a storage engine instance.
///
/// This is normally embedded in the host mail server's configuration and
/// handed over as a TOML table; every field has a usable default.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// The pool holding mail objects.
    pub pool: String,

    /// If set, the pool used for alternate (typically slower and cheaper)
    /// storage. Objects are moved between the two with
    /// `MailStorage::relocate_to_alt()` and `relocate_from_alt()`.
    pub alt_pool: Option<String>,

    /// If true, principals are mapped to generated namespace ids which are
    /// persisted in `config_namespace`. If false, the principal name itself is
    /// used as the namespace id.
    pub generate_namespace: bool,

    /// The namespace used for the empty principal.
    pub user_namespace: String,

    /// Suffix appended to a principal's namespace id to form the namespace
    /// holding that principal's mail.
    pub user_suffix: String,

    /// The namespace for shared mailboxes.
    pub public_namespace: String,

    /// The namespace holding principal to namespace id mappings.
    pub config_namespace: String,

    /// How metadata is laid out on each object.
    pub metadata_storage: MetadataStorageKind,

    /// The attribute tags which are stored independently of the combined
    /// metadata blob. The tag `K` refers to keywords. Only meaningful when
    /// `metadata_storage` is `combined`.
    pub mutable_metadata: String,

    /// The largest number of bytes submitted in a single write. Larger
    /// contents are split into several writes within one batch.
    pub max_write_size: u64,

    /// The largest content which may be saved at all.
    pub max_object_size: u64,

    /// If set, move and copy intents are journalled to this file so that an
    /// interrupted relocation can be recovered.
    pub relocation_log: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataStorageKind {
    /// One physical attribute per field.
    Default,
    /// Immutable fields folded into one JSON attribute.
    Combined,
}

impl Default for MetadataStorageKind {
    fn default() -> Self {
        MetadataStorageKind::Default
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            pool: "mail_storage".to_owned(),
            alt_pool: None,
            generate_namespace: false,
            user_namespace: "users".to_owned(),
            user_suffix: "_u".to_owned(),
            public_namespace: "public".to_owned(),
            config_namespace: "cfg".to_owned(),
            metadata_storage: MetadataStorageKind::Default,
            mutable_metadata: "MUFK".to_owned(),
            max_write_size: 10 * 1024 * 1024,
            max_object_size: 128 * 1024 * 1024,
            relocation_log: None,
        }
    }
}

impl StorageConfig {
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: StorageConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), Error> {
        for name in [
            &self.pool,
            &self.user_namespace,
            &self.public_namespace,
            &self.config_namespace,
        ]
        .iter()
        {
            if !is_safe_name(name) {
                return Err(Error::UnsafeName);
            }
        }

        if let Some(ref alt_pool) = self.alt_pool {
            if !is_safe_name(alt_pool) {
                return Err(Error::UnsafeName);
            }
            if *alt_pool == self.pool {
                return Err(Error::BadConfig(
                    "alt_pool must differ from pool".to_owned(),
                ));
            }
        }

        if 0 == self.max_write_size || 0 == self.max_object_size {
            return Err(Error::BadConfig(
                "size limits must be non-zero".to_owned(),
            ));
        }

        if self.max_write_size > self.max_object_size {
            return Err(Error::BadConfig(
                "max_write_size exceeds max_object_size".to_owned(),
            ));
        }

        self.mutability_policy()?;
        Ok(())
    }

    pub fn mutability_policy(&self) -> Result<MutabilityPolicy, Error> {
        MutabilityPolicy::parse(&self.mutable_metadata)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = StorageConfig::from_toml("").unwrap();
        assert_eq!(StorageConfig::default(), config);
    }

    #[test]
    fn parses_full_config() {
        let config = StorageConfig::from_toml(
            r#"
pool = "mail"
alt_pool = "mail_alt"
generate_namespace = true
metadata_storage = "combined"
mutable_metadata = "UK"
max_write_size = 1024
max_object_size = 4096
relocation_log = "/var/lib/mail/relocation.log"
"#,
        )
        .unwrap();

        assert_eq!("mail", config.pool);
        assert_eq!(Some("mail_alt"), config.alt_pool.as_deref());
        assert!(config.generate_namespace);
        assert_eq!(MetadataStorageKind::Combined, config.metadata_storage);
        assert_eq!(1024, config.max_write_size);
        assert_eq!(
            Some(Path::new("/var/lib/mail/relocation.log")),
            config.relocation_log.as_deref()
        );
        // Untouched fields keep their defaults
        assert_eq!("cfg", config.config_namespace);
    }

    #[test]
    fn rejects_inconsistent_config() {
        assert_matches!(
            Err(Error::BadConfig(..)),
            StorageConfig::from_toml("max_write_size = 0")
        );
        assert_matches!(
            Err(Error::BadConfig(..)),
            StorageConfig::from_toml(
                "max_write_size = 100\nmax_object_size = 10"
            )
        );
        assert_matches!(
            Err(Error::UnsafeName),
            StorageConfig::from_toml("pool = \"a;b\"")
        );
        assert_matches!(
            Err(Error::BadConfig(..)),
            StorageConfig::from_toml("alt_pool = \"mail_storage\"")
        );
        assert_matches!(
            Err(Error::BadConfig(..)),
            StorageConfig::from_toml("mutable_metadata = \"U?\"")
        );
        assert_matches!(
            Err(Error::Toml(..)),
            StorageConfig::from_toml("metadata_storage = \"sideways\"")
        );
    }
}
