//! Per-bucket collections.
//!
//! A collection is a key prefix: with the default separator `:` the key
//! `beer:ale` belongs to the collection `beer`. A bucket created with
//! `collection_mode=strict` refuses document commands whose key does not
//! start with one of its collections.
//!
//! Bucket configuration keys:
//!
//! | key                    | value                                   |
//! |------------------------|-----------------------------------------|
//! | `collection_mode`      | `strict` or `off` (default `off`)       |
//! | `collection_separator` | separator string (default `:`)          |
//! | `collection_set`       | comma separated names, e.g. `beer,wine` |
//!
//! The set can be replaced at runtime with a JSON [`Manifest`].

use crate::config::parse_config;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Configuration keys read by [`Collections::init_from_bucket_config`].
pub const CONFIG_MODE: &str = "collection_mode";
pub const CONFIG_SEPARATOR: &str = "collection_separator";
pub const CONFIG_SET: &str = "collection_set";

/// Prefix shared by every collection configuration key.
pub const CONFIG_PREFIX: &str = "collection_";

pub const DEFAULT_SEPARATOR: &str = ":";

/// Longest collection name.
pub const MAX_NAME_LENGTH: usize = 30;

/// Most collections a bucket may hold.
pub const MAX_SET_SIZE: usize = 1000;

/// Longest separator.
pub const MAX_SEPARATOR_LENGTH: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollectionsError {
    #[error("malformed bucket configuration: {0}")]
    Config(String),

    #[error("unknown collection mode {0:?}")]
    InvalidMode(String),

    #[error("invalid collection separator {0:?}")]
    InvalidSeparator(String),

    #[error("collection name must not be empty")]
    EmptyName,

    #[error("collection name {0:?} is longer than {MAX_NAME_LENGTH} bytes")]
    NameTooLong(String),

    #[error("collection name {name:?} contains the separator {separator:?}")]
    ContainsSeparator { name: String, separator: String },

    #[error("collection {0:?} already exists")]
    AlreadyExists(String),

    #[error("more than {MAX_SET_SIZE} collections")]
    TooMany,

    #[error("malformed manifest: {0}")]
    Manifest(String),
}

/// A replacement collection set, sent as JSON:
///
/// ```json
/// {"separator": "::", "collections": ["beer", "wine"]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub separator: Option<String>,
    pub collections: Vec<String>,
}

impl Manifest {
    pub fn from_json(json: &[u8]) -> Result<Self, CollectionsError> {
        serde_json::from_slice(json).map_err(|e| CollectionsError::Manifest(e.to_string()))
    }
}

/// The collection settings of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collections {
    enabled: bool,
    separator: String,
    collections: HashSet<String>,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            enabled: false,
            separator: DEFAULT_SEPARATOR.to_string(),
            collections: HashSet::new(),
        }
    }
}

impl Collections {
    /// Builds the collections of a new bucket from its configuration string.
    pub fn from_bucket_config(config: &str) -> Result<Self, CollectionsError> {
        let mut collections = Self::default();
        collections.init_from_bucket_config(config)?;
        Ok(collections)
    }

    /// Applies the `collection_*` keys of a bucket configuration string.
    ///
    /// Other keys are ignored. Nothing changes unless every key is valid.
    pub fn init_from_bucket_config(&mut self, config: &str) -> Result<(), CollectionsError> {
        let entries = parse_config(config).map_err(|e| CollectionsError::Config(e.to_string()))?;
        let mut next = self.clone();

        if let Some(mode) = entries.get(CONFIG_MODE) {
            next.enabled = match mode.as_str() {
                "strict" => true,
                "off" => false,
                other => return Err(CollectionsError::InvalidMode(other.to_string())),
            };
        }

        if let Some(separator) = entries.get(CONFIG_SEPARATOR) {
            validate_separator(separator)?;
            next.separator = separator.clone();
        }

        if let Some(set) = entries.get(CONFIG_SET) {
            next.collections.clear();
            let mut names = HashSet::new();
            add_to_collection_set(&mut names, set);
            for name in names {
                next.add_collection(&name)?;
            }
        }

        *self = next;
        Ok(())
    }

    /// Replaces separator and set from a manifest.
    ///
    /// Nothing changes unless the whole manifest is valid.
    pub fn apply_manifest(&mut self, manifest: &Manifest) -> Result<(), CollectionsError> {
        let mut next = self.clone();
        if let Some(separator) = &manifest.separator {
            validate_separator(separator)?;
            next.separator = separator.clone();
        }
        next.collections.clear();
        for name in &manifest.collections {
            next.add_collection(name)?;
        }
        *self = next;
        Ok(())
    }

    pub fn add_collection(&mut self, name: &str) -> Result<(), CollectionsError> {
        self.validate_add(name)?;
        self.collections.insert(name.to_string());
        Ok(())
    }

    pub fn delete_collection(&mut self, name: &str) {
        self.collections.remove(name);
    }

    pub fn collection_exists(&self, name: &str) -> bool {
        self.collections.contains(name)
    }

    fn validate_add(&self, name: &str) -> Result<(), CollectionsError> {
        if name.is_empty() {
            return Err(CollectionsError::EmptyName);
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(CollectionsError::NameTooLong(name.to_string()));
        }
        if name.contains(self.separator.as_str()) {
            return Err(CollectionsError::ContainsSeparator {
                name: name.to_string(),
                separator: self.separator.clone(),
            });
        }
        if self.collection_exists(name) {
            return Err(CollectionsError::AlreadyExists(name.to_string()));
        }
        if self.collections.len() >= MAX_SET_SIZE {
            return Err(CollectionsError::TooMany);
        }
        Ok(())
    }

    /// True if the key starts with a known collection and the separator.
    pub fn is_key_prefixed_with_a_collection(&self, key: &[u8]) -> bool {
        let separator = self.separator.as_bytes();
        let Some(end) = key
            .windows(separator.len())
            .position(|window| window == separator)
        else {
            return false;
        };
        std::str::from_utf8(&key[..end])
            .map(|prefix| self.collections.contains(prefix))
            .unwrap_or(false)
    }

    /// True if a document command may use `key` in this bucket.
    pub fn accepts(&self, key: &[u8]) -> bool {
        !self.enabled || self.is_key_prefixed_with_a_collection(key)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// Adds the names of a comma separated list to `set`. Names are not
/// validated.
pub fn add_to_collection_set(set: &mut HashSet<String>, list: &str) {
    for name in list.split(',') {
        set.insert(name.to_string());
    }
}

fn validate_separator(separator: &str) -> Result<(), CollectionsError> {
    if separator.is_empty() || separator.len() > MAX_SEPARATOR_LENGTH {
        return Err(CollectionsError::InvalidSeparator(separator.to_string()));
    }
    Ok(())
}
