use std::path::Path;

use odb_pack::{PackConfig, WindowConfig};
use odb_store::LooseConfig;
use odb_types::ObjectFormat;
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::OdbResult;

/// Settings for an [`ObjectDatabase`](crate::ObjectDatabase).
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// object_format = "sha256"
///
/// [window]
/// mapped_limit = 1073741824
///
/// [pack]
/// verify_crc = true
///
/// [cache]
/// max_bytes = 67108864
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdbConfig {
    pub object_format: ObjectFormat,
    pub window: WindowConfig,
    pub pack: PackConfig,
    pub loose: LooseConfig,
    pub cache: CacheConfig,
    /// How many levels of `info/alternates` are followed.
    pub alternates_max_depth: usize,
    /// Shortest prefix, in hex digits, accepted by prefix lookups.
    pub min_prefix_len: usize,
    /// Re-hash every object read through the database.
    pub verify_hashes: bool,
}

impl Default for OdbConfig {
    fn default() -> Self {
        Self {
            object_format: ObjectFormat::Sha1,
            window: WindowConfig::default(),
            pack: PackConfig::default(),
            loose: LooseConfig::default(),
            cache: CacheConfig::default(),
            alternates_max_depth: 5,
            min_prefix_len: 4,
            verify_hashes: true,
        }
    }
}

impl OdbConfig {
    pub fn from_toml_str(text: &str) -> OdbResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> OdbResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
