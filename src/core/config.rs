//! Tunables for an FTL instance
//!
//! Every field has a default, so a configuration file only needs to name the
//! values it overrides:
//!
//! ```toml
//! erase_balance = 16
//! recent_capacity = 64
//! ```

use crate::error::{FtlError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest recent queue that still leaves a quarter to retain after a drain
pub const MIN_RECENT_CAPACITY: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtlConfig {
    /// Erase-count gap (max minus youngest used) that triggers wear leveling
    pub erase_balance: u32,

    /// Maximum wear-leveling relocations performed by one allocation
    pub wear_level_moves: u32,

    /// Capacity of the recent-free queue
    pub recent_capacity: usize,

    /// Number of highest-sn mapping candidates kept by the tag scan
    pub mapping_candidates: usize,

    /// Fall back to a raw pattern scan when no tagged snapshot validates
    pub legacy_scan: bool,

    /// Page mapping cache entries (0 disables the cache)
    pub page_map_cache: usize,

    /// Diagnostic journal ring size (clamped to what fits in a mapping block)
    pub journal_entries: usize,

    /// Fraction of physical pages advertised as sectors by the block device
    pub advertised_ratio: f64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        FtlConfig {
            erase_balance: 32,
            wear_level_moves: 1,
            recent_capacity: 32,
            mapping_candidates: 8,
            legacy_scan: true,
            page_map_cache: 16,
            journal_entries: 256,
            advertised_ratio: 0.8,
        }
    }
}

impl FtlConfig {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FtlConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.recent_capacity < MIN_RECENT_CAPACITY {
            return Err(FtlError::InvalidConfig(format!(
                "recent_capacity must be at least {}, got {}",
                MIN_RECENT_CAPACITY, self.recent_capacity
            )));
        }
        if self.mapping_candidates == 0 {
            return Err(FtlError::InvalidConfig(
                "mapping_candidates must be non-zero".to_string(),
            ));
        }
        if !(self.advertised_ratio > 0.0 && self.advertised_ratio <= 1.0) {
            return Err(FtlError::InvalidConfig(format!(
                "advertised_ratio must be in (0, 1], got {}",
                self.advertised_ratio
            )));
        }
        Ok(())
    }
}
