//! Configuration types for mpool
//!
//! This module defines the settings shared by the pool object table and the
//! log engine. Every field has a default, so an empty TOML document is a
//! valid configuration.

use crate::error::{Error, Result};
use crate::types::SectorSize;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest flush set written as one unit (1 MiB).
///
/// Crash recovery scans at most this far past the logical end of a log, so
/// it must never change for existing media.
pub const MAX_FLUSH_SET_BYTES: usize = 1024 * 1024;

/// Size of one log page buffer
pub const LOG_PAGE_SIZE: usize = 4096;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pool (extent provider) configuration
    pub pool: PoolConfig,
    /// Log engine configuration
    pub mlog: MlogConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::invalid_argument(format!("bad configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        self.mlog.validate()
    }
}

/// Extent provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Directory holding one file per log
    pub data_dir: PathBuf,
    /// Sector size of newly allocated logs
    pub sector_size: SectorSize,
    /// Use direct I/O (`O_DIRECT` on Linux)
    pub direct_io: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/mpool"),
            sector_size: SectorSize::S4096,
            direct_io: false,
        }
    }
}

/// Log engine buffering configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlogConfig {
    /// Append buffer capacity, i.e. the largest flush set
    pub append_buffer_bytes: usize,
    /// Read-ahead buffer capacity
    pub read_buffer_bytes: usize,
}

impl Default for MlogConfig {
    fn default() -> Self {
        Self {
            append_buffer_bytes: MAX_FLUSH_SET_BYTES,
            read_buffer_bytes: MAX_FLUSH_SET_BYTES,
        }
    }
}

impl MlogConfig {
    /// Append buffer capacity in log pages
    #[must_use]
    pub const fn append_pages(&self) -> usize {
        self.append_buffer_bytes / LOG_PAGE_SIZE
    }

    /// Read buffer capacity in log pages
    #[must_use]
    pub const fn read_pages(&self) -> usize {
        self.read_buffer_bytes / LOG_PAGE_SIZE
    }

    /// Check buffer sizes
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("append_buffer_bytes", self.append_buffer_bytes),
            ("read_buffer_bytes", self.read_buffer_bytes),
        ] {
            if size == 0 || size % LOG_PAGE_SIZE != 0 {
                return Err(Error::invalid_argument(format!(
                    "{name} {size} is not a multiple of {LOG_PAGE_SIZE}"
                )));
            }
            if size > MAX_FLUSH_SET_BYTES {
                return Err(Error::invalid_argument(format!(
                    "{name} {size} exceeds {MAX_FLUSH_SET_BYTES}"
                )));
            }
        }
        Ok(())
    }
}
