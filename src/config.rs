//! # Stage: Engine Configuration
//!
//! ## Responsibility
//! TOML-backed settings for storage, statistics defaults, conversion
//! verification and retention. Every section is optional; absent keys take
//! the defaults below.
//!
//! ```toml
//! [storage]
//! path = "experiments.db"
//! busy_timeout_ms = 5000
//!
//! [statistics]
//! confidence_level = 95.0
//! min_visitors = 30
//!
//! [conversions]
//! verify_allocation = true
//!
//! [retention]
//! days_to_keep = 90
//! interval_hours = 24
//! batch_size = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `":memory:"` opens a private in-memory database.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("experiments.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Significance target (percent) for tests created without one.
    pub confidence_level: f64,
    /// Visitors each group needs before the normal approximation is used.
    pub min_visitors: u32,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self { confidence_level: 95.0, min_visitors: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Reject conversions whose variant differs from the visitor's allocation.
    pub verify_allocation: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self { verify_allocation: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Allocations and conversions older than this are deleted.
    pub days_to_keep: u32,
    /// How often the periodic task runs.
    pub interval_hours: u64,
    /// Rows removed per delete transaction.
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days_to_keep: 90, interval_hours: 24, batch_size: 500 }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3_600)
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub statistics: StatisticsConfig,
    pub conversions: ConversionConfig,
    pub retention: RetentionConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.path.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig("storage.path must not be empty".into()));
        }
        let level = self.statistics.confidence_level;
        if !(level > 0.0 && level < 100.0) {
            return Err(EngineError::InvalidConfig(format!(
                "statistics.confidence_level must be in (0, 100), got {}",
                level
            )));
        }
        if self.statistics.min_visitors == 0 {
            return Err(EngineError::InvalidConfig("statistics.min_visitors must be >= 1".into()));
        }
        if self.retention.days_to_keep == 0 {
            return Err(EngineError::InvalidConfig("retention.days_to_keep must be >= 1".into()));
        }
        if self.retention.batch_size == 0 {
            return Err(EngineError::InvalidConfig("retention.batch_size must be >= 1".into()));
        }
        if self.retention.interval_hours == 0 {
            return Err(EngineError::InvalidConfig("retention.interval_hours must be >= 1".into()));
        }
        Ok(())
    }
}
