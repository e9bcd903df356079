// Engine configuration.
//
// Configuration is an immutable struct handed to `Engine::open`. It can be
// loaded from a JSON file or built from `Default`; validation errors name
// the offending field.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

/// Transaction isolation levels supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}

/// Immutable engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for all database files.
    pub data_dir: PathBuf,
    /// Page size in bytes. Must be a power of two >= 4096.
    pub page_size: usize,
    /// Total buffer pool capacity, in pages.
    pub buffer_pool_size_pages: usize,
    /// Fraction of the pool reserved for the young region (0.1..0.9).
    pub buffer_pool_young_ratio: f64,
    /// Minimum residency in the old region before a re-access promotes a
    /// frame to the young region.
    pub old_block_time_ms: u64,
    /// Per-acquisition lock wait timeout.
    pub lock_wait_timeout_ms: u64,
    /// Isolation level assigned to transactions that do not request one.
    pub default_isolation: IsolationLevel,
    /// Interval between periodic fuzzy checkpoints.
    pub checkpoint_interval_ms: u64,
    /// Additional checkpoint trigger: WAL bytes written since the last
    /// checkpoint.
    pub checkpoint_log_bytes: u64,
    /// Bytes per WAL segment file before rotation.
    pub wal_segment_size: u64,
    /// Capacity of the doublewrite staging buffer, in pages.
    pub doublewrite_pages: usize,
    /// Executor safety limit, passed through to the query layer.
    pub recursive_cte_max_iterations: u64,
    /// Enables DDL change-log staging in the outer layers. The core only
    /// validates and stores the flag.
    pub enable_online_ddl: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: 16 * 1024,
            buffer_pool_size_pages: 1024,
            buffer_pool_young_ratio: 5.0 / 8.0,
            old_block_time_ms: 1000,
            lock_wait_timeout_ms: 10_000,
            default_isolation: IsolationLevel::RepeatableRead,
            checkpoint_interval_ms: 30_000,
            checkpoint_log_bytes: 64 * 1024 * 1024,
            wal_segment_size: 16 * 1024 * 1024,
            doublewrite_pages: 128,
            recursive_cte_max_iterations: 1000,
            enable_online_ddl: false,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a JSON file, falling back to defaults for
    /// absent fields.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| DbError::Config {
                field: path.display().to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field against its documented range, reporting the first
    /// failure by field name.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 4096 || self.page_size > 32768 || !self.page_size.is_power_of_two() {
            // The slot directory addresses the page with u16 offsets.
            return Err(Self::invalid(
                "page_size",
                "must be a power of two within 4096..=32768",
            ));
        }
        if self.buffer_pool_size_pages < 8 {
            return Err(Self::invalid(
                "buffer_pool_size_pages",
                "must be at least 8",
            ));
        }
        if !(0.1..=0.9).contains(&self.buffer_pool_young_ratio) {
            return Err(Self::invalid(
                "buffer_pool_young_ratio",
                "must be within 0.1..=0.9",
            ));
        }
        if self.lock_wait_timeout_ms == 0 {
            return Err(Self::invalid("lock_wait_timeout_ms", "must be non-zero"));
        }
        if self.wal_segment_size < 64 * 1024 {
            return Err(Self::invalid(
                "wal_segment_size",
                "must be at least 64 KiB",
            ));
        }
        if self.doublewrite_pages == 0 {
            return Err(Self::invalid("doublewrite_pages", "must be non-zero"));
        }
        if self.checkpoint_interval_ms == 0 && self.checkpoint_log_bytes == 0 {
            return Err(Self::invalid(
                "checkpoint_interval_ms",
                "at least one checkpoint trigger must be enabled",
            ));
        }
        Ok(())
    }

    fn invalid(field: &str, message: &str) -> DbError {
        DbError::Config {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    /// Number of pages in the young region for a given pool capacity.
    pub fn young_capacity(&self) -> usize {
        ((self.buffer_pool_size_pages as f64) * self.buffer_pool_young_ratio) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_reports_field_name() {
        let config = EngineConfig {
            buffer_pool_young_ratio: 0.95,
            ..Default::default()
        };
        match config.validate() {
            Err(DbError::Config { field, .. }) => {
                assert_eq!(field, "buffer_pool_young_ratio")
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_file_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"page_size": 32768, "old_block_time_ms": 250}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.page_size, 32768);
        assert_eq!(config.old_block_time_ms, 250);
        // Unspecified fields keep their defaults.
        assert_eq!(config.doublewrite_pages, 128);
    }

    #[test]
    fn test_from_file_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"page_size": 1000}"#).unwrap();
        assert!(EngineConfig::from_file(&path).is_err());
    }
}
