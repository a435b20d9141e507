//! Engine configuration.
//!
//! Loading from files is left to the embedding process; every type here
//! round-trips through serde and falls back to its defaults for missing
//! fields.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_burrow::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::new("/var/lib/burrow")
//!     .with_partition_window(Duration::from_secs(600))
//!     .with_compaction_threads(2);
//! ```

use crate::error::{BurrowError, Result};
pub use crate::storage::SyncMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default partition window (1 hour).
pub const DEFAULT_PARTITION_WINDOW: Duration = Duration::from_secs(3600);

/// Default bloom filter sizing for the record id index.
pub const DEFAULT_BLOOM_EXPECTED_ITEMS: usize = 10_000;

/// Default compaction debounce (500 ms).
pub const DEFAULT_COMPACTION_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default number of segments required before compacting.
pub const DEFAULT_MIN_SEGMENTS: usize = 4;

/// Default number of compaction threads.
pub const DEFAULT_COMPACTION_THREADS: usize = 1;

/// Default first retry delay after a failed compaction (1 s).
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for the retry delay (60 s).
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Configuration for the storage engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for table data.
    pub data_dir: PathBuf,

    /// Width of a partition's time window.
    ///
    /// Records whose timestamps fall into the same window of the same stream
    /// share a partition. Default: 1 hour.
    #[serde(with = "duration_serde")]
    pub partition_window: Duration,

    /// Durability of data and descriptor files. Default: fsync.
    pub sync_mode: SyncMode,

    /// Expected record ids per update of the record id bloom index.
    pub bloom_expected_items: usize,

    /// Background compaction settings.
    pub compaction: CompactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            partition_window: DEFAULT_PARTITION_WINDOW,
            sync_mode: SyncMode::default(),
            bloom_expected_items: DEFAULT_BLOOM_EXPECTED_ITEMS,
            compaction: CompactionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration rooted at `data_dir` with default settings.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the partition window.
    pub fn with_partition_window(mut self, window: Duration) -> Self {
        self.partition_window = window;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the bloom index sizing.
    pub fn with_bloom_expected_items(mut self, items: usize) -> Self {
        self.bloom_expected_items = items;
        self
    }

    /// Replaces the compaction settings.
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Sets the number of compaction threads.
    pub fn with_compaction_threads(mut self, threads: usize) -> Self {
        self.compaction.threads = threads;
        self
    }

    /// Checks the settings for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.partition_window.is_zero() {
            return Err(BurrowError::Validation(
                "partition_window must be non-zero".to_string(),
            ));
        }
        if self.partition_window.as_nanos() > i64::MAX as u128 {
            return Err(BurrowError::Validation(
                "partition_window exceeds the timestamp range".to_string(),
            ));
        }
        self.compaction.validate()
    }
}

/// Configuration for background compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Window within which repeated requests for a partition collapse into
    /// one run.
    #[serde(with = "duration_serde")]
    pub debounce: Duration,

    /// Minimum number of compactable segments before a run writes a chunk.
    pub min_segments: usize,

    /// Number of worker threads.
    pub threads: usize,

    /// Delay before the first retry of a failed run.
    #[serde(with = "duration_serde")]
    pub retry_base_delay: Duration,

    /// Upper bound for the retry delay.
    #[serde(with = "duration_serde")]
    pub retry_max_delay: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_COMPACTION_DEBOUNCE,
            min_segments: DEFAULT_MIN_SEGMENTS,
            threads: DEFAULT_COMPACTION_THREADS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl CompactionConfig {
    /// Sets the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the minimum number of segments per run.
    pub fn with_min_segments(mut self, min_segments: usize) -> Self {
        self.min_segments = min_segments;
        self
    }

    /// Sets the number of worker threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the retry backoff bounds.
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    /// Delay before retry number `attempt` (1-based), doubling from the base
    /// delay up to the maximum.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }

    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(BurrowError::Validation(
                "compaction.threads must be at least 1".to_string(),
            ));
        }
        if self.min_segments == 0 {
            return Err(BurrowError::Validation(
                "compaction.min_segments must be at least 1".to_string(),
            ));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(BurrowError::Validation(
                "compaction.retry_base_delay exceeds retry_max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helpers for Duration serialization, in milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
