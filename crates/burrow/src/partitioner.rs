//! Time-window partitioning of streams.
//!
//! A partition covers one stream key over one aligned time window. The
//! partition key is the 160-bit hash of the stream key followed by the
//! window start, so every timestamp inside a window maps to the same key.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_burrow::partitioner::{partition_key_for, partition_keys_for};
//! use std::time::Duration;
//!
//! let hour = Duration::from_secs(3600);
//! let key = partition_key_for(b"cpu", now_ns, hour);
//! let keys = partition_keys_for(b"cpu", from_ns, until_ns, hour)?;
//! ```

use crate::error::{BurrowError, Result};
use crate::key::{Hash160, PartitionKey};
use std::collections::HashSet;
use std::time::Duration;

/// Nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// An aligned time window `[start_ts, start_ts + duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    /// Inclusive window start in nanoseconds.
    pub start_ts: Timestamp,
    /// Window length.
    pub duration: Duration,
}

impl TimeWindow {
    /// Creates a window starting at `start_ts`.
    pub fn new(start_ts: Timestamp, duration: Duration) -> Self {
        Self { start_ts, duration }
    }

    /// Exclusive window end in nanoseconds, saturated at `i64::MAX`.
    pub fn end_ts(&self) -> Timestamp {
        self.start_ts.saturating_add(window_nanos(self.duration))
    }

    /// Returns true if `ts` falls inside the window.
    pub fn contains(&self, ts: Timestamp) -> bool {
        let end = i128::from(self.start_ts) + i128::from(window_nanos(self.duration));
        ts >= self.start_ts && i128::from(ts) < end
    }
}

/// Partitioner bound to a fixed window size.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindowPartitioner {
    window: Duration,
}

impl TimeWindowPartitioner {
    /// Creates a partitioner. The window must be non-zero.
    pub fn new(window: Duration) -> Result<Self> {
        validate_window(window)?;
        Ok(Self { window })
    }

    /// Returns the configured window size.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns the window containing `time`.
    ///
    /// The window holding `i64::MIN` is cut short at `i64::MIN`.
    pub fn window_for(&self, time: Timestamp) -> TimeWindow {
        let nanos = window_nanos(self.window);
        let index = window_index(time, nanos);
        let start = window_start(index, nanos);
        let end = (index + 1) * i128::from(nanos);
        let duration = (end - i128::from(start)) as u64;
        TimeWindow::new(start, Duration::from_nanos(duration))
    }

    /// See [`partition_key_for`].
    pub fn key_for(&self, stream_key: &[u8], time: Timestamp) -> PartitionKey {
        partition_key_for(stream_key, time, self.window)
    }

    /// See [`partition_keys_for`].
    pub fn keys_for(
        &self,
        stream_key: &[u8],
        from: Timestamp,
        until: Timestamp,
    ) -> Result<Vec<PartitionKey>> {
        partition_keys_for(stream_key, from, until, self.window)
    }
}

/// Computes the partition key of `stream_key` at `time`.
///
/// Zero-length windows are treated as one nanosecond wide. The window
/// holding `i64::MIN` starts at `i64::MIN`.
pub fn partition_key_for(stream_key: &[u8], time: Timestamp, window: Duration) -> PartitionKey {
    let nanos = window_nanos(window).max(1);
    key_for_window(stream_key, window_start(window_index(time, nanos), nanos))
}

/// Returns the keys of every window overlapping `[from, until)` in time order.
///
/// # Errors
///
/// `InvalidRange` when `until < from`, `Validation` for a zero window.
pub fn partition_keys_for(
    stream_key: &[u8],
    from: Timestamp,
    until: Timestamp,
    window: Duration,
) -> Result<Vec<PartitionKey>> {
    if until < from {
        return Err(BurrowError::InvalidRange { from, until });
    }
    validate_window(window)?;
    if until == from {
        return Ok(Vec::new());
    }

    let nanos = window_nanos(window);
    let first = window_index(from, nanos);
    let last = window_index(until - 1, nanos);
    let mut seen = HashSet::new();
    let mut keys = Vec::new();

    let mut index = first;
    while index <= last {
        let key = key_for_window(stream_key, window_start(index, nanos));
        if seen.insert(key) {
            keys.push(key);
        }
        index += 1;
    }

    Ok(keys)
}

fn key_for_window(stream_key: &[u8], window_start: Timestamp) -> PartitionKey {
    Hash160::digest_parts(&[stream_key, &window_start.to_be_bytes()])
}

fn validate_window(window: Duration) -> Result<()> {
    if window_nanos(window) == 0 {
        return Err(BurrowError::Validation(
            "partition window must be non-zero".to_string(),
        ));
    }
    Ok(())
}

fn window_nanos(window: Duration) -> i64 {
    window.as_nanos().min(i64::MAX as u128) as i64
}

/// Floor of `timestamp / window_nanos`. `window_nanos` must be positive.
fn window_index(timestamp: Timestamp, window_nanos: i64) -> i128 {
    i128::from(timestamp).div_euclid(i128::from(window_nanos))
}

/// Start of the window at `index`, clamped to `i64::MIN`.
fn window_start(index: i128, window_nanos: i64) -> Timestamp {
    let start = index * i128::from(window_nanos);
    start.max(i128::from(i64::MIN)) as Timestamp
}
