//! Compaction worker threads.
//!
//! Requests are debounced per partition by a [`CoalescingQueue`]; each of
//! the worker threads takes the next due partition and runs the
//! [`Compactor`] against it. A failed run is logged and the partition is
//! scheduled again with exponential backoff. Failures never stop a thread.

use super::compactor::{CompactionOutcome, Compactor};
use super::queue::CoalescingQueue;
use crate::config::CompactionConfig;
use crate::error::{BurrowError, Result};
use crate::key::PartitionKey;
use crate::metrics::EngineMetrics;
use crate::partition::PartitionSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

struct WorkerShared {
    queue: CoalescingQueue<PartitionKey>,
    source: Arc<dyn PartitionSource>,
    compactor: Compactor,
    config: CompactionConfig,
    metrics: Arc<EngineMetrics>,
    attempts: Mutex<HashMap<PartitionKey, u32>>,
}

/// Pool of threads compacting requested partitions.
pub struct CompactionWorker {
    shared: Arc<WorkerShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for CompactionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionWorker")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .field("pending", &self.shared.queue.len())
            .finish_non_exhaustive()
    }
}

impl CompactionWorker {
    /// Creates a stopped worker.
    pub fn new(
        source: Arc<dyn PartitionSource>,
        compactor: Compactor,
        config: CompactionConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                queue: CoalescingQueue::new(),
                source,
                compactor,
                config,
                metrics,
                attempts: Mutex::new(HashMap::new()),
            }),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawns the worker threads. Does nothing if already running.
    ///
    /// Requests made before the first start are kept and run once started.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.queue.reopen();

        let mut handles = self.handles.lock();
        for i in 0..self.shared.config.threads.max(1) {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("burrow-compaction-{}", i))
                .spawn(move || shared.run_loop());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    drop(handles);
                    self.stop();
                    return Err(err.into());
                }
            }
        }
        info!(
            threads = handles.len(),
            "Started compaction worker"
        );
        Ok(())
    }

    /// Stops the worker threads after their in-flight runs finish. Does
    /// nothing if not running.
    ///
    /// Pending requests are kept for a later [`start`](Self::start).
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.close();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("compaction").to_string();
            if handle.join().is_err() {
                error!("Compaction thread {} panicked", name);
            }
        }
        info!("Stopped compaction worker");
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests a compaction of `key` after the debounce window.
    ///
    /// Repeated requests within the window collapse into one run. Fails with
    /// [`BurrowError::WorkerStopped`] after [`stop`](Self::stop).
    pub fn request(&self, key: PartitionKey) -> Result<bool> {
        if self.shared.queue.is_closed() {
            return Err(BurrowError::WorkerStopped);
        }
        Ok(self.shared.queue.schedule(key, self.shared.config.debounce))
    }

    /// Number of partitions waiting for a run.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns true if a run for `key` is waiting or in progress.
    pub fn is_scheduled(&self, key: &PartitionKey) -> bool {
        self.shared.queue.is_scheduled(key)
    }

    /// Consecutive failed runs of `key`.
    pub fn failed_attempts(&self, key: &PartitionKey) -> u32 {
        self.shared.attempts.lock().get(key).copied().unwrap_or(0)
    }

    /// Waits until no run is pending or in flight, up to `timeout`.
    ///
    /// Returns true if the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.queue.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerShared {
    fn run_loop(&self) {
        debug!("Compaction thread started");
        while let Some(key) = self.queue.next_due() {
            self.run_one(&key);
            self.queue.complete(&key);
        }
        debug!("Compaction thread exiting");
    }

    fn run_one(&self, key: &PartitionKey) {
        let Some(partition) = self.source.partition(key) else {
            debug!(partition = %key, "Skipping compaction of unknown partition");
            self.attempts.lock().remove(key);
            return;
        };

        match self.compactor.compact(&partition) {
            Ok(outcome) => {
                self.attempts.lock().remove(key);
                if let CompactionOutcome::Skipped { eligible_segments } = outcome {
                    debug!(partition = %key, eligible_segments, "Nothing to compact");
                }
            }
            Err(err) => {
                self.metrics.record_compaction_failure();
                let attempt = {
                    let mut attempts = self.attempts.lock();
                    let attempt = attempts.entry(*key).or_insert(0);
                    *attempt = attempt.saturating_add(1);
                    *attempt
                };
                let delay = self.config.retry_delay(attempt);
                warn!(
                    partition = %key,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Compaction failed: {}",
                    err
                );
                self.queue.schedule(*key, delay);
            }
        }
    }
}
