//! Delay-coalescing work queue.
//!
//! Each key is either absent, pending with a due time, in flight, or both
//! (pending again while a run is in flight). Scheduling a pending key keeps
//! the earlier due time, so a burst of requests collapses into one run. A key
//! is never handed out while it is in flight.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct QueueState<K> {
    pending: HashMap<K, Instant>,
    in_flight: HashSet<K>,
    closed: bool,
}

/// Work queue keyed by `K` with per-key debounce.
#[derive(Debug)]
pub struct CoalescingQueue<K> {
    state: Mutex<QueueState<K>>,
    ready: Condvar,
}

impl<K> Default for CoalescingQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> CoalescingQueue<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an open, empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Schedules `key` to become due after `delay`.
    ///
    /// Returns false if the key was already pending with an earlier or equal
    /// due time.
    pub fn schedule(&self, key: K, delay: Duration) -> bool {
        let due = Instant::now() + delay;
        let mut state = self.state.lock();
        let changed = match state.pending.get_mut(&key) {
            Some(existing) if *existing <= due => false,
            Some(existing) => {
                *existing = due;
                true
            }
            None => {
                state.pending.insert(key, due);
                true
            }
        };
        drop(state);
        if changed {
            self.ready.notify_all();
        }
        changed
    }

    /// Blocks until a key is due and not in flight, then marks it in flight.
    ///
    /// Returns `None` once the queue is closed.
    pub fn next_due(&self) -> Option<K> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }

            let now = Instant::now();
            let earliest = state
                .pending
                .iter()
                .filter(|(key, _)| !state.in_flight.contains(*key))
                .min_by_key(|(_, due)| **due)
                .map(|(key, due)| (key.clone(), *due));

            match earliest {
                Some((key, due)) if due <= now => {
                    state.pending.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
                Some((_, due)) => {
                    self.ready.wait_until(&mut state, due);
                }
                None => {
                    self.ready.wait(&mut state);
                }
            }
        }
    }

    /// Marks the run for `key` finished.
    pub fn complete(&self, key: &K) {
        let mut state = self.state.lock();
        let was_in_flight = state.in_flight.remove(key);
        let requeued = state.pending.contains_key(key);
        drop(state);
        if was_in_flight && requeued {
            self.ready.notify_all();
        }
    }

    /// Wakes every waiter and makes [`next_due`](Self::next_due) return
    /// `None`. Pending keys are kept.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Accepts waiters again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Returns true if the queue is closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns true if `key` is pending.
    pub fn is_pending(&self, key: &K) -> bool {
        self.state.lock().pending.contains_key(key)
    }

    /// Returns true if `key` is in flight.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.state.lock().in_flight.contains(key)
    }

    /// Returns true if `key` is pending or in flight.
    pub fn is_scheduled(&self, key: &K) -> bool {
        let state = self.state.lock();
        state.pending.contains_key(key) || state.in_flight.contains(key)
    }

    /// Returns true if no key is pending or in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns true if no key is pending.
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Number of keys in flight.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_requests_coalesce() {
        let queue = CoalescingQueue::new();
        assert!(queue.schedule("p1", Duration::from_millis(50)));
        assert!(!queue.schedule("p1", Duration::from_millis(80)));
        assert!(queue.schedule("p1", Duration::ZERO));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.next_due(), Some("p1"));
        assert!(queue.is_empty());
        assert!(queue.is_in_flight(&"p1"));
        assert!(queue.is_scheduled(&"p1"));
        assert!(!queue.is_idle());
        queue.complete(&"p1");
        assert!(queue.is_idle());
    }

    #[test]
    fn test_due_order() {
        let queue = CoalescingQueue::new();
        queue.schedule("late", Duration::from_millis(30));
        queue.schedule("early", Duration::ZERO);
        assert_eq!(queue.next_due(), Some("early"));
        let started = Instant::now();
        assert_eq!(queue.next_due(), Some("late"));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_in_flight_key_is_not_handed_out_twice() {
        let queue = Arc::new(CoalescingQueue::new());
        queue.schedule(1u32, Duration::ZERO);
        assert_eq!(queue.next_due(), Some(1));

        // requested again while running
        queue.schedule(1, Duration::ZERO);
        queue.schedule(2, Duration::from_millis(20));
        assert_eq!(queue.next_due(), Some(2));

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_due())
        };
        thread::sleep(Duration::from_millis(20));
        queue.complete(&1);
        assert_eq!(waiter.join().unwrap(), Some(1));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let queue = Arc::new(CoalescingQueue::<u32>::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_due())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(queue.is_closed());

        queue.schedule(3, Duration::ZERO);
        assert_eq!(queue.next_due(), None);
        queue.reopen();
        assert_eq!(queue.next_due(), Some(3));
    }
}
