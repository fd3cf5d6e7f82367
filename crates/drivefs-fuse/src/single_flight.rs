//! Single-flight deduplication of concurrent work.
//!
//! When several callers ask for the same key before the first one has
//! finished, only the first ("leader") does the work and the others
//! ("waiters") receive a copy of its result. Nothing is remembered once the
//! flight lands; caching successful results is the caller's business.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Result of trying to attach to an in-flight operation.
pub enum Attach<V> {
    /// This caller should do the work and then [`InFlight::complete`] it.
    Leader,
    /// Another caller is already working; await the receiver.
    Waiter(broadcast::Receiver<V>),
}

struct Flight<V> {
    sender: broadcast::Sender<V>,
    waiters: AtomicU64,
}

/// Statistics for single-flight deduplication.
#[derive(Debug, Default)]
pub struct SingleFlightStats {
    pub leaders: AtomicU64,
    pub waiters: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl SingleFlightStats {
    /// Fraction of callers that piggybacked on another caller's work.
    pub fn dedup_ratio(&self) -> f64 {
        let leaders = self.leaders.load(Ordering::Relaxed);
        let waiters = self.waiters.load(Ordering::Relaxed);
        let total = leaders + waiters;
        if total == 0 {
            0.0
        } else {
            waiters as f64 / total as f64
        }
    }
}

/// Tracks in-flight operations by key.
pub struct InFlight<K, V> {
    flights: DashMap<K, Flight<V>>,
    stats: SingleFlightStats,
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
            stats: SingleFlightStats::default(),
        }
    }

    /// Joins the flight for `key`, or starts one.
    pub fn try_attach(&self, key: K) -> Attach<V> {
        match self.flights.entry(key) {
            Entry::Occupied(occupied) => {
                let flight = occupied.get();
                flight.waiters.fetch_add(1, Ordering::Relaxed);
                self.stats.waiters.fetch_add(1, Ordering::Relaxed);
                Attach::Waiter(flight.sender.subscribe())
            }
            Entry::Vacant(vacant) => {
                // One message per flight.
                let (sender, _) = broadcast::channel(1);
                vacant.insert(Flight {
                    sender,
                    waiters: AtomicU64::new(0),
                });
                self.stats.leaders.fetch_add(1, Ordering::Relaxed);
                Attach::Leader
            }
        }
    }

    /// Lands the flight for `key` and hands `value` to every waiter.
    ///
    /// Returns the number of waiters that were attached.
    pub fn complete(&self, key: &K, value: V) -> u64 {
        let Some((_, flight)) = self.flights.remove(key) else {
            return 0;
        };
        // Waiters that gave up have dropped their receivers; that is fine.
        let _ = flight.sender.send(value);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        flight.waiters.load(Ordering::Relaxed)
    }

    /// Abandons the flight for `key`. Waiters see a closed channel.
    pub fn cancel(&self, key: &K) {
        if self.flights.remove(key).is_some() {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.flights.len()
    }

    pub fn stats(&self) -> &SingleFlightStats {
        &self.stats
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels a flight when dropped unless disarmed.
///
/// Held by a leader across its work so that a panic or a dropped future
/// does not strand the waiters.
pub struct FlightGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    flights: &'a InFlight<K, V>,
    key: Option<K>,
}

impl<'a, K, V> FlightGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(flights: &'a InFlight<K, V>, key: K) -> Self {
        Self {
            flights,
            key: Some(key),
        }
    }

    /// Lands the flight with `value`.
    pub fn complete(mut self, value: V) -> u64 {
        match self.key.take() {
            Some(key) => self.flights.complete(&key, value),
            None => 0,
        }
    }
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flights.cancel(&key);
        }
    }
}
