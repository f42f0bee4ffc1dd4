// dedup: sliding-window deduplicator for closed candles (spec §4.2).
//
// Only closed candles are ever checked — an open (still-forming) candle is
// never a duplicate by definition, so callers must gate on `is_closed`
// before calling `check_and_insert`.

use candle_protocol::SubscriptionKey;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fresh,
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub window: Duration,
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            window: Duration::from_secs(120),
            max_entries: 10_000,
        }
    }
}

type CompositeKey = (SubscriptionKey, i64);

struct Inner {
    seen: HashMap<CompositeKey, Instant>,
    /// Insertion order, oldest first. Shared by both the time-window sweep
    /// and the max-entries overflow eviction, since both evict from the
    /// front.
    order: VecDeque<CompositeKey>,
}

/// Sliding-window deduplicator keyed by `(symbol, open_time_ms)`.
pub struct Deduplicator {
    cfg: DedupConfig,
    inner: Mutex<Inner>,
}

impl Deduplicator {
    pub fn new(cfg: DedupConfig) -> Self {
        Deduplicator {
            cfg,
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Check a closed candle's identity and record it if new. Evicts
    /// window-expired entries amortised into every call, then enforces
    /// `max_entries` by dropping the oldest surviving entry.
    pub fn check_and_insert(&self, key: SubscriptionKey, open_time_ms: i64) -> Outcome {
        let composite = (key, open_time_ms);
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("dedup mutex poisoned");

        self.evict_expired(&mut inner, now);

        if inner.seen.contains_key(&composite) {
            return Outcome::Duplicate;
        }

        inner.seen.insert(composite.clone(), now);
        inner.order.push_back(composite);

        while inner.seen.len() > self.cfg.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            } else {
                break;
            }
        }

        Outcome::Fresh
    }

    fn evict_expired(&self, inner: &mut Inner, now: Instant) {
        while let Some(front) = inner.order.front() {
            match inner.seen.get(front) {
                Some(inserted_at) if now.duration_since(*inserted_at) > self.cfg.window => {
                    let expired = inner.order.pop_front().expect("front checked above");
                    inner.seen.remove(&expired);
                }
                _ => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup mutex poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_protocol::Exchange;

    fn key() -> SubscriptionKey {
        SubscriptionKey::new(Exchange::Binance, "spot", "BTCUSDT")
    }

    #[test]
    fn first_sighting_is_fresh_second_is_duplicate() {
        let dd = Deduplicator::new(DedupConfig::default());
        assert_eq!(dd.check_and_insert(key(), 1000), Outcome::Fresh);
        assert_eq!(dd.check_and_insert(key(), 1000), Outcome::Duplicate);
    }

    #[test]
    fn distinct_open_times_are_both_fresh() {
        let dd = Deduplicator::new(DedupConfig::default());
        assert_eq!(dd.check_and_insert(key(), 1000), Outcome::Fresh);
        assert_eq!(dd.check_and_insert(key(), 2000), Outcome::Fresh);
        assert_eq!(dd.len(), 2);
    }

    #[test]
    fn entries_expire_after_window() {
        let dd = Deduplicator::new(DedupConfig {
            window: Duration::from_millis(10),
            max_entries: 10_000,
        });
        assert_eq!(dd.check_and_insert(key(), 1000), Outcome::Fresh);
        std::thread::sleep(Duration::from_millis(20));
        // The eviction sweep runs on the next call; re-seeing the same key
        // after expiry is fresh again.
        assert_eq!(dd.check_and_insert(key(), 1000), Outcome::Fresh);
    }

    #[test]
    fn max_entries_evicts_oldest_first() {
        let dd = Deduplicator::new(DedupConfig {
            window: Duration::from_secs(120),
            max_entries: 2,
        });
        assert_eq!(dd.check_and_insert(key(), 1), Outcome::Fresh);
        assert_eq!(dd.check_and_insert(key(), 2), Outcome::Fresh);
        assert_eq!(dd.check_and_insert(key(), 3), Outcome::Fresh);
        assert_eq!(dd.len(), 2);
        // Entry 1 was evicted to make room, so it looks fresh again.
        assert_eq!(dd.check_and_insert(key(), 1), Outcome::Fresh);
    }
}
