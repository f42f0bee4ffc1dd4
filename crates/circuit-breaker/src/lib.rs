// circuit-breaker: per-upstream fault isolation with exponential backoff.
//
// Three states — CLOSED, OPEN, HALF_OPEN — gate a caller's network
// operations. State transitions are guarded by a `Mutex`; the
// consecutive-failure counter is a separate atomic, per the concurrency
// model in spec §5 ("circuit breaker uses atomic counters for
// consecutive_failures and a mutex for state transition").

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker state as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Tunable thresholds. Defaults match spec §4.1/§6.4.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub half_open_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            half_open_calls: 1,
        }
    }
}

/// Point-in-time view of the breaker, as returned by [`CircuitBreaker::snapshot`].
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: State,
    pub consecutive_failures: u32,
    pub open_since: Option<Instant>,
}

struct Inner {
    state: State,
    open_since: Option<Instant>,
    /// Number of times the breaker has entered OPEN; reset to 0 only when a
    /// HALF_OPEN trial succeeds and the breaker returns to CLOSED.
    open_count: u32,
    half_open_inflight: u32,
}

/// Per-upstream circuit breaker. Cheap to share via `Arc`; all methods take
/// `&self`.
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    consecutive_failures: AtomicU32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        CircuitBreaker {
            cfg,
            consecutive_failures: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                state: State::Closed,
                open_since: None,
                open_count: 0,
                half_open_inflight: 0,
            }),
        }
    }

    /// Ask whether an operation may proceed. In HALF_OPEN, at most
    /// `half_open_calls` trials are admitted concurrently. Every `true`
    /// return must be paired with exactly one `record_success` or
    /// `record_failure` call.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            State::Closed => true,
            State::Open => {
                let backoff = self.backoff_for(inner.open_count - 1);
                let elapsed = inner.open_since.map(|since| since.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= backoff {
                    inner.state = State::HalfOpen;
                    inner.half_open_inflight = 1;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                if inner.half_open_inflight < self.cfg.half_open_calls {
                    inner.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.consecutive_failures.store(0, Ordering::SeqCst);
        match inner.state {
            State::Closed => {}
            State::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.state = State::Closed;
                inner.open_since = None;
                inner.open_count = 0;
            }
            State::Open => {
                // A success while OPEN cannot happen through `allow`, but is
                // harmless to treat as an early recovery.
                inner.state = State::Closed;
                inner.open_since = None;
                inner.open_count = 0;
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        match inner.state {
            State::Closed => {
                if failures >= self.cfg.failure_threshold {
                    self.enter_open(&mut inner);
                }
            }
            State::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                self.enter_open(&mut inner);
            }
            State::Open => {}
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        Snapshot {
            state: inner.state,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            open_since: inner.open_since,
        }
    }

    fn enter_open(&self, inner: &mut Inner) {
        inner.state = State::Open;
        inner.open_since = Some(Instant::now());
        inner.open_count += 1;
    }

    fn backoff_for(&self, open_count: u32) -> Duration {
        let exp = open_count.min(32);
        let scaled = self.cfg.base_backoff.saturating_mul(1u32 << exp.min(20));
        scaled.min(self.cfg.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            half_open_calls: 1,
        }
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let cb = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            assert!(cb.allow());
            cb.record_failure();
        }
        assert_eq!(cb.snapshot().state, State::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn half_open_admits_one_trial_after_backoff() {
        let cb = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.snapshot().state, State::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow());
        assert_eq!(cb.snapshot().state, State::HalfOpen);
        // A second concurrent trial is rejected.
        assert!(!cb.allow());
    }

    #[test]
    fn half_open_success_resets_to_closed() {
        let cb = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow());
        cb.record_success();
        let snap = cb.snapshot();
        assert_eq!(snap.state, State::Closed);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens_with_longer_backoff() {
        let cb = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.snapshot().state, State::Open);
        // Backoff has doubled; immediately retrying is still rejected.
        assert!(!cb.allow());
        std::thread::sleep(Duration::from_millis(15));
        // Still within the doubled backoff window (first was 10ms, now ~20ms).
        assert!(!cb.allow());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow());
    }

    #[test]
    fn closed_breaker_always_allows() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        for _ in 0..10 {
            assert!(cb.allow());
            cb.record_success();
        }
        assert_eq!(cb.snapshot().state, State::Closed);
    }
}
