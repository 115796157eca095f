//! Per-backend circuit breaker.
//!
//! Three states: Closed, Open, HalfOpen. The Closed fast path and all reads
//! are atomic; transitions take a short mutex that is never held across I/O.
//! Repeated trips back off exponentially, capped at 10x the base timeout so
//! the breaker still periodically retests the backend.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::core::now_millis;

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning. Zero values fall back to the defaults at construction.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before opening.
    pub failure_threshold: u64,
    /// Consecutive successes in HalfOpen required to close.
    pub success_threshold: u64,
    /// Base Open timeout before trial requests are allowed.
    pub open_timeout: Duration,
    /// Bound on concurrent trial requests while HalfOpen.
    pub max_half_open: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 5,
            open_timeout: Duration::from_secs(10),
            max_half_open: 3,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    /// Consecutive failures in the Closed state.
    failures: u64,
    /// Consecutive successes in the HalfOpen state.
    successes: u64,
}

#[derive(Debug)]
pub struct Breaker {
    // Hot path fields.
    state: AtomicU32,
    /// Monotonic ms when the breaker last transitioned to Open.
    opened_at_ms: AtomicU64,
    half_open_in_flight: AtomicU32,
    open_timeout_ms: AtomicU64,

    // Cold path.
    cold: Mutex<Counters>,

    cfg: BreakerConfig,
}

impl Breaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        let defaults = BreakerConfig::default();
        let cfg = BreakerConfig {
            failure_threshold: if cfg.failure_threshold == 0 {
                defaults.failure_threshold
            } else {
                cfg.failure_threshold
            },
            success_threshold: if cfg.success_threshold == 0 {
                defaults.success_threshold
            } else {
                cfg.success_threshold
            },
            open_timeout: if cfg.open_timeout.is_zero() {
                defaults.open_timeout
            } else {
                cfg.open_timeout
            },
            max_half_open: if cfg.max_half_open == 0 {
                defaults.max_half_open
            } else {
                cfg.max_half_open
            },
        };

        let b = Self {
            state: AtomicU32::new(CLOSED),
            opened_at_ms: AtomicU64::new(0),
            half_open_in_flight: AtomicU32::new(0),
            open_timeout_ms: AtomicU64::new(0),
            cold: Mutex::new(Counters::default()),
            cfg,
        };
        b.open_timeout_ms
            .store(b.cfg.open_timeout.as_millis() as u64, Ordering::Relaxed);
        b
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::SeqCst) {
            CLOSED => BreakerState::Closed,
            OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    /// Whether a request may be dispatched. Lock-free in the Closed state.
    pub fn allow(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => self.check_and_transition_open(),
            BreakerState::HalfOpen => self.try_acquire_half_open_slot(),
        }
    }

    /// Records a successful request from regular traffic.
    ///
    /// Successes while Open are ignored; only probes can begin recovery.
    pub fn record_success(&self) {
        let mut cold = self.cold.lock();
        match self.state() {
            BreakerState::Closed => {
                cold.failures = 0;
                cold.successes = 0;
            }
            BreakerState::HalfOpen => {
                self.release_half_open_slot();
                cold.successes += 1;
                if cold.successes >= self.cfg.success_threshold {
                    self.transition_to_closed(&mut cold);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Records a successful probe from the health supervisor.
    ///
    /// A probe success while Open transitions the breaker to HalfOpen and
    /// clears the counters to begin the recovery phase.
    pub fn record_probe_success(&self) {
        let mut cold = self.cold.lock();
        match self.state() {
            BreakerState::Closed => {
                cold.failures = 0;
                cold.successes = 0;
            }
            BreakerState::HalfOpen => {
                self.release_half_open_slot();
                cold.successes += 1;
                if cold.successes >= self.cfg.success_threshold {
                    self.transition_to_closed(&mut cold);
                }
            }
            BreakerState::Open => {
                self.transition_to_half_open(&mut cold);
            }
        }
    }

    /// Records a failed request, from traffic or probe alike.
    pub fn record_failure(&self) {
        let mut cold = self.cold.lock();
        match self.state() {
            BreakerState::Closed => {
                cold.failures += 1;
                if cold.failures >= self.cfg.failure_threshold {
                    self.transition_to_open(&mut cold);
                }
            }
            BreakerState::HalfOpen => {
                self.release_half_open_slot();
                self.transition_to_open(&mut cold);
            }
            BreakerState::Open => {}
        }
    }

    fn transition_to_open(&self, cold: &mut Counters) {
        self.state.store(OPEN, Ordering::SeqCst);
        self.opened_at_ms.store(now_millis(), Ordering::SeqCst);
        cold.failures = 0;
        cold.successes = 0;
        self.half_open_in_flight.store(0, Ordering::SeqCst);
        self.increase_open_timeout();
        tracing::warn!("circuit breaker opened (timeout {:?})", self.open_timeout());
    }

    // The open timeout carries over into HalfOpen; it resets only when the
    // breaker fully closes.
    fn transition_to_half_open(&self, cold: &mut Counters) {
        self.state.store(HALF_OPEN, Ordering::SeqCst);
        self.opened_at_ms.store(0, Ordering::SeqCst);
        cold.failures = 0;
        cold.successes = 0;
        self.half_open_in_flight.store(0, Ordering::SeqCst);
        tracing::info!("circuit breaker half-open");
    }

    fn transition_to_closed(&self, cold: &mut Counters) {
        self.state.store(CLOSED, Ordering::SeqCst);
        cold.failures = 0;
        cold.successes = 0;
        self.half_open_in_flight.store(0, Ordering::SeqCst);
        self.reset_open_timeout();
        tracing::info!("circuit breaker closed (recovered)");
    }

    fn try_acquire_half_open_slot(&self) -> bool {
        let limit = self.cfg.max_half_open;
        loop {
            let cur = self.half_open_in_flight.load(Ordering::SeqCst);
            if cur >= limit {
                return false;
            }
            if self
                .half_open_in_flight
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_half_open_slot(&self) {
        let _ = self
            .half_open_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                v.checked_sub(1)
            });
    }

    fn check_and_transition_open(&self) -> bool {
        let now = now_millis();
        let opened_at = self.opened_at_ms.load(Ordering::SeqCst);

        let mut timeout = self.open_timeout_ms.load(Ordering::Relaxed);
        if timeout == 0 {
            timeout = self.cfg.open_timeout.as_millis() as u64;
        }

        if now.saturating_sub(opened_at) <= timeout {
            return false;
        }

        // CAS winner performs the cold-path cleanup, then must acquire a
        // slot itself so its completion releases the slot it occupies.
        if self
            .state
            .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let mut cold = self.cold.lock();
            self.transition_to_half_open(&mut cold);
            drop(cold);
            self.try_acquire_half_open_slot()
        } else {
            self.state() == BreakerState::HalfOpen && self.try_acquire_half_open_slot()
        }
    }

    fn increase_open_timeout(&self) {
        let base = self.cfg.open_timeout.as_millis() as u64;
        let mut current = self.open_timeout_ms.load(Ordering::Relaxed);
        if current == 0 {
            current = base;
        }
        let next = (current * 2).min(base * 10);
        self.open_timeout_ms.store(next, Ordering::Relaxed);
    }

    fn reset_open_timeout(&self) {
        self.open_timeout_ms
            .store(self.cfg.open_timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current Open timeout, including any accumulated backoff.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn breaker(failure: u64, success: u64, timeout_ms: u64, max_half_open: u32) -> Breaker {
        Breaker::new(BreakerConfig {
            failure_threshold: failure,
            success_threshold: success,
            open_timeout: Duration::from_millis(timeout_ms),
            max_half_open,
        })
    }

    #[test]
    fn test_defaults_applied_for_zero_fields() {
        let b = Breaker::new(BreakerConfig {
            failure_threshold: 0,
            success_threshold: 0,
            open_timeout: Duration::ZERO,
            max_half_open: 0,
        });
        assert_eq!(b.cfg.failure_threshold, 5);
        assert_eq!(b.cfg.success_threshold, 5);
        assert_eq!(b.cfg.open_timeout, Duration::from_secs(10));
        assert_eq!(b.cfg.max_half_open, 3);
    }

    #[test]
    fn test_closed_allows() {
        let b = breaker(2, 1, 100, 1);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let b = breaker(2, 1, 60_000, 1);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let b = breaker(2, 1, 60_000, 1);
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_traffic_success_ignored_while_open() {
        let b = breaker(1, 1, 60_000, 1);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_probe_success_half_opens_from_open() {
        let b = breaker(1, 1, 60_000, 1);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        b.record_probe_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_failure_while_open_is_noop() {
        let b = breaker(1, 1, 60_000, 1);
        b.record_failure();
        let timeout = b.open_timeout();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.open_timeout(), timeout);
    }

    #[test]
    fn test_half_open_slots_are_bounded() {
        let b = breaker(2, 1, 100, 1);
        b.record_failure();
        b.record_failure();
        assert!(!b.allow());

        std::thread::sleep(Duration::from_millis(250));

        // First allow wins the CAS and takes the single slot.
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // A concurrent second caller is denied.
        assert!(!b.allow());

        // The trial succeeds and closes the breaker.
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        // Closing resets the backoff to the base timeout.
        assert_eq!(b.open_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_half_open_failure_reopens_with_backoff() {
        let b = breaker(1, 1, 100, 1);
        b.record_failure(); // open, timeout 200ms
        assert_eq!(b.open_timeout(), Duration::from_millis(200));

        std::thread::sleep(Duration::from_millis(250));
        assert!(b.allow()); // half-open trial

        b.record_failure(); // back to open, timeout doubled again
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.open_timeout(), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_ten_times_base() {
        let b = breaker(1, 1, 100, 1);
        b.record_failure(); // open, 200ms
        for _ in 0..8 {
            b.record_probe_success(); // open -> half-open, timeout untouched
            b.record_failure(); // half-open failure -> open, doubles
        }
        assert_eq!(b.open_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_success_threshold_closes_half_open() {
        let b = breaker(1, 3, 60_000, 5);
        b.record_failure();
        b.record_probe_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);

        assert!(b.allow());
        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.allow());
        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.allow());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_concurrent_allow_respects_slot_bound() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        use std::thread;

        let b = Arc::new(breaker(1, 10, 50, 3));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(150));

        let allowed = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..16 {
            let b = b.clone();
            let allowed = allowed.clone();
            handles.push(thread::spawn(move || {
                if b.allow() {
                    allowed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(allowed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BreakerState::Closed.to_string(), "closed");
        assert_eq!(BreakerState::Open.to_string(), "open");
        assert_eq!(BreakerState::HalfOpen.to_string(), "half-open");
    }
}
