//! Backend endpoint state.
//!
//! A `Backend` is shared between every request handler routed to it and the
//! health supervisor, so all mutable fields are atomics. Health and draining
//! are independent bits in a single state word, updated by CAS.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

use crate::core::circuit::{Breaker, BreakerConfig};
use crate::core::now_millis;

const FLAG_HEALTHY: u32 = 1 << 0;
const FLAG_DRAINING: u32 = 1 << 1;

/// Runtime counters for a backend.
#[derive(Debug, Default)]
pub struct BackendMeta {
    /// Consecutive failures observed on real traffic.
    pub passive_fail_count: AtomicU64,
    /// Consecutive failed probes.
    pub probe_fail_count: AtomicU64,
    /// Consecutive successful probes.
    pub probe_success_count: AtomicU64,
    /// Last failure, in monotonic milliseconds.
    pub last_failure_ms: AtomicU64,
    /// Last success, in monotonic milliseconds.
    pub last_success_ms: AtomicU64,
    /// Requests currently in flight.
    pub active_conns: AtomicU64,
    /// Total requests dispatched to this backend.
    pub total_requests: AtomicU64,
}

impl BackendMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_active(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_active(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_passive_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.passive_fail_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) {
        self.probe_fail_count.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn reset_passive_fail_count(&self) {
        self.passive_fail_count.store(0, Ordering::Relaxed);
    }

    pub fn reset_probe_fail_count(&self) {
        self.probe_fail_count.store(0, Ordering::Relaxed);
    }

    /// Clears both failure counters. The consecutive probe-success counter
    /// is left alone; it only resets on a probe failure.
    pub fn reset_all_fail_counts(&self) {
        self.reset_passive_fail_count();
        self.reset_probe_fail_count();
    }

    pub fn incr_probe_success(&self) {
        self.probe_success_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_probe_success(&self) {
        self.probe_success_count.store(0, Ordering::Relaxed);
    }
}

/// A single upstream endpoint.
#[derive(Debug)]
pub struct Backend {
    /// Stable identifier within its pool.
    pub id: String,
    /// Upstream address: scheme, host, port and optional base path.
    pub url: Url,
    /// Weight for weighted strategies (0 is treated as 1).
    pub weight: u32,
    /// Bitmask of `FLAG_HEALTHY` / `FLAG_DRAINING`.
    state: AtomicU32,
    pub meta: BackendMeta,
    pub circuit: Breaker,
}

impl Backend {
    /// Creates a backend that starts out healthy and not draining.
    pub fn new(id: impl Into<String>, url: Url, weight: u32, cb_cfg: BreakerConfig) -> Self {
        let b = Self {
            id: id.into(),
            url,
            weight,
            state: AtomicU32::new(0),
            meta: BackendMeta::new(),
            circuit: Breaker::new(cb_cfg),
        };
        b.set_healthy(true);
        b
    }

    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::SeqCst) & FLAG_HEALTHY != 0
    }

    pub fn is_draining(&self) -> bool {
        self.state.load(Ordering::SeqCst) & FLAG_DRAINING != 0
    }

    /// Sets or clears the healthy flag. Returns true iff the flag changed,
    /// so callers can log each transition exactly once.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        loop {
            let old = self.state.load(Ordering::SeqCst);
            let new = if healthy {
                old | FLAG_HEALTHY
            } else {
                old & !FLAG_HEALTHY
            };
            if self
                .state
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return (old & FLAG_HEALTHY) != (new & FLAG_HEALTHY);
            }
        }
    }

    pub fn set_draining(&self, draining: bool) {
        loop {
            let old = self.state.load(Ordering::SeqCst);
            let new = if draining {
                old | FLAG_DRAINING
            } else {
                old & !FLAG_DRAINING
            };
            if self
                .state
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

}

/// RAII guard for the active-connection counter.
#[derive(Debug)]
pub struct ActiveGuard {
    backend: Arc<Backend>,
}

impl ActiveGuard {
    /// Increments the backend's active-connection counter; the matching
    /// decrement happens on drop, pairing the two on every exit path.
    pub fn acquire(backend: Arc<Backend>) -> Self {
        backend.meta.incr_active();
        Self { backend }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.backend.meta.decr_active();
    }
}
