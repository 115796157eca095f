//! Per-route backend pool.
//!
//! Membership and configuration are published by whole-pointer swap; readers
//! snapshot once per operation. Add/remove serialise their read-modify-write
//! through a small mutex that is never held across I/O.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::core::backend::Backend;
use crate::core::balancer::Balancer;
use crate::core::circuit::BreakerConfig;
use crate::core::now_millis;

/// Pool tuning, snapshot-replaced atomically.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Consecutive passive failures flipping a backend unhealthy.
    pub health_threshold: u64,
    /// Consecutive probe failures flipping a backend unhealthy.
    /// Falls back to `health_threshold` when zero.
    pub probe_health_threshold: u64,
    /// Consecutive probe successes required to flip an unhealthy backend
    /// healthy. Defaults to 5 when zero.
    pub probe_recovery_threshold: u64,
    /// Path probed on each backend, joined onto its base path.
    pub probe_path: String,
    pub probe_interval_ms: u64,
    /// Per-probe timeout.
    pub timeout_ms: u64,

    pub cb_failure_threshold: u64,
    pub cb_success_threshold: u64,
    pub cb_open_timeout_secs: u64,
    pub cb_max_half_open: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            health_threshold: 10,
            probe_health_threshold: 10,
            probe_recovery_threshold: 5,
            probe_path: "/api/health".to_string(),
            probe_interval_ms: 1000,
            timeout_ms: 1000,
            cb_failure_threshold: 10,
            cb_success_threshold: 10,
            cb_open_timeout_secs: 10,
            cb_max_half_open: 5,
        }
    }
}

impl PoolConfig {
    pub(crate) fn passive_threshold(&self) -> u64 {
        self.health_threshold
    }

    pub(crate) fn probe_threshold(&self) -> u64 {
        if self.probe_health_threshold != 0 {
            self.probe_health_threshold
        } else {
            self.health_threshold
        }
    }

    pub(crate) fn recovery_threshold(&self) -> u64 {
        if self.probe_recovery_threshold != 0 {
            self.probe_recovery_threshold
        } else {
            5
        }
    }

    pub(crate) fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.cb_failure_threshold,
            success_threshold: self.cb_success_threshold,
            open_timeout: Duration::from_secs(self.cb_open_timeout_secs),
            max_half_open: self.cb_max_half_open,
        }
    }
}

/// Owns the backends for one route and decides which one receives each
/// request.
pub struct Pool {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    config: ArcSwap<PoolConfig>,
    strategy: Box<dyn Balancer>,
    /// Serialises membership read-modify-write and draining scans.
    op_mu: Mutex<()>,
}

impl Pool {
    pub fn new(cfg: PoolConfig, strategy: Box<dyn Balancer>) -> Self {
        let pool = Self {
            backends: ArcSwap::from_pointee(Vec::new()),
            config: ArcSwap::from_pointee(cfg),
            strategy,
            op_mu: Mutex::new(()),
        };
        pool.strategy.update(&[]);
        pool
    }

    /// Snapshot of the current backend list.
    pub fn list(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a backend, building its breaker from the pool's current circuit
    /// settings, and publishes the new list.
    pub fn add(&self, id: impl Into<String>, url: Url, weight: u32) {
        let id = id.into();
        let _guard = self.op_mu.lock();

        let cb_cfg = self.config.load().breaker_config();
        let old = self.backends.load();
        let mut items: Vec<Arc<Backend>> = old.iter().cloned().collect();
        items.push(Arc::new(Backend::new(id, url, weight, cb_cfg)));

        let items = Arc::new(items);
        self.backends.store(items.clone());
        self.strategy.update(&items);
    }

    /// Removes a backend by id and publishes the new list. Unknown ids are
    /// ignored.
    pub fn remove(&self, id: &str) {
        let _guard = self.op_mu.lock();

        let old = self.backends.load();
        if !old.iter().any(|b| b.id == id) {
            return;
        }
        let items: Vec<Arc<Backend>> =
            old.iter().filter(|b| b.id != id).cloned().collect();

        let items = Arc::new(items);
        self.backends.store(items.clone());
        self.strategy.update(&items);
    }

    pub fn set_config(&self, cfg: PoolConfig) {
        self.config.store(Arc::new(cfg));
    }

    pub fn config(&self) -> Arc<PoolConfig> {
        self.config.load_full()
    }

    /// Selects a backend for one request: healthy, not draining, and the
    /// breaker allows, in that order. Returns `None` when nothing is
    /// eligible.
    pub fn next(&self) -> Option<Arc<Backend>> {
        let backends = self.backends.load();
        if backends.is_empty() {
            return None;
        }
        let candidates: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| b.is_healthy() && !b.is_draining() && b.circuit.allow())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        self.strategy.next(&candidates)
    }

    /// Records a traffic-path success.
    ///
    /// Never flips the healthy flag: traffic successes may be lucky, and the
    /// probe path is the only source of truth for recovery.
    pub fn record_success(&self, b: &Backend) {
        b.meta.record_success();
        b.circuit.record_success();
    }

    /// Records a traffic-path failure; flips the backend unhealthy once the
    /// passive threshold is reached.
    pub fn record_failure(&self, b: &Backend) {
        b.meta.record_passive_failure();
        b.circuit.record_failure();

        let threshold = self.config.load().passive_threshold();
        if threshold == 0 {
            return;
        }
        if b.meta.passive_fail_count.load(Ordering::Relaxed) >= threshold && b.set_healthy(false) {
            tracing::warn!(backend = %b.url, "backend unhealthy (passive failure threshold)");
        }
    }

    /// Probe-path success signal from the health supervisor.
    pub fn mark_healthy(&self, b: &Backend) {
        b.meta.last_success_ms.store(now_millis(), Ordering::Relaxed);
        b.meta.reset_all_fail_counts();
        b.meta.incr_probe_success();
        b.circuit.record_probe_success();

        let threshold = self.config.load().recovery_threshold();
        if b.meta.probe_success_count.load(Ordering::Relaxed) >= threshold
            && !b.is_healthy()
            && b.set_healthy(true)
        {
            tracing::info!(backend = %b.url, "backend recovered (probe)");
        }
    }

    /// Probe-path failure signal from the health supervisor.
    pub fn mark_unhealthy(&self, b: &Backend) {
        b.meta.record_probe_failure();
        b.meta.reset_probe_success();
        b.circuit.record_failure();

        let threshold = self.config.load().probe_threshold();
        if b.meta.probe_fail_count.load(Ordering::Relaxed) >= threshold && b.set_healthy(false) {
            tracing::warn!(backend = %b.url, "backend unhealthy (probe)");
        }
    }

    /// Operator escape hatch: clears failure counters and force-marks the
    /// backend healthy.
    pub fn reset_health(&self, b: &Backend) {
        b.meta.reset_all_fail_counts();
        if b.set_healthy(true) {
            tracing::info!(backend = %b.url, "backend health reset manually");
        }
    }

    /// Flags a backend to stop receiving new requests.
    pub fn start_draining(&self, id: &str) {
        let _guard = self.op_mu.lock();
        for b in self.backends.load().iter() {
            if b.id == id {
                b.set_draining(true);
                return;
            }
        }
    }

    /// Polls until the draining backend has no active connections (true), it
    /// leaves the pool or is not draining (false), or the deadline elapses
    /// (false).
    pub async fn wait_for_drain(&self, id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let found = {
                let _guard = self.op_mu.lock();
                let items = self.backends.load();
                let mut found = false;
                for b in items.iter() {
                    if b.id == id && b.is_draining() {
                        found = true;
                        if b.meta.active() == 0 {
                            return true;
                        }
                    }
                }
                found
            };
            if !found {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}
