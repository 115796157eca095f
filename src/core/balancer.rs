//! Load-balancing strategies.
//!
//! The pool filters candidates (healthy, not draining, breaker allows)
//! before calling `next`; strategies re-filter defensively but treat the
//! input as the authoritative candidate set.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::backend::Backend;

/// A pluggable selection strategy.
pub trait Balancer: Send + Sync {
    /// Selects the next backend from the candidates.
    fn next(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    /// Called whenever the pool membership changes.
    fn update(&self, backends: &[Arc<Backend>]);
}

fn filter_candidates(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    backends
        .iter()
        .filter(|b| b.is_healthy() && !b.is_draining())
        .cloned()
        .collect()
}

fn effective_weight(b: &Backend) -> i64 {
    if b.weight == 0 {
        1
    } else {
        b.weight as i64
    }
}

/// Uniform rotation via a monotonic atomic counter.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn next(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let candidates = filter_candidates(candidates);
        if candidates.is_empty() {
            return None;
        }
        // Increment before the modulus so concurrent callers land on
        // distinct slots.
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Some(candidates[(idx % candidates.len() as u64) as usize].clone())
    }

    fn update(&self, _backends: &[Arc<Backend>]) {}
}

/// Picks the candidate with the fewest in-flight requests; ties go to the
/// first-seen candidate.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for LeastConnections {
    fn next(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let candidates = filter_candidates(candidates);
        let mut iter = candidates.into_iter();
        let mut best = iter.next()?;
        let mut best_conns = best.meta.active();
        for b in iter {
            let conns = b.meta.active();
            if conns < best_conns {
                best = b;
                best_conns = conns;
            }
        }
        Some(best)
    }

    fn update(&self, _backends: &[Arc<Backend>]) {}
}

/// Nginx-style smooth weighted round robin.
///
/// Temp weights live in a strategy-local map behind a mutex, so the whole
/// selection is serialised and no mutable per-backend state is shared with
/// other strategies.
#[derive(Debug, Default)]
pub struct SmoothWeightedRoundRobin {
    temp: Mutex<HashMap<String, i64>>,
}

impl SmoothWeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for SmoothWeightedRoundRobin {
    fn next(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let candidates = filter_candidates(candidates);
        if candidates.is_empty() {
            return None;
        }

        let mut temp = self.temp.lock();
        let mut best: usize = 0;
        let mut best_score = i64::MIN;
        let mut total: i64 = 0;

        for (i, b) in candidates.iter().enumerate() {
            let w = effective_weight(b);
            total += w;
            let score = temp.entry(b.id.clone()).or_insert(0);
            *score += w;
            if *score > best_score {
                best_score = *score;
                best = i;
            }
        }

        let chosen = candidates[best].clone();
        if let Some(score) = temp.get_mut(&chosen.id) {
            *score -= total;
        }
        Some(chosen)
    }

    fn update(&self, backends: &[Arc<Backend>]) {
        let keep: HashSet<&str> = backends.iter().map(|b| b.id.as_str()).collect();
        self.temp.lock().retain(|id, _| keep.contains(id.as_str()));
    }
}
