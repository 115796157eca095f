//! Data-plane core: backends, circuit breaking, balancing, pooling.

pub mod backend;
pub mod balancer;
pub mod circuit;
pub mod pool;

pub use backend::{ActiveGuard, Backend, BackendMeta};
pub use balancer::{Balancer, LeastConnections, RoundRobin, SmoothWeightedRoundRobin};
pub use circuit::{Breaker, BreakerConfig, BreakerState};
pub use pool::{Pool, PoolConfig};

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds elapsed since the first call in this process.
///
/// Monotonic, so timestamps survive wall-clock adjustments.
pub(crate) fn now_millis() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
