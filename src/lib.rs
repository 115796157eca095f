//! Balto - HTTP reverse proxy and load balancer.
//!
//! The data plane is built from an immutable copy-on-write routing trie, a
//! per-route backend pool with pluggable balancing strategies, a per-backend
//! circuit breaker and an active health supervisor per pool.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod core;
pub mod health;
pub mod proxy;
pub mod router;
pub mod server;

// Re-export commonly used types
pub use config::{load_config, load_routes, Config, RouteConfig};
pub use core::{
    ActiveGuard, Backend, Balancer, Breaker, BreakerConfig, BreakerState, LeastConnections, Pool,
    PoolConfig, RoundRobin, SmoothWeightedRoundRobin,
};
pub use health::{Supervisor, SupervisorError};
pub use proxy::Proxy;
pub use router::{
    build_from_config, current, set_current, swap_current, Params, Route, Router, RouterBuildError,
};
pub use server::HttpServer;
