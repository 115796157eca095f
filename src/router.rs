//! Host/path routing trie.
//!
//! Routers are immutable: `add` returns a new router that shares every
//! subtree the insertion did not touch, so readers holding an old router keep
//! a stable snapshot while a new one is published. A process-wide slot holds
//! the current router; readers never block writers and vice versa.

use arc_swap::ArcSwapOption;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::config::RouteConfig;
use crate::core::balancer::RoundRobin;
use crate::core::pool::{Pool, PoolConfig};
use crate::health::Supervisor;

/// Path parameters bound during lookup (`:name` segments).
pub type Params = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum RouterBuildError {
    #[error("invalid port '{port}' for domain '{domain}'")]
    InvalidPort { domain: String, port: String },
}

/// A `(host, path-prefix)` binding to one backend pool.
pub struct Route {
    /// The prefix as originally declared, `*` suffix included.
    pub prefix: String,
    pub pool: Arc<Pool>,
}

struct Node {
    route: Option<Arc<Route>>,
    /// Set for `:name` segments.
    param_name: Option<String>,
    /// Set for the terminal `*` segment.
    is_wildcard: bool,
    /// Keyed by raw segment. BTreeMap keeps parameter backtracking order
    /// deterministic when several parameter children coexist.
    children: BTreeMap<String, Arc<Node>>,
}

impl Node {
    fn root() -> Self {
        Self {
            route: None,
            param_name: None,
            is_wildcard: false,
            children: BTreeMap::new(),
        }
    }

    fn new(segment: &str) -> Self {
        let mut node = Self::root();
        if segment.len() > 1 && segment.starts_with(':') {
            node.param_name = Some(segment[1..].to_string());
        } else if segment == "*" {
            node.is_wildcard = true;
        }
        node
    }

    fn shallow_clone(&self) -> Self {
        Self {
            route: self.route.clone(),
            param_name: self.param_name.clone(),
            is_wildcard: self.is_wildcard,
            // New map, shared child pointers.
            children: self.children.clone(),
        }
    }

    /// Copy-on-write insertion: clones only this node and the spine below
    /// it; sibling subtrees are shared with the previous version.
    fn insert(&self, segments: &[String], route: Arc<Route>) -> Arc<Node> {
        let mut copied = self.shallow_clone();
        if segments.is_empty() {
            copied.route = Some(route);
            return Arc::new(copied);
        }

        let seg = &segments[0];
        let child = match copied.children.get(seg) {
            Some(child) => child.insert(&segments[1..], route),
            None => Node::new(seg).insert(&segments[1..], route),
        };
        copied.children.insert(seg.clone(), child);
        Arc::new(copied)
    }

    fn lookup(&self, segments: &[&str], params: &mut Params) -> Option<Arc<Route>> {
        if segments.is_empty() {
            if let Some(route) = &self.route {
                return Some(route.clone());
            }
            // A wildcard matches zero remaining segments too.
            if let Some(child) = self.children.get("*") {
                if let Some(route) = &child.route {
                    return Some(route.clone());
                }
            }
            return None;
        }

        let seg = segments[0];

        // Exact literal match wins.
        if let Some(child) = self.children.get(seg) {
            if let Some(route) = child.lookup(&segments[1..], params) {
                return Some(route);
            }
        }

        // Parameter match, with backtracking: a parameter may bind here and
        // still fail deeper down.
        for child in self.children.values() {
            if let Some(name) = &child.param_name {
                params.insert(name.clone(), seg.to_string());
                if let Some(route) = child.lookup(&segments[1..], params) {
                    return Some(route);
                }
                params.remove(name);
            }
        }

        // Wildcard consumes the remainder.
        if let Some(child) = self.children.get("*") {
            if child.is_wildcard {
                if let Some(route) = &child.route {
                    return Some(route.clone());
                }
            }
        }

        // No fallback to this node's own route: "/api" must not match
        // "/api/v1" unless "/api/*" was registered.
        None
    }
}

/// Immutable routing table plus the health supervisors for its pools.
#[derive(Clone, Default)]
pub struct Router {
    hosts: HashMap<String, Arc<Node>>,
    supervisors: HashMap<String, Arc<Supervisor>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("supervisors", &self.supervisors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new router with `(host, path)` bound to a fresh pool over
    /// `services`. An empty host or service list is a no-op.
    pub fn add(&self, host: &str, path: &str, services: &[Url]) -> Router {
        if host.is_empty() || services.is_empty() {
            return self.clone();
        }

        let host = normalize_host(host);
        let norm_path = normalize_prefix(path);
        let segments = path_segments(&norm_path);

        let pool = Arc::new(Pool::new(PoolConfig::default(), Box::new(RoundRobin::new())));
        for service in services {
            let id = format!("{}-{}", host, service);
            pool.add(id, service.clone(), 1);
        }
        let supervisor = Arc::new(Supervisor::new(pool.clone()));

        let mut hosts = self.hosts.clone();
        let mut supervisors = self.supervisors.clone();
        supervisors.insert(format!("{}{}", host, norm_path), supervisor);

        let route = Arc::new(Route {
            prefix: path.to_string(),
            pool,
        });
        let root = match hosts.get(&host) {
            Some(root) => root.insert(&segments, route),
            None => Node::root().insert(&segments, route),
        };
        hosts.insert(host, root);

        Router { hosts, supervisors }
    }

    /// Resolves a request to a route and its bound path parameters.
    pub fn lookup(&self, host: &str, path: &str) -> Option<(Arc<Route>, Params)> {
        let root = self.hosts.get(&normalize_host(host))?;
        let normalized = normalize_prefix(path);
        let segments: Vec<&str> = if normalized == "/" {
            Vec::new()
        } else {
            normalized.split('/').filter(|s| !s.is_empty()).collect()
        };

        let mut params = Params::new();
        let route = root.lookup(&segments, &mut params)?;
        Some((route, params))
    }

    /// Starts every supervisor owned by this router. Safe to call more than
    /// once; each supervisor guards its own started flag.
    pub fn start(&self) {
        for supervisor in self.supervisors.values() {
            supervisor.start();
        }
    }

    /// Stops every supervisor owned by this router. Must be called when the
    /// router is replaced or the process shuts down.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut failed = 0usize;
        for supervisor in self.supervisors.values() {
            if let Err(e) = supervisor.stop().await {
                tracing::error!("supervisor stop failed: {}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("failed to stop {} supervisor(s)", failed);
        }
        Ok(())
    }

    #[cfg(test)]
    fn supervisor_keys(&self) -> Vec<String> {
        self.supervisors.keys().cloned().collect()
    }
}

/// Builds a router from ordered `{domain, path_prefix, ports}` records,
/// synthesising `http://localhost:<port>` backends.
pub fn build_from_config(entries: &[RouteConfig]) -> Result<Router, RouterBuildError> {
    let mut router = Router::new();
    for entry in entries {
        let services = parse_services(&entry.domain, &entry.ports)?;
        router = router.add(&entry.domain, &entry.path_prefix, &services);
    }
    Ok(router)
}

fn parse_services(domain: &str, ports: &[String]) -> Result<Vec<Url>, RouterBuildError> {
    let mut out = Vec::with_capacity(ports.len());
    for port in ports {
        let invalid = || RouterBuildError::InvalidPort {
            domain: domain.to_string(),
            port: port.clone(),
        };
        port.parse::<u16>().map_err(|_| invalid())?;
        let url = Url::parse(&format!("http://localhost:{}", port)).map_err(|_| invalid())?;
        out.push(url);
    }
    Ok(out)
}

static CURRENT: ArcSwapOption<Router> = ArcSwapOption::const_empty();

/// Publishes `router` as the process-wide current router.
pub fn set_current(router: Arc<Router>) {
    CURRENT.store(Some(router));
}

/// Loads the process-wide current router.
pub fn current() -> Option<Arc<Router>> {
    CURRENT.load_full()
}

/// Publishes `router` and stops the supervisors of the router it replaced,
/// so probe tasks never outlive their router.
pub async fn swap_current(router: Arc<Router>) -> anyhow::Result<()> {
    router.start();
    let old = CURRENT.swap(Some(router));
    match old {
        Some(old) => old.stop().await,
        None => Ok(()),
    }
}

/// Lower-cases the host and strips any trailing `:port`.
pub fn normalize_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    match host.rfind(':') {
        Some(idx) => host[..idx].to_string(),
        None => host,
    }
}

/// Canonical prefix form: trimmed, leading `/`, no trailing `/`; `""` and
/// `"/"` both normalise to `"/"`.
pub fn normalize_prefix(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn path_segments(path: &str) -> Vec<String> {
    if path == "/" {
        return Vec::new();
    }
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
