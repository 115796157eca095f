//! Active health supervision.
//!
//! One supervisor per pool. A reconciliation task keeps exactly one probe
//! task per pool member: probes are cancelled when their backend leaves the
//! pool and started when a new backend appears. Probe outcomes are reported
//! back to the pool, which owns the health flags.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::core::backend::Backend;
use crate::core::pool::Pool;

const STOP_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("health supervisor failed to stop within {0:?}")]
    StopTimeout(Duration),
}

struct Lifecycle {
    started: bool,
    manager: Option<JoinHandle<()>>,
}

/// State shared between the supervisor handle and its spawned tasks.
struct Shared {
    pool: Arc<Pool>,
    interval: Duration,
    timeout: Duration,
    client: reqwest::Client,
    /// Probe task per backend id, reconciled against pool membership.
    probes: DashMap<String, JoinHandle<()>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Drives active probing for one pool.
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    /// Builds a supervisor from the pool's current probe settings, clamping
    /// them to sane floors: timeout 0 -> 500 ms, minimum 50 ms; interval
    /// 0 -> 1 s, minimum 100 ms.
    pub fn new(pool: Arc<Pool>) -> Self {
        let cfg = pool.config();

        let timeout = match cfg.timeout_ms {
            0 => Duration::from_millis(500),
            ms if ms < 50 => Duration::from_millis(50),
            ms => Duration::from_millis(ms),
        };

        let interval = match cfg.probe_interval_ms {
            0 => Duration::from_secs(1),
            ms if ms < 100 => Duration::from_millis(100),
            ms => Duration::from_millis(ms),
        };

        let client = match reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("probe client build failed, using defaults: {}", e);
                reqwest::Client::default()
            }
        };

        Self {
            shared: Arc::new(Shared {
                pool,
                interval,
                timeout,
                client,
                probes: DashMap::new(),
                lifecycle: Mutex::new(Lifecycle {
                    started: false,
                    manager: None,
                }),
            }),
        }
    }

    /// Starts the reconciliation task. Idempotent.
    pub fn start(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.started {
            return;
        }
        lifecycle.started = true;

        let shared = Arc::clone(&self.shared);
        lifecycle.manager = Some(tokio::spawn(async move {
            Shared::manage_probes(shared).await;
        }));
    }

    /// Cancels the reconciler and every probe task, waiting up to the stop
    /// deadline for them to finish. Idempotent.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (manager, handles) = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if !lifecycle.started {
                return Ok(());
            }
            lifecycle.started = false;

            let manager = lifecycle.manager.take();
            let ids: Vec<String> = self.shared.probes.iter().map(|e| e.key().clone()).collect();
            let mut handles = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some((_, handle)) = self.shared.probes.remove(&id) {
                    handles.push(handle);
                }
            }
            (manager, handles)
        };

        if let Some(manager) = &manager {
            manager.abort();
        }
        for handle in &handles {
            handle.abort();
        }

        let wait = async move {
            if let Some(manager) = manager {
                let _ = manager.await;
            }
            for handle in handles {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(STOP_DEADLINE, wait).await {
            Ok(()) => Ok(()),
            Err(_) => Err(SupervisorError::StopTimeout(STOP_DEADLINE)),
        }
    }

    /// Number of live probe tasks.
    pub fn probe_count(&self) -> usize {
        self.shared.probes.len()
    }

    #[cfg(test)]
    fn is_started(&self) -> bool {
        self.shared.lifecycle.lock().started
    }

    #[cfg(test)]
    fn reconcile_once(&self) {
        Shared::reconcile(&self.shared);
    }
}

impl Shared {
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn manage_probes(shared: Arc<Shared>) {
        // The first tick completes immediately, so membership is reconciled
        // on start.
        let mut ticker = tokio::time::interval(shared.interval);
        loop {
            ticker.tick().await;
            Self::reconcile(&shared);
        }
    }

    fn reconcile(shared: &Arc<Shared>) {
        let backends = shared.pool.list();
        let current: HashSet<&str> = backends.iter().map(|b| b.id.as_str()).collect();

        let lifecycle = shared.lifecycle.lock();
        if !lifecycle.started {
            return;
        }

        shared.probes.retain(|id, handle| {
            if current.contains(id.as_str()) {
                true
            } else {
                handle.abort();
                false
            }
        });

        for backend in backends.iter() {
            if !shared.probes.contains_key(&backend.id) {
                let handle = Self::spawn_probe(shared, Arc::clone(backend));
                shared.probes.insert(backend.id.clone(), handle);
            }
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn spawn_probe(shared: &Arc<Shared>, backend: Arc<Backend>) -> JoinHandle<()> {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(shared.interval + shared.jitter()).await;
                if backend.is_draining() {
                    continue;
                }
                shared.run_probe(&backend).await;
            }
        })
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run_probe(&self, backend: &Backend) {
        match backend.url.scheme() {
            "http" | "https" => self.probe_http(backend).await,
            _ => self.probe_tcp(backend).await,
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn probe_http(&self, backend: &Backend) {
        let cfg = self.pool.config();
        let mut probe_url = backend.url.clone();
        probe_url.set_path(&single_join(backend.url.path(), &cfg.probe_path));

        match self.client.get(probe_url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if (200..400).contains(&status) {
                    self.pool.mark_healthy(backend);
                } else {
                    self.pool.mark_unhealthy(backend);
                }
            }
            Err(_) => self.pool.mark_unhealthy(backend),
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn probe_tcp(&self, backend: &Backend) {
        let host = match backend.url.host_str() {
            Some(host) => host,
            None => {
                self.pool.mark_unhealthy(backend);
                return;
            }
        };
        let port = backend.url.port_or_known_default().unwrap_or(80);
        let addr = format!("{}:{}", host, port);

        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                self.pool.mark_healthy(backend);
            }
            _ => self.pool.mark_unhealthy(backend),
        }
    }

    /// Uniform jitter in `[0, interval/5)`, floored at 10 ms, so probes for
    /// many backends do not fire in lockstep.
    fn jitter(&self) -> Duration {
        let max = self.interval / 5;
        let max = if max.is_zero() {
            Duration::from_millis(10)
        } else {
            max
        };
        Duration::from_millis(rand::thread_rng().gen_range(0..max.as_millis() as u64))
    }
}

/// Joins two path pieces with exactly one `/` between them.
fn single_join(a: &str, b: &str) -> String {
    let a = if a.is_empty() { "/" } else { a };
    if b.is_empty() {
        return a.to_string();
    }
    let a = a.strip_suffix('/').unwrap_or(a);
    if b.starts_with('/') {
        format!("{}{}", a, b)
    } else {
        format!("{}/{}", a, b)
    }
}
