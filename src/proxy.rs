//! Request forwarding.
//!
//! The proxy holds the published router in an atomically swappable slot,
//! resolves each request to a backend through the route's pool, rewrites the
//! path and headers, and streams both bodies. The chosen backend's
//! active-connection guard travels inside the response body stream, so the
//! counter reaches zero on success, error and client cancel alike.

use arc_swap::ArcSwapOption;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::backend::ActiveGuard;
use crate::router::Router;

const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Forwarding front-end shared by every request handler.
pub struct Proxy {
    router: ArcSwapOption<Router>,
    client: reqwest::Client,
}

impl Proxy {
    pub fn new(router: Option<Arc<Router>>) -> Self {
        let client = match reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(500)
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("upstream client build failed, using defaults: {}", e);
                reqwest::Client::default()
            }
        };

        let proxy = Self {
            router: ArcSwapOption::empty(),
            client,
        };
        if let Some(router) = router {
            proxy.router.store(Some(router));
        }
        proxy
    }

    /// Publishes a new router without touching the old one's supervisors.
    pub fn update_router(&self, router: Arc<Router>) {
        self.router.store(Some(router));
    }

    /// Publishes a new router, starts its supervisors, and stops the
    /// supervisors of the router it replaced.
    pub async fn swap_router(&self, router: Arc<Router>) -> anyhow::Result<()> {
        router.start();
        let old = self.router.swap(Some(router));
        match old {
            Some(old) => old.stop().await,
            None => Ok(()),
        }
    }

    pub fn router(&self) -> Option<Arc<Router>> {
        self.router.load_full()
    }
}

/// The proxy path: axum fallback handler for everything that is not
/// `/health`.
pub async fn proxy_handler(
    State(proxy): State<Arc<Proxy>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let router = match proxy.router.load_full() {
        Some(router) => router,
        None => {
            return (StatusCode::SERVICE_UNAVAILABLE, "router not initialised").into_response()
        }
    };

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path = req.uri().path().to_string();

    let (route, params) = match router.lookup(&host, &path) {
        Some(found) => found,
        None => return (StatusCode::NOT_FOUND, "route not found").into_response(),
    };

    let backend = match route.pool.next() {
        Some(backend) => backend,
        None => return (StatusCode::SERVICE_UNAVAILABLE, "no backend available").into_response(),
    };

    let guard = ActiveGuard::acquire(backend.clone());

    // The backend address keeps its scheme/host/port; the path is replaced
    // by the stripped request path so services need not know the public
    // prefix.
    let mut out_url = backend.url.clone();
    out_url.set_path(&strip_prefix(&path, &route.prefix));
    out_url.set_query(req.uri().query());

    let (parts, body) = req.into_parts();

    let mut out_headers = parts.headers.clone();
    remove_hop_headers(&mut out_headers);
    // The upstream Host comes from the backend URL.
    out_headers.remove(header::HOST);

    append_header(&mut out_headers, "x-forwarded-for", &client_addr.ip().to_string());
    let proto = parts.uri.scheme_str().unwrap_or("http");
    append_header(&mut out_headers, "x-forwarded-proto", proto);
    append_header(&mut out_headers, "x-forwarded-host", &host);

    for (name, value) in &params {
        append_header(&mut out_headers, &format!("x-param-{}", name), value);
    }

    tracing::debug!(method = %parts.method, url = %out_url, backend = %backend.id, "forwarding request");

    let result = proxy
        .client
        .request(parts.method, out_url)
        .headers(out_headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let resp = match result {
        Ok(resp) => resp,
        Err(e) if e.is_builder() => {
            tracing::error!("failed to build outbound request: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create outbound request")
                .into_response();
        }
        Err(e) => {
            route.pool.record_failure(&backend);
            tracing::warn!(backend = %backend.id, "upstream request failed: {}", e);
            return (StatusCode::BAD_GATEWAY, "bad gateway").into_response();
        }
    };

    let status = resp.status();
    if status.is_success() || status.is_redirection() {
        route.pool.record_success(&backend);
    } else {
        route.pool.record_failure(&backend);
    }

    let mut resp_headers = resp.headers().clone();
    remove_hop_headers(&mut resp_headers);

    // The guard rides in the stream closure: dropped when the body finishes
    // or the client goes away mid-transfer.
    let body_stream = resp.bytes_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    *response.headers_mut() = resp_headers;
    response
}

/// Removes the matched route prefix from the request path.
///
/// A `/*` prefix strips everything up to the wildcard, re-adding a leading
/// `/` and collapsing to `/` when nothing is left; an exact prefix is
/// removed verbatim. The result is never empty: root becomes `/`.
pub(crate) fn strip_prefix(path: &str, prefix: &str) -> String {
    if let Some(base) = prefix.strip_suffix("/*") {
        let stripped = path.strip_prefix(base).unwrap_or(path);
        if stripped.is_empty() || stripped == "/" {
            return "/".to_string();
        }
        if !stripped.starts_with('/') {
            return format!("/{}", stripped);
        }
        return stripped.to_string();
    }

    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Sets `name: value`, comma-appending when the header already exists.
fn append_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, value),
        None => value.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(name, value);
    }
}
