//! HTTP front-end.
//!
//! Serves `/health` for the proxy itself and hands every other request to
//! the proxy fallback handler.

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::proxy::{proxy_handler, Proxy};

pub struct HttpServer {
    listen_addr: String,
    proxy: Arc<Proxy>,
}

impl HttpServer {
    pub fn new(listen_addr: String, proxy: Arc<Proxy>) -> Self {
        Self { listen_addr, proxy }
    }

    /// The axum application: `/health` plus the proxy fallback.
    pub fn app(proxy: Arc<Proxy>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(proxy)
    }

    /// Runs until ctrl-c / SIGTERM.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        let app = Self::app(self.proxy.clone());
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("balto listening on {}", self.listen_addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
