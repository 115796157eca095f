//! balto - composition root.
//!
//! Wires configuration, the routing trie, the health supervisors and the
//! HTTP front-end together.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

use balto::{config, router, HttpServer, Proxy};

#[cfg_attr(coverage_nightly, coverage(off))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config()?;

    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!("starting balto listen={}", cfg.listen_addr);

    let routes = match &cfg.routes_path {
        Some(path) => {
            let routes = config::load_routes(path)?;
            tracing::info!("loaded {} route(s) from {}", routes.len(), path);
            routes
        }
        None => {
            tracing::warn!("BALTO_ROUTES_PATH not set, starting with an empty route table");
            Vec::new()
        }
    };

    let table = Arc::new(router::build_from_config(&routes)?);
    table.start();
    router::set_current(table.clone());

    let proxy = Arc::new(Proxy::new(Some(table)));
    let server = HttpServer::new(cfg.listen_addr.clone(), proxy);
    server.run().await?;

    // Drain probe tasks before exiting.
    if let Some(current) = router::current() {
        if let Err(e) = current.stop().await {
            tracing::warn!("shutdown: {}", e);
        }
    }

    tracing::info!("balto stopped");
    Ok(())
}
