//! Runtime configuration.
//!
//! Process settings come from environment variables; the routing table is a
//! plain list of `{domain, path_prefix, ports}` records, deserialised from a
//! JSON file. The core only ever sees the deserialised records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the proxy listens on.
    pub listen_addr: String,
    /// Path to the JSON route table.
    pub routes_path: Option<String>,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            routes_path: None,
            debug: false,
        }
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    let listen_addr =
        std::env::var("BALTO_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let routes_path = std::env::var("BALTO_ROUTES_PATH").ok();

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        listen_addr,
        routes_path,
        debug,
    })
}

/// One routing record: requests for `domain` under `path_prefix` are spread
/// across `http://localhost:<port>` for each port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub domain: String,
    pub path_prefix: String,
    pub ports: Vec<String>,
}

pub fn load_routes(path: &str) -> anyhow::Result<Vec<RouteConfig>> {
    let data = std::fs::read_to_string(path)?;
    let routes: Vec<RouteConfig> = serde_json::from_str(&data)?;
    Ok(routes)
}
