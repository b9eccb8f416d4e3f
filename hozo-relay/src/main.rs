//! Hozo relay: WebSocket relay for collaborative ontology sessions.
//!
//! Configuration comes from the environment, with an optional bind
//! address as the first argument:
//!
//! | Variable                | Default          |
//! |-------------------------|------------------|
//! | `HOZO_BIND_ADDR`        | `127.0.0.1:9090` |
//! | `HOZO_MAX_USERS`        | `100`            |
//! | `HOZO_HEARTBEAT_SECS`   | `30`             |
//! | `HOZO_IDLE_TIMEOUT_SECS`| `90`             |
//! | `HOZO_SESSION_TTL_SECS` | `3600`           |
//!
//! Logging follows `RUST_LOG`.

use std::str::FromStr;

use hozo_collab::server::{RelayServer, ServerConfig};
use log::{error, info, warn};

fn parse_or<T: FromStr + Copy>(name: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {name}={raw:?}");
            default
        }),
        None => default,
    }
}

fn server_config<F>(arg: Option<String>, var: F) -> ServerConfig
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: arg
            .or_else(|| var("HOZO_BIND_ADDR"))
            .unwrap_or(defaults.bind_addr),
        max_users_per_session: parse_or(
            "HOZO_MAX_USERS",
            var("HOZO_MAX_USERS"),
            defaults.max_users_per_session,
        ),
        heartbeat_interval_secs: parse_or(
            "HOZO_HEARTBEAT_SECS",
            var("HOZO_HEARTBEAT_SECS"),
            defaults.heartbeat_interval_secs,
        ),
        idle_timeout_secs: parse_or(
            "HOZO_IDLE_TIMEOUT_SECS",
            var("HOZO_IDLE_TIMEOUT_SECS"),
            defaults.idle_timeout_secs,
        ),
        session_ttl_secs: parse_or(
            "HOZO_SESSION_TTL_SECS",
            var("HOZO_SESSION_TTL_SECS"),
            defaults.session_ttl_secs,
        ),
        ..defaults
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = server_config(std::env::args().nth(1), |name| std::env::var(name).ok());
    info!(
        "Starting Hozo relay on {} (max {} users per session)",
        config.bind_addr, config.max_users_per_session
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay server stopped: {e}");
        std::process::exit(1);
    }
}
