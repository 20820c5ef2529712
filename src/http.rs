use reqwest::Client;
use std::{env, time::Duration};

const USER_AGENT: &str = concat!("oc-dispatch-rs/", env!("CARGO_PKG_VERSION"));

/// Shared outbound client settings: `HTTP_TIMEOUT_SECS` (default 15) bounds
/// the whole request, `HTTP_CONNECT_TIMEOUT_SECS` (default 5) the connect.
pub fn build_client() -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(secs_from_env("HTTP_TIMEOUT_SECS", 15)))
        .connect_timeout(Duration::from_secs(secs_from_env(
            "HTTP_CONNECT_TIMEOUT_SECS",
            5,
        )))
        .gzip(true)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn secs_from_env(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
