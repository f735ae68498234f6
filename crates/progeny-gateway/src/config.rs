use std::{net::SocketAddr, time::Duration};

use crate::error::ConfigError;

pub const DEFAULT_ADDR: &str = "0.0.0.0:9000";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://progeny-processes.db?mode=rwc";

/// Where session lookups go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LookupMode {
    /// Query the persisted registry on every request.
    #[default]
    Registry,
    /// Read the registry once at startup and serve from memory.
    Snapshot,
}

impl LookupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub lookup: LookupMode,
    pub upstream_host: String,
    pub upstream_timeout: Duration,
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_addr = env_trimmed("PROGENY_GATEWAY_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = raw_addr.parse().map_err(|e: std::net::AddrParseError| ConfigError {
            name: "PROGENY_GATEWAY_ADDR",
            value: raw_addr.clone(),
            reason: e.to_string(),
        })?;

        let database_url = env_trimmed("PROGENY_DATABASE_URL")
            .or_else(|| env_trimmed("DATABASE_URL"))
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let lookup = match env_trimmed("PROGENY_GATEWAY_LOOKUP")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("registry") => LookupMode::Registry,
            Some("snapshot") => LookupMode::Snapshot,
            Some(other) => {
                return Err(ConfigError {
                    name: "PROGENY_GATEWAY_LOOKUP",
                    value: other.to_string(),
                    reason: "expected `registry` or `snapshot`".to_string(),
                });
            }
        };

        let upstream_host =
            env_trimmed("PROGENY_UPSTREAM_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let upstream_timeout = env_trimmed("PROGENY_UPSTREAM_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(100, 600_000))
            .unwrap_or(30_000);

        Ok(Self {
            addr,
            database_url,
            lookup,
            upstream_host,
            upstream_timeout: Duration::from_millis(upstream_timeout),
        })
    }
}
