//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Command-line flags (applied by the binary)
//! 2. Environment variables (TRP_*)
//! 3. Config file (server.toml)
//! 4. Default values

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use trp_protocol::{HEARTBEAT_INTERVAL, HEARTBEAT_TOLERANCE};

/// Environment variable prefix
const ENV_PREFIX: &str = "TRP";

/// Port the control plane listens on unless configured otherwise
pub const DEFAULT_CONTROL_PORT: u16 = 7777;

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control plane binds to
    pub bind_addr: Option<IpAddr>,

    /// Port for control connections from tunnel clients
    pub control_port: Option<u16>,

    /// Address public tunnel listeners bind to
    pub tunnel_bind_addr: Option<IpAddr>,

    /// Seconds without any frame before a client is dropped (0 disables)
    pub heartbeat_timeout_secs: Option<u64>,
}

/// Fully resolved server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServerConfig {
    pub control_addr: SocketAddr,
    pub tunnel_bind_addr: IpAddr,
    /// `None` when idle enforcement is disabled
    pub heartbeat_timeout: Option<Duration>,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Parse an optional raw value, naming the variable on failure
fn parse_var<T>(name: &str, raw: Option<String>) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|v| {
        v.trim()
            .parse()
            .with_context(|| format!("Invalid value for {}_{}: {:?}", ENV_PREFIX, name, v))
    })
    .transpose()
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(get_env)
    }

    fn resolve_with(
        self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<ResolvedServerConfig> {
        let default_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

        // Bind address: ENV > config > 0.0.0.0
        let bind_addr = parse_var("BIND_ADDR", lookup("BIND_ADDR"))?
            .or(self.bind_addr)
            .unwrap_or(default_ip);

        // Control port: ENV > config > default 7777
        let control_port = parse_var("CONTROL_PORT", lookup("CONTROL_PORT"))?
            .or(self.control_port)
            .unwrap_or(DEFAULT_CONTROL_PORT);

        // Tunnel bind address: ENV > config > 0.0.0.0
        let tunnel_bind_addr = parse_var("TUNNEL_BIND_ADDR", lookup("TUNNEL_BIND_ADDR"))?
            .or(self.tunnel_bind_addr)
            .unwrap_or(default_ip);

        // Heartbeat timeout: ENV > config > interval x tolerance
        let default_timeout = HEARTBEAT_INTERVAL.as_secs() * u64::from(HEARTBEAT_TOLERANCE);
        let timeout_secs = parse_var("HEARTBEAT_TIMEOUT_SECS", lookup("HEARTBEAT_TIMEOUT_SECS"))?
            .or(self.heartbeat_timeout_secs)
            .unwrap_or(default_timeout);

        Ok(ResolvedServerConfig {
            control_addr: SocketAddr::new(bind_addr, control_port),
            tunnel_bind_addr,
            heartbeat_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}
