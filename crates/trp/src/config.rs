use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use trp_protocol::PortMapping;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 7777;
pub const DEFAULT_REMOTE_PORT: u16 = 7080;
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOCAL_PORT: u16 = 9090;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Client configuration (parsed from TOML or assembled from flags)
///
/// Every field is optional so that a flag-built config can be layered over
/// a file-built one with [`ClientConfig::or`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server host
    pub server_host: Option<String>,

    /// Tunnel server control port
    pub server_port: Option<u16>,

    /// Port the server should expose (0 = let the server pick)
    pub remote_port: Option<u16>,

    /// Host of the local service to forward to
    pub local_host: Option<String>,

    /// Port of the local service to forward to
    pub local_port: Option<u16>,

    /// Reconnect after the control connection drops
    pub reconnect: Option<bool>,

    /// Seconds to wait between reconnect attempts
    pub reconnect_delay_secs: Option<u64>,
}

/// Client configuration with every default applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub local_host: String,
    pub mapping: PortMapping,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

impl ResolvedClientConfig {
    /// `host:port` of the tunnel server
    pub fn server_addr(&self) -> String {
        join_host_port(&self.server_host, self.server_port)
    }

    /// `host:port` of the local service
    pub fn local_addr(&self) -> String {
        join_host_port(&self.local_host, self.mapping.local)
    }
}

/// IPv6 literals are bracketed so the result parses as a socket address
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path))?;
        let config: ClientConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
        Ok(config)
    }

    /// Fill every unset field from `fallback`
    pub fn or(self, fallback: ClientConfig) -> Self {
        Self {
            server_host: self.server_host.or(fallback.server_host),
            server_port: self.server_port.or(fallback.server_port),
            remote_port: self.remote_port.or(fallback.remote_port),
            local_host: self.local_host.or(fallback.local_host),
            local_port: self.local_port.or(fallback.local_port),
            reconnect: self.reconnect.or(fallback.reconnect),
            reconnect_delay_secs: self.reconnect_delay_secs.or(fallback.reconnect_delay_secs),
        }
    }

    /// Apply defaults for everything still unset
    pub fn resolve(self) -> ResolvedClientConfig {
        ResolvedClientConfig {
            server_host: self
                .server_host
                .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
            server_port: self.server_port.unwrap_or(DEFAULT_SERVER_PORT),
            local_host: self
                .local_host
                .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
            mapping: PortMapping {
                remote: self.remote_port.unwrap_or(DEFAULT_REMOTE_PORT),
                local: self.local_port.unwrap_or(DEFAULT_LOCAL_PORT),
            },
            reconnect: self.reconnect.unwrap_or(true),
            reconnect_delay: self
                .reconnect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECONNECT_DELAY),
        }
    }
}
