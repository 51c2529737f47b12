//! # Server Configuration
//!
//! Effective configuration for the rendezvous server. Parsed from a TOML
//! file when `--config` (or the conventional `/etc/fxtunnel/server.toml`)
//! points at one; every field has a self-hosting-friendly default.

use fxtunnel_protocol::Capabilities;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Inclusive public port range used for TCP/UDP tunnel allocation.
#[derive(Debug, Clone, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 20000,
            max: 21000,
        }
    }
}

/// TLS settings for the control/data listener. When `enabled` is set with no
/// cert/key paths, the server self-signs a certificate for `domain` at boot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// One accepted token and the plan envelope it grants.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    /// Stable client id to hand back; generated per session when absent.
    pub client_id: Option<String>,
    /// Unix milliseconds after which the token is refused with TOKEN_EXPIRED.
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the control/data listener clients dial.
    pub listen_addr: SocketAddr,

    /// Address of the shared public HTTP listener (subdomain routing).
    pub public_http_addr: SocketAddr,

    /// Base domain under which HTTP tunnel subdomains live.
    pub domain: String,

    /// Whether this server offers stream compression during negotiation.
    pub compression: bool,

    /// Public port pool for TCP/UDP tunnels.
    pub port_range: PortRange,

    /// Loopback REST API for operators; disabled when absent.
    pub api_addr: Option<SocketAddr>,

    pub tls: TlsConfig,

    /// Accepted tokens. An empty table accepts any token with default
    /// capabilities, which is only sensible on private networks.
    pub tokens: Vec<TokenEntry>,

    /// Oldest client version the server still speaks to.
    pub min_client_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 7070).into(),
            public_http_addr: ([0, 0, 0, 0], 8080).into(),
            domain: "localhost".into(),
            compression: true,
            port_range: PortRange::default(),
            api_addr: None,
            tls: TlsConfig::default(),
            tokens: Vec::new(),
            min_client_version: "0.1.0".into(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            domain = "tunnel.example"
            [[tokens]]
            token = "tok-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.domain, "tunnel.example");
        assert_eq!(config.port_range.min, 20000);
        assert!(config.compression);
        assert_eq!(config.tokens.len(), 1);
        assert!(config.tokens[0].capabilities.is_none());
    }

    #[test]
    fn token_capabilities_override() {
        let config: ServerConfig = toml::from_str(
            r#"
            [[tokens]]
            token = "tok-pro"
            [tokens.capabilities]
            inspector_enabled = true
            max_body_size = 1048576
            max_buffer_entries = 2000
            max_tunnels = 32
            "#,
        )
        .unwrap();
        let caps = config.tokens[0].capabilities.as_ref().unwrap();
        assert_eq!(caps.max_tunnels, 32);
    }
}
