//! # Client Configuration
//!
//! The effective configuration the rest of the client consumes. Three
//! layers, later ones winning: the TOML file named by `--config`,
//! `FXTUNNEL_`-prefixed environment variables (dotted keys flattened, e.g.
//! `FXTUNNEL_SERVER_ADDRESS` for `server.address`), then CLI flags.

use fxtunnel_protocol::TunnelType;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// `host:port` of the rendezvous server.
    pub address: String,
    pub token: String,
    /// Offer stream compression during negotiation.
    pub compression: bool,
    /// Dial with TLS.
    pub tls: bool,
    /// Extra PEM root to trust (e.g. a self-signed server certificate).
    pub tls_ca: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            token: String::new(),
            compression: true,
            tls: false,
            tls_ca: None,
        }
    }
}

/// One declared tunnel, re-requested in order after every (re)connect.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSpec {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub remote_port: Option<u16>,
}

impl TunnelSpec {
    /// `name` falls back to `<type>-<local_port>`.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.tunnel_type, self.local_port))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InspectSection {
    pub enabled: bool,
    /// Bind address; ports 4041-4049 are probed when the default is taken.
    pub addr: String,
    /// Overrides the plan's body capture cap, never above it.
    pub max_body_size: Option<u64>,
    /// Overrides the plan's ring capacity, never above it.
    pub max_entries: Option<usize>,
}

impl Default for InspectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "127.0.0.1:4040".into(),
            max_body_size: None,
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub enabled: bool,
    /// Seconds between attempts.
    pub interval: u64,
    /// 0 = retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 5,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    #[serde(rename = "tunnels")]
    pub tunnels: Vec<TunnelSpec>,
    pub inspect: InspectSection,
    pub reconnect: ReconnectSection,
    pub logging: LoggingSection,
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Applies `FXTUNNEL_*` variables over the file values. Unknown keys
    /// are ignored; unparsable numbers/bools are configuration errors.
    pub fn apply_env(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> anyhow::Result<()> {
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix("FXTUNNEL_") else {
                continue;
            };
            match suffix {
                "SERVER_ADDRESS" => self.server.address = value,
                "SERVER_TOKEN" => self.server.token = value,
                "SERVER_COMPRESSION" => self.server.compression = parse_bool(&key, &value)?,
                "SERVER_TLS" => self.server.tls = parse_bool(&key, &value)?,
                "SERVER_TLS_CA" => self.server.tls_ca = Some(value),
                "INSPECT_ENABLED" => self.inspect.enabled = parse_bool(&key, &value)?,
                "INSPECT_ADDR" => self.inspect.addr = value,
                "INSPECT_MAX_BODY_SIZE" => {
                    self.inspect.max_body_size = Some(parse_num(&key, &value)?)
                }
                "INSPECT_MAX_ENTRIES" => {
                    self.inspect.max_entries = Some(parse_num(&key, &value)? as usize)
                }
                "RECONNECT_ENABLED" => self.reconnect.enabled = parse_bool(&key, &value)?,
                "RECONNECT_INTERVAL" => self.reconnect.interval = parse_num(&key, &value)?,
                "RECONNECT_MAX_ATTEMPTS" => {
                    self.reconnect.max_attempts = parse_num(&key, &value)? as u32
                }
                "LOGGING_LEVEL" => self.logging.level = value,
                "LOGGING_FORMAT" => self.logging.format = value,
                _ => {}
            }
        }
        Ok(())
    }

    /// Final sanity checks once all layers are merged.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.server.address.is_empty(),
            "server.address is not configured"
        );
        anyhow::ensure!(
            self.server.address.contains(':'),
            "server.address must be host:port, got `{}`",
            self.server.address
        );
        for spec in &self.tunnels {
            anyhow::ensure!(
                spec.local_port != 0,
                "tunnel `{}` has no local_port",
                spec.display_name()
            );
        }
        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("logging.format must be text or json, got `{other}`"),
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{key}: `{other}` is not a boolean"),
    }
}

fn parse_num(key: &str, value: &str) -> anyhow::Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{key}: `{value}` is not a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_toml_parses() {
        let config: ClientConfig = toml::from_str(
            r#"
            [server]
            address = "tunnel.example:7070"
            token = "tok-1"
            compression = false

            [[tunnels]]
            name = "web"
            type = "http"
            local_port = 3000
            subdomain = "myapp"

            [[tunnels]]
            type = "tcp"
            local_port = 22
            remote_port = 20022

            [inspect]
            enabled = true
            addr = "127.0.0.1:4040"

            [reconnect]
            interval = 5
            max_attempts = 10

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0].tunnel_type, TunnelType::Http);
        assert_eq!(config.tunnels[1].display_name(), "tcp-22");
        assert!(!config.server.compression);
        assert_eq!(config.reconnect.max_attempts, 10);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config: ClientConfig = toml::from_str(
            r#"
            [server]
            address = "old.example:7070"
            token = "old"
            "#,
        )
        .unwrap();
        config
            .apply_env(
                vec![
                    ("FXTUNNEL_SERVER_ADDRESS".into(), "new.example:7071".into()),
                    ("FXTUNNEL_RECONNECT_INTERVAL".into(), "9".into()),
                    ("HOME".into(), "/home/u".into()),
                ]
                .into_iter(),
            )
            .unwrap();
        assert_eq!(config.server.address, "new.example:7071");
        assert_eq!(config.reconnect.interval, 9);
        assert_eq!(config.server.token, "old");
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut config = ClientConfig::default();
        let result = config.apply_env(
            vec![("FXTUNNEL_SERVER_COMPRESSION".into(), "maybe".into())].into_iter(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_address_fails_validation() {
        let config = ClientConfig::default();
        assert!(config.validate().is_err());
    }
}
