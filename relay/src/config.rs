//! Configuration file parser for GuacTunnel Relay
//!
//! Supports guactunnel.yml with the guacd endpoint, transport tuning and
//! the connections browsers may open.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the HTTP and WebSocket endpoints listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default)]
    pub guacd: GuacdConfig,

    #[serde(default)]
    pub http_tunnel: HttpTunnelConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Connections by identifier (the `GUAC_ID` request parameter)
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

/// guacd endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuacdConfig {
    #[serde(default = "default_guacd_host")]
    pub host: String,

    #[serde(default = "default_guacd_port")]
    pub port: u16,

    /// Connect to guacd over TLS
    #[serde(default)]
    pub ssl: bool,

    /// PEM bundle used to verify guacd's certificate
    pub ca_file: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for GuacdConfig {
    fn default() -> Self {
        Self {
            host: default_guacd_host(),
            port: default_guacd_port(),
            ssl: false,
            ca_file: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl GuacdConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Long-poll transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTunnelConfig {
    /// Close tunnels no request has touched for this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for HttpTunnelConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl HttpTunnelConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// WebSocket transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Bytes of instruction data batched into one text frame
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

/// A remote desktop connection guacd can open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// vnc, rdp, ssh, telnet or kubernetes
    pub protocol: String,

    /// Protocol parameters, matched against the names guacd asks for
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_guacd_host() -> String {
    "localhost".to_string()
}

fn default_guacd_port() -> u16 {
    4822
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    15
}

fn default_buffer_size() -> usize {
    8192
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            guacd: GuacdConfig::default(),
            http_tunnel: HttpTunnelConfig::default(),
            websocket: WebSocketConfig::default(),
            connections: HashMap::new(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.guacd.port == 0 {
            anyhow::bail!("Invalid guacd port 0");
        }
        if self.guacd.host.is_empty() {
            anyhow::bail!("guacd host cannot be empty");
        }
        if self.http_tunnel.idle_timeout_secs == 0 {
            anyhow::bail!("http_tunnel.idle_timeout_secs must be greater than 0");
        }
        if self.websocket.buffer_size == 0 {
            anyhow::bail!("websocket.buffer_size must be greater than 0");
        }

        for (id, connection) in &self.connections {
            if connection.protocol.is_empty() {
                anyhow::bail!("Protocol cannot be empty for connection '{}'", id);
            }
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "guactunnel.yml",
            "guactunnel.yaml",
            ".guactunnel.yml",
            ".guactunnel.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
listen: 127.0.0.1:9090
guacd:
  host: guacd.internal
  ssl: true
http_tunnel:
  idle_timeout_secs: 30
connections:
  desktop:
    protocol: vnc
    parameters:
      hostname: 10.0.0.5
      port: "5901"
  shell:
    protocol: ssh
"#;
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen.port(), 9090);
        assert_eq!(config.guacd.host, "guacd.internal");
        assert_eq!(config.guacd.port, 4822);
        assert!(config.guacd.ssl);
        assert_eq!(config.http_tunnel.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.websocket.buffer_size, 8192);
        assert_eq!(config.connections["desktop"].parameters["port"], "5901");
        assert!(config.connections["shell"].parameters.is_empty());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: RelayConfig = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.guacd.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_validation() {
        let mut config = RelayConfig::default();
        config.guacd.port = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.websocket.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.connections.insert(
            "bad".into(),
            ConnectionConfig {
                protocol: String::new(),
                parameters: HashMap::new(),
            },
        );
        assert!(config.validate().is_err());
    }
}
