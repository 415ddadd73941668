// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Bus endpoint of the membership server.
    pub server: String,
    /// Where the device identity and network records live.
    pub data_dir: PathBuf,
    /// `host:port` STUN servers, tried in order. Empty disables discovery.
    pub stun_servers: Vec<String>,
    pub interface_prefix: String,
    pub base_listen_port: u16,
    pub checkin_interval_secs: u64,
    pub reconnect_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    pub stun_timeout_ms: u64,
    /// A handshake older than this no longer counts towards connectivity.
    pub handshake_window_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:4222".into(),
            data_dir: PathBuf::from("/var/lib/wiremesh-agent"),
            stun_servers: vec![
                "stun.l.google.com:19302".into(),
                "stun1.l.google.com:19302".into(),
            ],
            interface_prefix: "wm".into(),
            base_listen_port: 51820,
            checkin_interval_secs: 60,
            reconnect_interval_secs: 30,
            request_timeout_secs: 5,
            probe_timeout_ms: 1500,
            stun_timeout_ms: 2000,
            handshake_window_secs: 180,
        }
    }
}

impl AgentConfig {
    pub fn checkin_interval(&self) -> Duration {
        Duration::from_secs(self.checkin_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stun_timeout(&self) -> Duration {
        Duration::from_millis(self.stun_timeout_ms)
    }

    pub fn handshake_window(&self) -> Duration {
        Duration::from_secs(self.handshake_window_secs)
    }

    /// Interface name for slot `index` (wm0, wm1, ...).
    pub fn interface_name(&self, index: u32) -> String {
        format!("{}{index}", self.interface_prefix)
    }

    /// Preferred listen port for slot `index`. A base of zero lets the OS
    /// pick.
    pub fn listen_port(&self, index: u32) -> u16 {
        if self.base_listen_port == 0 {
            return 0;
        }
        u16::try_from(index)
            .ok()
            .and_then(|i| self.base_listen_port.checked_add(i))
            .unwrap_or(0)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub async fn load(path: &Path) -> Result<AgentConfig, ConfigError> {
    debug!(path = %path.display(), "loading config");

    let config = match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: AgentConfig = toml::from_str(&contents)?;
            info!(
                path = %path.display(),
                server = %config.server,
                stun_servers = config.stun_servers.len(),
                "loaded config"
            );
            config
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            AgentConfig::default()
        }
        Err(e) => return Err(ConfigError::Read(e)),
    };
    validate(&config)?;
    Ok(config)
}

pub async fn save(path: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = toml::to_string_pretty(config)?;
    tokio::fs::write(path, contents).await?;
    info!(path = %path.display(), "saved config");
    Ok(())
}

fn validate(config: &AgentConfig) -> Result<(), ConfigError> {
    if config.interface_prefix.is_empty()
        || !config.interface_prefix.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(ConfigError::Invalid(format!(
            "interface_prefix {:?} must be non-empty and alphanumeric",
            config.interface_prefix
        )));
    }
    // IFNAMSIZ leaves 15 usable bytes; keep room for a few digits.
    if config.interface_prefix.len() > 11 {
        return Err(ConfigError::Invalid("interface_prefix is too long".into()));
    }
    if config.checkin_interval_secs == 0 || config.reconnect_interval_secs == 0 {
        return Err(ConfigError::Invalid("intervals must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn round_trip_toml() {
        let config = AgentConfig {
            server: "mesh.example.com:4222".into(),
            stun_servers: vec![],
            ..AgentConfig::default()
        };
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: AgentConfig = toml::from_str("server = \"10.1.1.1:4222\"").unwrap();
        assert_eq!(parsed.server, "10.1.1.1:4222");
        assert_eq!(parsed.base_listen_port, 51820);
        assert_eq!(parsed.interface_prefix, "wm");
    }

    #[test_case(0, "wm0", 51820 ; "first slot")]
    #[test_case(3, "wm3", 51823 ; "fourth slot")]
    fn interface_slots(index: u32, name: &str, port: u16) {
        let config = AgentConfig::default();
        assert_eq!(config.interface_name(index), name);
        assert_eq!(config.listen_port(index), port);
    }

    #[test]
    fn zero_base_port_defers_to_os() {
        let config = AgentConfig {
            base_listen_port: 0,
            ..AgentConfig::default()
        };
        assert_eq!(config.listen_port(5), 0);
    }

    #[test_case("", false ; "empty")]
    #[test_case("wm", true ; "default")]
    #[test_case("wm-", false ; "dash")]
    #[test_case("averyverylongprefix", false ; "too long")]
    fn prefix_validation(prefix: &str, ok: bool) {
        let config = AgentConfig {
            interface_prefix: prefix.into(),
            ..AgentConfig::default()
        };
        assert_eq!(validate(&config).is_ok(), ok);
    }

    #[tokio::test]
    async fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        assert_eq!(load(&path).await.unwrap(), AgentConfig::default());

        let custom = AgentConfig {
            base_listen_port: 40000,
            ..AgentConfig::default()
        };
        save(&path, &custom).await.unwrap();
        assert_eq!(load(&path).await.unwrap(), custom);
    }
}
