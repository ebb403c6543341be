use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    /// Bearer token for remote (tunneled) backends. Localhost needs none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

/// Backoff policy for passive streams such as the active-agents feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub probe_addr: String,
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: format!("http://localhost:{}", default_server_port()),
            token: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_addr: "1.1.1.1:53".to_string(),
            timeout_ms: 5_000,
        }
    }
}

/// Get the default server port based on build type
pub fn default_server_port() -> u16 {
    if cfg!(debug_assertions) { 18765 } else { 8765 }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }
}

impl ConnectivityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "agentlink", "agentlink")
}

impl Config {
    pub fn config_file() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let mut config = match Self::config_file() {
            Some(config_file) if config_file.exists() => {
                let content = std::fs::read_to_string(&config_file)?;
                Self::from_toml(&content)?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(config_dir) = project_dirs() {
            std::fs::create_dir_all(config_dir.config_dir())?;
            let config_file = config_dir.config_dir().join("config.toml");
            let content = toml::to_string_pretty(self)?;
            std::fs::write(config_file, content)?;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(server) = std::env::var("AGENTLINK_SERVER") {
            if !server.trim().is_empty() {
                self.server.base_url = server;
            }
        }
        if let Ok(token) = std::env::var("AGENTLINK_TOKEN") {
            if !token.trim().is_empty() {
                tracing::debug!("Using bearer token from AGENTLINK_TOKEN");
                self.server.token = Some(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = Config::from_toml("[server]\nbase_url = \"https://tunnel.example\"\n").unwrap();
        assert_eq!(config.server.base_url, "https://tunnel.example");
        assert!(config.server.token.is_none());
        assert_eq!(config.reconnect.base_delay(), Duration::from_secs(2));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(30));
        assert_eq!(config.connectivity.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn max_delay_never_below_base() {
        let config = Config::from_toml("[reconnect]\nbase_delay_ms = 5000\nmax_delay_ms = 1000\n").unwrap();
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn token_round_trips_through_toml() {
        let mut config = Config::default();
        config.server.token = Some("secret".to_string());
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.server.token.as_deref(), Some("secret"));
    }
}
