use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub relay: RelaySettings,
    pub forward: ForwardSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySettings {
    /// WebSocket URL of the cloud tunneling endpoint
    pub url: String,
    /// Bearer token presented on the upgrade request (acquired externally)
    #[serde(default)]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardSettings {
    pub listen_addr: String,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            relay: RelaySettings {
                url: "wss://127.0.0.1/relay".to_string(),
                bearer_token: None,
            },
            forward: ForwardSettings {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: 3390,
            },
            timeouts: TimeoutSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [relay]
            url = "wss://relay.example.com/tunnel"

            [forward]
            listen_addr = "127.0.0.1"
            listen_port = 3390
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.url, "wss://relay.example.com/tunnel");
        assert!(config.relay.bearer_token.is_none());
        assert_eq!(config.timeouts.connect_timeout_secs, 10);
    }
}
