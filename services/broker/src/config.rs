use anyhow::{Context, Result};
use socketbox_broker::BrokerConfig;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

const DEFAULT_CONFIG_PATH: &str = "/usr/local/socketbox/config.yml";

// Service configuration: listener addresses from environment variables,
// broker behavior from an optional YAML file.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // STOMP WebSocket listener bind address.
    pub listen_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    pub broker: BrokerConfig,
}

impl ServerConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let listen_bind = std::env::var("SOCKETBOX_LISTEN_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
            .parse()
            .with_context(|| "parse SOCKETBOX_LISTEN_BIND")?;
        let metrics_bind = std::env::var("SOCKETBOX_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse SOCKETBOX_METRICS_BIND")?;

        let override_path = std::env::var("SOCKETBOX_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound && override_path.is_none() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read broker config: {config_path}"));
            }
        };
        let broker = match contents {
            Some(contents) => {
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?
            }
            None => BrokerConfig::default(),
        };

        Ok(Self {
            listen_bind,
            metrics_bind,
            broker,
        })
    }
}
