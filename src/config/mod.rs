//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Maximum concurrent tunnels
    pub max_connections: usize,
    /// Outbound proxy connect timeout in seconds
    pub connect_timeout: u64,
    /// TLS certificate path
    pub tls_cert: Option<String>,
    /// TLS key path
    pub tls_key: Option<String>,
    /// Configuration document handed to clients (`IPv4`, `DNS`, ...)
    pub settings: toml::Table,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            max_connections: 1000,
            connect_timeout: 10,
            tls_cert: None,
            tls_key: None,
            settings: toml::Table::new(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (`host:port`)
    pub server: String,
    /// Use TLS to reach the server
    pub tls: bool,
    /// Server name for the TLS handshake, if not the server host
    pub tls_sni: Option<String>,
    /// Extra CA bundle (PEM) to trust
    pub tls_ca: Option<String>,
    /// Ask the server for its configuration document after connecting
    pub fetch_configuration: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            tls: true,
            tls_sni: None,
            tls_ca: None,
            fetch_configuration: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    ///
    /// `RUST_LOG` wins over `level` when set.
    pub fn init(&self) -> Result<(), crate::Error> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| crate::Error::Config(format!("Invalid log level: {}", e)))?;

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = match self.format.as_str() {
            "json" => builder.json().try_init(),
            "compact" => builder.compact().try_init(),
            "pretty" => builder.try_init(),
            other => {
                return Err(crate::Error::Config(format!("Unknown log format: {}", other)));
            }
        };
        result.map_err(|e| crate::Error::Config(format!("Failed to initialize logging: {}", e)))
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let settings: toml::Table = toml::toml! {
        [IPv4]
        Netmask = "255.255.255.0"
        Pool = { StartAddress = "10.8.0.2", EndAddress = "10.8.0.254" }

        [DNS]
        Servers = ["10.8.0.1"]
        SearchDomains = ["vpn.internal"]
    };

    Config {
        server: Some(ServerConfig {
            settings,
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ServerSettings;

    #[test]
    fn test_example_config_saves_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxtunnel.toml");

        generate_example_config().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        let server = loaded.server.unwrap();
        assert_eq!(server.listen, "0.0.0.0:443");
        assert_eq!(server.connect_timeout, 10);
        let settings = ServerSettings::from_toml(&server.settings).unwrap();
        assert!(settings.pool().is_some());

        let client = loaded.client.unwrap();
        assert!(client.tls);
        assert!(!client.fetch_configuration);
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server = "vpn.example.com:8443"
            fetch_configuration = true
            "#,
        )
        .unwrap();

        assert!(config.server.is_none());
        let client = config.client.unwrap();
        assert_eq!(client.server, "vpn.example.com:8443");
        assert!(client.fetch_configuration);
        assert!(client.tls);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_unknown_log_format() {
        let logging = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(matches!(logging.init(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("absent.toml")),
            Err(crate::Error::Config(_))
        ));
    }
}
