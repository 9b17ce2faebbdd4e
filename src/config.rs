//! Proxy configuration
//!
//! The configuration is persisted by the administration layer as a flat
//! `key=value` file. The proxy only ever reads it.

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{GwProxyError, Result};

/// Default advertised host name
pub const DEFAULT_HOST: &str = "localhost";

/// Default listening port
pub const DEFAULT_PORT: u16 = 9000;

/// Default bind address
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

/// Default upstream daemon WebSocket URL
pub const DEFAULT_UPSTREAM: &str = "ws://localhost:1338";

/// Proxy configuration loaded from the persisted configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Advertised host name (default: localhost)
    pub host: String,
    /// Port to listen on (default: 9000)
    pub port: u16,
    /// Address to bind to (default: 0.0.0.0)
    pub address: String,
    /// Upstream daemon WebSocket URL
    pub upstream: String,
    /// Shared secret for validating client access tokens
    pub token: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            address: DEFAULT_ADDRESS.to_string(),
            upstream: DEFAULT_UPSTREAM.to_string(),
            token: String::new(),
        }
    }
}

impl ProxyConfig {
    /// Get the listener bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Parse and validate the upstream URL
    pub fn upstream_url(&self) -> Result<Url> {
        let url = Url::parse(&self.upstream)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(GwProxyError::InvalidConfig(format!(
                "upstream URL must use ws:// or wss://, got: {}",
                other
            ))),
        }
    }

    /// Validate invariants that would prevent the proxy from starting
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(GwProxyError::InvalidConfig(
                "port must be a valid TCP port".into(),
            ));
        }
        self.upstream_url()?;
        Ok(())
    }
}

/// Reads the persisted proxy configuration
pub struct ProxyConfigManager {
    path: PathBuf,
}

impl ProxyConfigManager {
    /// Create a new configuration manager for the given file path
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Read the configuration file.
    ///
    /// A missing file yields the documented defaults with an empty token
    /// secret. Any other I/O failure, an unparsable value, or a structurally
    /// invalid upstream URL is an error.
    pub fn read_config(&self) -> Result<ProxyConfig> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "Configuration file {} not found, using defaults",
                    self.path.display()
                );
                return Ok(ProxyConfig::default());
            }
            Err(e) => {
                return Err(GwProxyError::ConfigRead(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut config = ProxyConfig::default();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                GwProxyError::ConfigRead(format!(
                    "{}:{}: expected key=value",
                    self.path.display(),
                    lineno + 1
                ))
            })?;

            match key.trim() {
                "host" => config.host = value.trim().to_string(),
                "port" => {
                    config.port = value.trim().parse().map_err(|_| {
                        GwProxyError::InvalidConfig(format!(
                            "port must be a valid TCP port, got: {}",
                            value.trim()
                        ))
                    })?;
                }
                "address" => config.address = value.trim().to_string(),
                "upstream" => config.upstream = value.trim().to_string(),
                // token signature contains '=' padding, so only the first
                // '=' acts as the separator and the value keeps the rest
                "token" => config.token = value.trim().to_string(),
                other => {
                    tracing::warn!("Ignoring unknown configuration key: {}", other);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_config_missing_file() {
        let manager = ProxyConfigManager::new("/nonexistent/gwproxy.conf");
        let config = manager.read_config().unwrap();

        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(config.upstream, DEFAULT_UPSTREAM);
        assert_eq!(config.token, "");
    }

    #[test]
    fn test_read_config_full_file() {
        let file = write_config(concat!(
            "host=localhost\n",
            "port=9005\n",
            "address=127.0.0.1\n",
            "upstream=ws://iqube.local/ws\n",
            "token=iqrfgd2;1;ETi3v8RGLVGXb/uNenhskEiSH/2KussEbantcvjfGQ4=\n",
        ));
        let manager = ProxyConfigManager::new(file.path());
        let config = manager.read_config().unwrap();

        assert_eq!(
            config,
            ProxyConfig {
                host: "localhost".to_string(),
                port: 9005,
                address: "127.0.0.1".to_string(),
                upstream: "ws://iqube.local/ws".to_string(),
                token: "iqrfgd2;1;ETi3v8RGLVGXb/uNenhskEiSH/2KussEbantcvjfGQ4=".to_string(),
            }
        );
    }

    #[test]
    fn test_read_config_partial_file_keeps_defaults() {
        let file = write_config("port=9005\n");
        let config = ProxyConfigManager::new(file.path()).read_config().unwrap();

        assert_eq!(config.port, 9005);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.upstream, DEFAULT_UPSTREAM);
    }

    #[test]
    fn test_read_config_comments_and_blank_lines() {
        let file = write_config("# proxy settings\n\nport=9005\n");
        let config = ProxyConfigManager::new(file.path()).read_config().unwrap();
        assert_eq!(config.port, 9005);
    }

    #[test]
    fn test_read_config_invalid_port() {
        let file = write_config("port=not-a-port\n");
        let err = ProxyConfigManager::new(file.path())
            .read_config()
            .unwrap_err();
        assert!(matches!(err, GwProxyError::InvalidConfig(_)));
    }

    #[test]
    fn test_read_config_invalid_upstream_scheme() {
        let file = write_config("upstream=http://iqube.local/ws\n");
        let err = ProxyConfigManager::new(file.path())
            .read_config()
            .unwrap_err();
        assert!(matches!(err, GwProxyError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let config = ProxyConfig {
            port: 0,
            ..ProxyConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GwProxyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_upstream_url_accepts_wss() {
        let config = ProxyConfig {
            upstream: "wss://iqube.local/ws".to_string(),
            ..ProxyConfig::default()
        };
        assert!(config.upstream_url().is_ok());
    }

    #[test]
    fn test_bind_addr() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }
}
