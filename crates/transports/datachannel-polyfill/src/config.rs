//! Configuration types for the data channel polyfill

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the polyfill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolyfillConfig {
    /// WebSocket URL of the rendezvous service (ws:// or wss://)
    pub rendezvous_url: String,

    /// Prefix that turns a peer identity into a routable address (default: "pc.")
    pub address_prefix: String,

    /// STUN server used by the native capability probe
    pub stun_server: String,

    /// Timeout for opening one dedicated connection in seconds (default: 10, range: 1-300)
    pub connect_timeout_secs: u64,
}

impl Default for PolyfillConfig {
    fn default() -> Self {
        Self {
            rendezvous_url: "ws://localhost:8080".to_string(),
            address_prefix: "pc.".to_string(),
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl PolyfillConfig {
    /// Create a configuration pointing at the given rendezvous URL
    pub fn with_rendezvous_url(url: impl Into<String>) -> Self {
        Self {
            rendezvous_url: url.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `rendezvous_url` is not a ws:// or wss:// URL
    /// - `address_prefix` is empty
    /// - `connect_timeout_secs` is not in range 1-300
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.rendezvous_url).map_err(|e| {
            Error::InvalidConfig(format!(
                "rendezvous_url '{}' is not a URL: {}",
                self.rendezvous_url, e
            ))
        })?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "rendezvous_url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if self.address_prefix.is_empty() {
            return Err(Error::InvalidConfig(
                "address_prefix must not be empty".to_string(),
            ));
        }

        if !(1..=300).contains(&self.connect_timeout_secs) {
            return Err(Error::InvalidConfig(format!(
                "connect_timeout_secs must be in range 1-300, got {}",
                self.connect_timeout_secs
            )));
        }

        Ok(())
    }

    /// Routable address for a peer identity
    pub fn address_for(&self, id: &str) -> String {
        format!("{}{}", self.address_prefix, id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PolyfillConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.address_prefix, "pc.");
    }

    #[test]
    fn test_address_for() {
        let config = PolyfillConfig::default();
        assert_eq!(config.address_for("alice"), "pc.alice");
    }

    #[test]
    fn test_rejects_http_url() {
        let config = PolyfillConfig::with_rendezvous_url("http://localhost:8080");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let config = PolyfillConfig {
            address_prefix: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_timeout_out_of_range() {
        let config = PolyfillConfig {
            connect_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_fills_defaults() {
        let config = PolyfillConfig::from_toml_str(
            r#"
            rendezvous_url = "wss://relay.example.org/dcpf"
            connect_timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.rendezvous_url, "wss://relay.example.org/dcpf");
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.address_prefix, "pc.");
    }

    #[test]
    fn test_from_toml_validates() {
        let result = PolyfillConfig::from_toml_str(r#"rendezvous_url = "ftp://nope""#);
        assert!(result.is_err());
    }
}
