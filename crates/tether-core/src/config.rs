//! Session configuration
//!
//! Configuration is resolved from, in increasing precedence:
//! - Default values
//! - A configuration file (TOML or JSON)
//! - Environment variables (`TETHER_*`)
//!
//! Durations are expressed in seconds.

use std::collections::BTreeMap;
use std::path::Path;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::auth::StaticAuth;
use crate::error::{Error, Result};
use crate::http::protocol::ProtocolVersion;
use crate::http::retry::RetryConfig;
use crate::http::timeout::TimeoutConfig;
use crate::http::transport::{PoolSettings, TransportSettings};

/// Construction-time configuration of an Enhanced Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shorthand for `retry.total`; wins when set
    pub max_retries: Option<u32>,

    /// Retry and backoff settings
    pub retry: RetryConfig,

    /// Connect, read and total timeouts
    pub timeout: TimeoutConfig,

    /// Connection pool sizing
    pub pool: PoolConfig,

    /// Requested protocol version
    pub http_version: ProtocolVersion,

    /// Default headers merged under every request's own headers
    pub headers: BTreeMap<String, String>,

    /// Static credential applied to every request
    pub auth: Option<StaticAuth>,
}

/// Connection pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of per-target pools kept alive
    pub pool_connections: usize,
    /// Connections kept per pool
    pub pool_maxsize: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_connections: 10,
            pool_maxsize: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            pool: PoolConfig::default(),
            http_version: ProtocolVersion::default(),
            headers: BTreeMap::new(),
            auth: None,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration {
            message: "Invalid TOML configuration".to_string(),
            source: Some(e.into()),
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Configuration {
            message: "Invalid JSON configuration".to_string(),
            source: Some(e.into()),
        })
    }

    /// Load configuration from a file, by extension (`.toml` or `.json`)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("Failed to read configuration file {}", path.display()),
            source: Some(e.into()),
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(Error::configuration(format!(
                "Unsupported configuration format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Apply environment overrides
    pub fn merge_with_env(&mut self) -> Result<()> {
        if let Some(value) = env_var("TETHER_MAX_RETRIES") {
            self.max_retries = Some(parse_env("TETHER_MAX_RETRIES", &value)?);
        }
        if let Some(value) = env_var("TETHER_HTTP_VERSION") {
            self.http_version = parse_env("TETHER_HTTP_VERSION", &value)?;
        }
        if let Some(value) = env_var("TETHER_TIMEOUT_SECS") {
            let total: f64 = parse_env("TETHER_TIMEOUT_SECS", &value)?;
            self.timeout.total = Some(total);
            // a per-read timeout above the ceiling can never fire
            self.timeout.read = self.timeout.read.map(|read| read.min(total));
        }
        if let Some(value) = env_var("TETHER_POOL_MAXSIZE") {
            self.pool.pool_maxsize = parse_env("TETHER_POOL_MAXSIZE", &value)?;
        }
        Ok(())
    }

    /// The retry configuration with `max_retries` applied
    pub fn effective_retry(&self) -> RetryConfig {
        let mut retry = self.retry.clone();
        if let Some(max_retries) = self.max_retries {
            retry.total = max_retries;
        }
        retry
    }

    /// Settings handed to every transport the session creates
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            pool: PoolSettings {
                max_pools: self.pool.pool_connections,
                max_connections: self.pool.pool_maxsize,
            },
            connect_timeout: self.timeout.connect_timeout(),
            read_timeout: self.timeout.read_timeout(),
        }
    }

    /// Default headers as a header map
    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::configuration(format!("invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                Error::configuration(format!("invalid value for header '{}': {}", name, e))
            })?;
            map.insert(header, value);
        }
        Ok(map)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.timeout.validate()?;
        if self.pool.pool_connections == 0 {
            return Err(Error::configuration("pool_connections must be at least 1"));
        }
        if self.pool.pool_maxsize == 0 {
            return Err(Error::configuration("pool_maxsize must be at least 1"));
        }
        self.header_map()?;
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        Error::configuration(format!("invalid value '{}' for {}: {}", value, name, e))
    })
}

/// Builder for session configuration
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = Some(max_retries);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn pool(mut self, pool_connections: usize, pool_maxsize: usize) -> Self {
        self.config.pool = PoolConfig {
            pool_connections,
            pool_maxsize,
        };
        self
    }

    pub fn http_version(mut self, version: ProtocolVersion) -> Self {
        self.config.http_version = version;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    pub fn auth(mut self, auth: StaticAuth) -> Self {
        self.config.auth = Some(auth);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_version, ProtocolVersion::Http11);
        assert_eq!(config.effective_retry().total, 3);
    }

    #[test]
    fn test_from_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            max_retries = 5
            http_version = "2"

            [retry]
            backoff_factor = 0.5
            status_forcelist = [503]
            allowed_methods = ["GET", "POST"]

            [timeout]
            connect = 5
            read = 30

            [pool]
            pool_connections = 4

            [headers]
            "X-Client" = "tether"

            [auth]
            type = "bearer"
            token = "abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.http_version, ProtocolVersion::Http2);
        let retry = config.effective_retry();
        assert_eq!(retry.total, 5);
        assert_eq!(retry.backoff_factor, 0.5);
        assert!(retry.respect_retry_after_header);
        assert_eq!(config.pool.pool_connections, 4);
        assert_eq!(config.pool.pool_maxsize, 10);
        assert_eq!(config.auth, Some(StaticAuth::bearer("abc")));

        let settings = config.transport_settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.pool.max_pools, 4);
        assert_eq!(config.header_map().unwrap()["x-client"], "tether");
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"http_version": "3", "timeout": {{"connect": 2, "total": 20}}}}"#).unwrap();

        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.http_version, ProtocolVersion::Http3);
        assert_eq!(config.timeout.total_timeout(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(SessionConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("TETHER_MAX_RETRIES", "7");
        std::env::set_var("TETHER_HTTP_VERSION", "HTTP/2");
        std::env::set_var("TETHER_TIMEOUT_SECS", "12.5");
        std::env::set_var("TETHER_POOL_MAXSIZE", "32");

        let mut config = SessionConfig::default();
        let result = config.merge_with_env();

        std::env::remove_var("TETHER_MAX_RETRIES");
        std::env::remove_var("TETHER_HTTP_VERSION");
        std::env::remove_var("TETHER_TIMEOUT_SECS");
        std::env::remove_var("TETHER_POOL_MAXSIZE");

        result.unwrap();
        assert_eq!(config.effective_retry().total, 7);
        assert_eq!(config.http_version, ProtocolVersion::Http2);
        assert_eq!(config.timeout.total, Some(12.5));
        assert_eq!(config.timeout.read, Some(12.5));
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.pool_maxsize, 32);
    }

    #[test]
    fn test_validation_failures() {
        let config = SessionConfigBuilder::new().pool(0, 10).build();
        assert!(config.validate().is_err());

        let config = SessionConfigBuilder::new()
            .timeout(TimeoutConfig::new(5.0, Some(60.0)).with_total(10.0))
            .build();
        assert!(config.validate().is_err());

        let config = SessionConfigBuilder::new().header("bad header", "x").build();
        assert!(config.validate().is_err());

        let config = SessionConfigBuilder::new()
            .retry(RetryConfig::default().with_backoff_factor(f64::NAN))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_http_version() {
        let err = SessionConfig::from_json_str(r#"{"http_version": "4"}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
