//! Authentication for outgoing requests
//!
//! Supports:
//! - Static credentials applied to every request (Basic, Bearer, custom header)
//! - `${ENV:VAR}` expansion in configured credential values
//! - OAuth1 signing and token exchanges ([`oauth1`])
//! - OAuth2 token lifecycle with single-flight refresh ([`oauth2`])

pub mod oauth1;
pub mod oauth2;

use std::io::Write;
use std::sync::{Arc, OnceLock};

use base64::prelude::BASE64_STANDARD;
use base64::write::EncoderWriter;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::request::Request;

/// Applies credentials to request headers
pub trait AuthHandler: Send + Sync {
    /// Apply authentication to request headers
    fn apply_auth(&self, headers: &mut HeaderMap) -> Result<()>;

    /// Validate that required credentials are available
    fn validate_credentials(&self) -> Result<()>;
}

/// Authorizes one attempt of a request just before it is sent
///
/// A session calls this again for every retry and protocol fallback, so
/// single-use values such as nonces are never replayed.
pub trait RequestAuthorizer: Send + Sync {
    fn authorize(&self, request: &mut Request) -> Result<()>;
}

/// Header credentials of an [`AuthHandler`], applied per attempt
pub(crate) struct HeaderAuthorizer(pub(crate) Arc<dyn AuthHandler>);

impl RequestAuthorizer for HeaderAuthorizer {
    fn authorize(&self, request: &mut Request) -> Result<()> {
        self.0.apply_auth(request.header_map_mut())
    }
}

/// A credential attached to every request of an Enhanced Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StaticAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
    Header { name: String, value: String },
}

impl StaticAuth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        StaticAuth::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        StaticAuth::Bearer {
            token: token.into(),
        }
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        StaticAuth::Header {
            name: name.into(),
            value: value.into(),
        }
    }

    fn header_pair(&self) -> Result<(HeaderName, HeaderValue)> {
        let (name, mut value) = match self {
            StaticAuth::Basic { username, password } => (
                AUTHORIZATION,
                basic_auth(&expand_env_vars(username)?, &expand_env_vars(password)?)?,
            ),
            StaticAuth::Bearer { token } => (
                AUTHORIZATION,
                header_value(&format!("Bearer {}", expand_env_vars(token)?))?,
            ),
            StaticAuth::Header { name, value } => {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    Error::configuration(format!("invalid auth header name '{}': {}", name, e))
                })?;
                (name, header_value(&expand_env_vars(value)?)?)
            }
        };
        value.set_sensitive(true);
        Ok((name, value))
    }
}

impl AuthHandler for StaticAuth {
    fn apply_auth(&self, headers: &mut HeaderMap) -> Result<()> {
        let (name, value) = self.header_pair()?;
        headers.insert(name, value);
        Ok(())
    }

    fn validate_credentials(&self) -> Result<()> {
        self.header_pair().map(|_| ())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::configuration(format!("invalid authorization value: {}", e)))
}

/// `Authorization: Basic` value for the given credentials
pub fn basic_auth(username: &str, password: &str) -> Result<HeaderValue> {
    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        write!(encoder, "{}:{}", username, password)
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| Error::configuration(format!("failed to encode credentials: {}", e)))?;
    }
    let mut value = HeaderValue::from_bytes(&buf)
        .map_err(|e| Error::configuration(format!("invalid basic credentials: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{ENV:([^}]+)\}").expect("valid env pattern"))
}

/// Expand `${ENV:VAR}` references in a credential value
pub fn expand_env_vars(value: &str) -> Result<String> {
    let mut result = value.to_string();

    for cap in env_pattern().captures_iter(value) {
        let var_name = &cap[1];
        let env_value = std::env::var(var_name).map_err(|_| {
            Error::configuration(format!("Environment variable {} not found", var_name))
        })?;

        let pattern = format!("${{ENV:{}}}", var_name);
        result = result.replace(&pattern, &env_value);
    }

    Ok(result)
}
