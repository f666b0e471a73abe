//! Error types for the Tether core library
//!
//! Every failure a caller can observe is one of the [`Error`] variants below.
//! Negotiation failures and retryable failures are absorbed by the session loop
//! and never appear here directly; when they are the reason a request gave up,
//! they are carried as the `last_failure` of an exhausted or timed-out request.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::http::TransportError;

/// Main error type for Tether operations
#[derive(Error, Debug)]
pub enum Error {
    /// Every permitted attempt was consumed without success
    #[error("Retries exhausted after {attempts} attempts: {last_failure}")]
    RetryExhausted { attempts: u32, last_failure: Failure },

    /// The wall-clock ceiling for the request was exceeded
    #[error(
        "Request timed out after {elapsed:?} ({attempts} attempts, last failure: {})",
        describe_last(.last_failure)
    )]
    RequestTimeout {
        attempts: u32,
        elapsed: Duration,
        last_failure: Option<Failure>,
    },

    /// Fatal transport failure that retrying cannot fix
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<TransportError>,
    },

    /// A token fetch or refresh call itself failed
    #[error("OAuth token exchange failed: {message}")]
    AuthExchange {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Credentials were rejected and cannot be repaired by retrying
    #[error("Authentication failed: {message}; re-authentication is required")]
    Authentication { message: String },

    /// A response carried an error status and the caller asked for it to fail
    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: StatusCode, url: String },

    /// Invalid session or request configuration
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The request URL could not be parsed or has no host
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// JSON parsing and serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Number of attempts made before the request gave up, when known
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::RetryExhausted { attempts, .. } | Error::RequestTimeout { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// The caller has to obtain new credentials; retrying will not help
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }

    /// Last underlying failure for exhausted or timed-out requests
    pub fn last_failure(&self) -> Option<&Failure> {
        match self {
            Error::RetryExhausted { last_failure, .. } => Some(last_failure),
            Error::RequestTimeout { last_failure, .. } => last_failure.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::Json {
            message: source.to_string(),
            source,
        }
    }
}

fn describe_last(failure: &Option<Failure>) -> String {
    failure
        .as_ref()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Summary of the failure observed on an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The server answered with a status from the retry set
    Status(StatusCode),
    /// The transport failed before a response was received
    Network(String),
    /// The requested protocol could not be established
    Negotiation(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Status(status) => write!(f, "HTTP status {}", status.as_u16()),
            Failure::Network(message) => write!(f, "network failure: {}", message),
            Failure::Negotiation(message) => write!(f, "protocol negotiation failure: {}", message),
        }
    }
}
