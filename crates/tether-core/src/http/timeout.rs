//! Timeout configuration and management for HTTP requests
//!
//! `connect` and `read` bound a single exchange and are handed to every
//! transport; `total` bounds the whole attempt loop of one logical request,
//! including backoff sleeps and any wait on a token refresh.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Timeout configuration, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to establish a connection
    pub connect: f64,
    /// Time allowed between reads of response data
    pub read: Option<f64>,
    /// Wall-clock ceiling for a logical request
    pub total: Option<f64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: 10.0,
            read: Some(30.0),
            total: None,
        }
    }
}

impl TimeoutConfig {
    pub fn new(connect: f64, read: Option<f64>) -> Self {
        Self {
            connect,
            read,
            total: None,
        }
    }

    /// Set the wall-clock ceiling for every request of the session
    pub fn with_total(mut self, seconds: f64) -> Self {
        self.total = Some(seconds);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read.map(seconds)
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        self.total.map(seconds)
    }

    /// Validate timeout configuration
    pub fn validate(&self) -> Result<()> {
        let valid = |value: f64| value.is_finite() && value > 0.0;

        if !valid(self.connect) {
            return Err(Error::configuration("connect timeout must be a positive number"));
        }
        if let Some(read) = self.read {
            if !valid(read) {
                return Err(Error::configuration("read timeout must be a positive number"));
            }
        }
        if let Some(total) = self.total {
            if !valid(total) {
                return Err(Error::configuration("total timeout must be a positive number"));
            }
            if let Some(read) = self.read {
                if read > total {
                    return Err(Error::configuration(
                        "read timeout should be <= total timeout",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Run `future` under an optional wall-clock budget
pub async fn with_timeout<F, T>(
    future: F,
    budget: Option<Duration>,
) -> std::result::Result<T, tokio::time::error::Elapsed>
where
    F: Future<Output = T>,
{
    match budget {
        Some(budget) => tokio::time::timeout(budget, future).await,
        None => Ok(future.await),
    }
}
