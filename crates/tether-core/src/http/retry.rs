//! Retry logic with exponential backoff for HTTP requests
//!
//! The policy classifies each attempt, decides whether another attempt is
//! allowed and computes how long to wait before it. The attempt count is a
//! soft limit; a configured request timeout is a hard ceiling.
//!
//! Delays are computed here rather than through the `backoff` crate: full
//! jitter over `[0, delay]` and a per-response `Retry-After` override need
//! the exact delay of each retry.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Failure, Result};
use crate::http::request::Response;
use crate::http::transport::TransportError;

const DEFAULT_STATUS_FORCELIST: [u16; 5] = [429, 500, 502, 503, 504];
const DEFAULT_ALLOWED_METHODS: [&str; 6] = ["DELETE", "GET", "HEAD", "OPTIONS", "PUT", "TRACE"];

/// Retry configuration attached to a session or a single call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt
    pub total: u32,
    /// Base delay in seconds; the n-th retry waits `backoff_factor * 2^(n-1)`
    pub backoff_factor: f64,
    /// Upper bound for any single delay, in seconds
    pub backoff_max: f64,
    /// Draw each delay uniformly from `[0, delay]`
    pub jitter: bool,
    /// Response statuses that trigger a retry
    pub status_forcelist: BTreeSet<u16>,
    /// Methods that may be retried; others are sent exactly once
    pub allowed_methods: BTreeSet<String>,
    /// Let a server `Retry-After` value replace the computed delay
    pub respect_retry_after_header: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            total: 3,
            backoff_factor: 0.3,
            backoff_max: 120.0,
            jitter: false,
            status_forcelist: DEFAULT_STATUS_FORCELIST.into_iter().collect(),
            allowed_methods: DEFAULT_ALLOWED_METHODS
                .into_iter()
                .map(str::to_string)
                .collect(),
            respect_retry_after_header: true,
        }
    }
}

impl RetryConfig {
    /// Create a retry configuration allowing `total` retries
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// A configuration that sends every request exactly once
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn with_backoff_factor(mut self, seconds: f64) -> Self {
        self.backoff_factor = seconds;
        self
    }

    pub fn with_backoff_max(mut self, seconds: f64) -> Self {
        self.backoff_max = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_status_forcelist(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.status_forcelist = statuses.into_iter().collect();
        self
    }

    pub fn with_allowed_methods<S: AsRef<str>>(mut self, methods: impl IntoIterator<Item = S>) -> Self {
        self.allowed_methods = methods
            .into_iter()
            .map(|m| m.as_ref().to_ascii_uppercase())
            .collect();
        self
    }

    pub fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after_header = respect;
        self
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.status_forcelist.contains(&status.as_u16())
    }

    pub fn is_retryable_method(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method.as_str())
    }

    pub fn backoff_cap(&self) -> Duration {
        saturating_secs(self.backoff_max)
    }

    /// Delay before the given retry (1-based), without jitter
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = (self.backoff_factor * 2f64.powi(exponent)).min(self.backoff_max);
        saturating_secs(secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(Error::configuration(
                "retry backoff_factor must be a non-negative number",
            ));
        }
        if !self.backoff_max.is_finite() || self.backoff_max < 0.0 {
            return Err(Error::configuration(
                "retry backoff_max must be a non-negative number",
            ));
        }
        if let Some(status) = self
            .status_forcelist
            .iter()
            .find(|s| StatusCode::from_u16(**s).is_err())
        {
            return Err(Error::configuration(format!(
                "status_forcelist contains invalid status {}",
                status
            )));
        }
        Ok(())
    }
}

/// Seconds as a duration, saturating at `Duration::MAX`
fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Classification of a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// A response the caller should receive
    Success,
    /// The server returned a status from the retry set
    RetryableStatus {
        status: StatusCode,
        retry_after: Option<Duration>,
    },
    /// Connection reset, refused or timed out
    RetryableNetwork(TransportError),
    /// The protocol could not be negotiated; handled by falling back
    Negotiation(TransportError),
    /// Anything retrying cannot fix
    Fatal(TransportError),
}

impl AttemptOutcome {
    pub fn classify(config: &RetryConfig, result: &std::result::Result<Response, TransportError>) -> Self {
        match result {
            Ok(response) if config.is_retryable_status(response.status()) => {
                AttemptOutcome::RetryableStatus {
                    status: response.status(),
                    retry_after: retry_after_hint(response, Utc::now()),
                }
            }
            Ok(_) => AttemptOutcome::Success,
            Err(error) if error.is_negotiation_failure() => AttemptOutcome::Negotiation(error.clone()),
            Err(error @ (TransportError::Connect(_) | TransportError::Timeout(_))) => {
                AttemptOutcome::RetryableNetwork(error.clone())
            }
            Err(error) => AttemptOutcome::Fatal(error.clone()),
        }
    }

    /// Reclassify for a version the target has already negotiated
    ///
    /// Protocol errors on an established binding are ordinary network
    /// failures and never move the fallback cursor.
    pub fn on_established(self) -> Self {
        match self {
            AttemptOutcome::Negotiation(error) => AttemptOutcome::RetryableNetwork(error),
            other => other,
        }
    }

    pub fn failure(&self) -> Option<Failure> {
        match self {
            AttemptOutcome::Success => None,
            AttemptOutcome::RetryableStatus { status, .. } => Some(Failure::Status(*status)),
            AttemptOutcome::RetryableNetwork(error) | AttemptOutcome::Fatal(error) => {
                Some(Failure::Network(error.to_string()))
            }
            AttemptOutcome::Negotiation(error) => Some(Failure::Negotiation(error.to_string())),
        }
    }
}

/// Why no further attempt is made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Succeeded,
    Fatal,
    /// The outcome was retryable but the method is not in the allowlist
    MethodNotAllowed,
    Exhausted,
    /// Waiting would overrun the request timeout
    DeadlineExceeded,
}

/// Decision on whether to retry a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the request after the specified delay
    Retry { delay: Duration },
    /// Retry immediately on the next protocol candidate; consumes no budget
    Fallback,
    /// Do not retry the request
    NoRetry(StopReason),
}

/// Per-request retry state, discarded when the request resolves
#[derive(Debug, Clone)]
pub struct RetryContext {
    attempts: u32,
    in_flight: bool,
    retries: u32,
    fallbacks: u32,
    started: Instant,
    budget: Option<Duration>,
    last_failure: Option<Failure>,
}

impl RetryContext {
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            attempts: 0,
            in_flight: false,
            retries: 0,
            fallbacks: 0,
            started: Instant::now(),
            budget,
            last_failure: None,
        }
    }

    /// Mark an execution as started; it is counted once its outcome is known
    pub fn begin_attempt(&mut self) {
        self.in_flight = true;
    }

    /// Attempts counted against the retry budget
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Completed attempts plus one still running, if any
    pub fn attempts_made(&self) -> u32 {
        self.attempts + u32::from(self.in_flight)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Protocol fallbacks taken, which are not counted as attempts
    pub fn fallbacks(&self) -> u32 {
        self.fallbacks
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.budget.map(|budget| budget.saturating_sub(self.elapsed()))
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }
}

/// Retry policy evaluating attempt outcomes against a configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Record `outcome` in `context` and decide what happens next
    pub fn should_retry(
        &self,
        context: &mut RetryContext,
        method: &Method,
        outcome: &AttemptOutcome,
    ) -> RetryDecision {
        context.in_flight = false;
        if let AttemptOutcome::Negotiation(_) = outcome {
            context.fallbacks += 1;
            context.last_failure = outcome.failure();
            return RetryDecision::Fallback;
        }

        context.attempts += 1;
        if let Some(failure) = outcome.failure() {
            context.last_failure = Some(failure);
        }

        let hint = match outcome {
            AttemptOutcome::Success => return RetryDecision::NoRetry(StopReason::Succeeded),
            AttemptOutcome::Fatal(_) => return RetryDecision::NoRetry(StopReason::Fatal),
            AttemptOutcome::RetryableStatus { retry_after, .. } => *retry_after,
            AttemptOutcome::RetryableNetwork(_) | AttemptOutcome::Negotiation(_) => None,
        };

        if !self.config.is_retryable_method(method) {
            return RetryDecision::NoRetry(StopReason::MethodNotAllowed);
        }
        if context.retries >= self.config.total {
            return RetryDecision::NoRetry(StopReason::Exhausted);
        }

        let delay = self.calculate_delay(context.retries + 1, hint);
        if let Some(remaining) = context.remaining() {
            if delay > remaining {
                return RetryDecision::NoRetry(StopReason::DeadlineExceeded);
            }
        }

        context.retries += 1;
        RetryDecision::Retry { delay }
    }

    /// Calculate the delay before the given retry
    fn calculate_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if self.config.respect_retry_after_header {
            if let Some(hint) = retry_after {
                return hint.min(self.config.backoff_cap());
            }
        }

        let delay = self.config.backoff_delay(retry);
        if self.config.jitter && !delay.is_zero() {
            rand::thread_rng().gen_range(Duration::ZERO..=delay)
        } else {
            delay
        }
    }
}

/// Server-provided wait hint, in delta-seconds or HTTP-date form
pub fn retry_after_hint(response: &Response, now: DateTime<Utc>) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, now)
}

pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
