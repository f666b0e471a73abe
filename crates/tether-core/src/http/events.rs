//! Classification events emitted by the session loop
//!
//! Every boundary the attempt loop crosses is logged and, when a subscriber is
//! attached, delivered as a [`SessionEvent`] value.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::Failure;
use crate::http::protocol::ProtocolVersion;
use crate::http::target::Target;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A response was delivered to the caller
    Success {
        target: Target,
        version: ProtocolVersion,
        status: u16,
        attempts: u32,
    },
    /// A retryable failure; the next attempt runs after `delay`
    Retry {
        target: Target,
        version: ProtocolVersion,
        attempt: u32,
        delay: Duration,
        failure: Failure,
    },
    /// Negotiation failed and the next protocol candidate is tried
    Fallback {
        target: Target,
        from: ProtocolVersion,
        to: ProtocolVersion,
        reason: String,
    },
    /// The request gave up without a usable response
    Exhausted {
        target: Target,
        attempts: u32,
        failure: Failure,
    },
    /// The wall-clock ceiling was reached
    TimedOut {
        target: Target,
        attempts: u32,
        elapsed: Duration,
    },
    /// The OAuth2 token was replaced by a refresh
    TokenRefreshed { expires_at: Option<DateTime<Utc>> },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Success { target, version, status, attempts } => write!(
                f,
                "{} answered {} over {} after {} attempt(s)",
                target, status, version, attempts
            ),
            SessionEvent::Retry { target, attempt, delay, failure, .. } => write!(
                f,
                "attempt {} to {} failed ({}), retrying in {:?}",
                attempt, target, failure, delay
            ),
            SessionEvent::Fallback { target, from, to, reason } => {
                write!(f, "{} could not negotiate {} ({}), falling back to {}", target, from, reason, to)
            }
            SessionEvent::Exhausted { target, attempts, failure } => {
                write!(f, "giving up on {} after {} attempt(s): {}", target, attempts, failure)
            }
            SessionEvent::TimedOut { target, attempts, elapsed } => write!(
                f,
                "request to {} timed out after {:?} ({} attempt(s))",
                target, elapsed, attempts
            ),
            SessionEvent::TokenRefreshed { expires_at } => match expires_at {
                Some(at) => write!(f, "access token refreshed, expires at {}", at.to_rfc3339()),
                None => write!(f, "access token refreshed"),
            },
        }
    }
}

/// Logs events and forwards them to an optional subscriber
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    subscriber: Option<UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn new(subscriber: Option<UnboundedSender<SessionEvent>>) -> Self {
        Self { subscriber }
    }

    pub fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Success { .. } => debug!(event = "success", "{}", event),
            SessionEvent::Retry { .. } => warn!(event = "retry", "{}", event),
            SessionEvent::Fallback { .. } => info!(event = "fallback", "{}", event),
            SessionEvent::Exhausted { .. } => warn!(event = "exhausted", "{}", event),
            SessionEvent::TimedOut { .. } => warn!(event = "timed_out", "{}", event),
            SessionEvent::TokenRefreshed { .. } => info!(event = "token_refreshed", "{}", event),
        }

        if let Some(subscriber) = &self.subscriber {
            // a dropped receiver only means nobody is listening any more
            let _ = subscriber.send(event);
        }
    }
}
