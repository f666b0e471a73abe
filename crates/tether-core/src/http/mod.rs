//! HTTP session layer
//!
//! This module provides the Enhanced Session with:
//! - Protocol negotiation with HTTP/3 -> HTTP/2 -> HTTP/1.1 fallback
//! - Per-target transport bindings reused across requests
//! - Retry logic with exponential backoff and `Retry-After` support
//! - A wall-clock budget covering every attempt and backoff sleep
//! - Classification events exposed as values

pub mod events;
pub mod fallback;
pub mod protocol;
pub mod request;
pub mod reqwest_transport;
pub mod retry;
pub mod routing;
pub mod session;
pub mod target;
pub mod timeout;
pub mod transport;

pub use events::{EventSink, SessionEvent};
pub use fallback::{Binding, TransportSelector};
pub use protocol::{Capabilities, ProtocolVersion};
pub use request::{Request, RequestOptions, Response};
pub use reqwest_transport::ReqwestTransportFactory;
pub use retry::{AttemptOutcome, RetryConfig, RetryContext, RetryDecision, RetryPolicy, StopReason};
pub use routing::{RoutingTable, RoutingTableBuilder};
pub use session::{EnhancedSession, SessionBuilder};
pub use target::Target;
pub use timeout::TimeoutConfig;
pub use transport::{
    ConnectionHandle, PoolSettings, Transport, TransportError, TransportFactory, TransportSettings,
};

// Re-export commonly used types
pub use reqwest::{Method, StatusCode};
