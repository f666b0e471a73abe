//! Single-protocol transport interface
//!
//! A [`Transport`] performs HTTP exchanges over exactly one protocol version.
//! Transports are created by a [`TransportFactory`] with the session's pool and
//! timeout settings and are owned by the session's binding table.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::http::protocol::ProtocolVersion;
use crate::http::request::{Request, Response};
use crate::http::target::Target;

/// Failures reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established or was reset
    #[error("connection failed: {0}")]
    Connect(String),

    /// The peer does not speak the requested protocol (ALPN/handshake mismatch)
    #[error("protocol negotiation failed: {0}")]
    Protocol(String),

    /// The exchange did not complete within the transport's timeout
    #[error("timed out: {0}")]
    Timeout(String),

    /// The transport cannot serve this protocol version at all
    #[error("unsupported protocol {0}")]
    Unsupported(ProtocolVersion),

    /// The request itself is malformed or cannot be sent
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_negotiation_failure(&self) -> bool {
        matches!(self, TransportError::Protocol(_) | TransportError::Unsupported(_))
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to an opened connection pool for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: u64,
    target: Target,
    version: ProtocolVersion,
}

impl ConnectionHandle {
    pub fn new(target: Target, version: ProtocolVersion) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            target,
            version,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }
}

/// Performs HTTP exchanges over one protocol version
#[async_trait]
pub trait Transport: Send + Sync {
    /// The protocol version this transport speaks
    fn version(&self) -> ProtocolVersion;

    /// Prepare a connection pool for `target`
    async fn open(&self, target: &Target) -> Result<ConnectionHandle, TransportError>;

    /// Execute a single exchange
    async fn send(
        &self,
        handle: &ConnectionHandle,
        request: &Request,
    ) -> Result<Response, TransportError>;

    /// Release everything held for the handle
    async fn close(&self, handle: ConnectionHandle);
}

/// Connection pool sizing applied to every transport a session creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of per-target pools the session keeps alive
    pub max_pools: usize,
    /// Connections kept per pool
    pub max_connections: usize,
}

/// Construction-time settings handed to a transport factory
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub pool: PoolSettings,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

/// Builds transports for one protocol version
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        version: ProtocolVersion,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn Transport>, TransportError>;

    fn name(&self) -> &str;
}

impl fmt::Debug for dyn TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportFactory({})", self.name())
    }
}
