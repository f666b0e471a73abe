//! Default transports backed by reqwest
//!
//! One `reqwest::Client` is built per binding so that every (target, version)
//! pair owns an isolated connection pool pinned to a single protocol.

use std::error::Error as StdError;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::http::protocol::ProtocolVersion;
use crate::http::request::{Request, Response};
use crate::http::target::Target;
use crate::http::transport::{
    ConnectionHandle, Transport, TransportError, TransportFactory, TransportSettings,
};

/// Creates reqwest transports for HTTP/1.1 and HTTP/2
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransportFactory;

impl ReqwestTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn create(
        &self,
        version: ProtocolVersion,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.pool.max_connections);

        if let Some(read_timeout) = settings.read_timeout {
            builder = builder.read_timeout(read_timeout);
        }

        builder = match version {
            ProtocolVersion::Http11 => builder.http1_only(),
            ProtocolVersion::Http2 => builder.http2_prior_knowledge(),
            ProtocolVersion::Http3 => return Err(TransportError::Unsupported(version)),
        };

        let client = builder
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build client: {}", e)))?;

        Ok(Arc::new(ReqwestTransport { version, client }))
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}

/// Transport pinned to one protocol version
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    version: ProtocolVersion,
    client: reqwest::Client,
}

#[async_trait]
impl Transport for ReqwestTransport {
    fn version(&self) -> ProtocolVersion {
        self.version
    }

    async fn open(&self, target: &Target) -> Result<ConnectionHandle, TransportError> {
        // reqwest connects lazily; the first send performs the handshake
        Ok(ConnectionHandle::new(target.clone(), self.version))
    }

    async fn send(
        &self,
        _handle: &ConnectionHandle,
        request: &Request,
    ) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone())
            .version(self.version.to_http_version())
            .headers(request.header_map().clone());
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(self.version, &e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(self.version, &e))?;

        debug!(
            status = status.as_u16(),
            version = %self.version,
            bytes = body.len(),
            "received response"
        );

        Ok(Response::new(status, headers, body, self.version, url))
    }

    async fn close(&self, handle: ConnectionHandle) {
        debug!(target = %handle.target(), version = %handle.version(), "closing binding");
    }
}

fn protocol_mismatch_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(http2|h2|alpn|preface|frame size|go ?away|protocol error)\b")
            .expect("valid protocol mismatch pattern")
    })
}

/// Render an error together with all of its sources
fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Connection resets and truncated bodies count as network failures
fn classify_message(version: ProtocolVersion, message: String) -> TransportError {
    if version != ProtocolVersion::Http11 && protocol_mismatch_pattern().is_match(&message) {
        TransportError::Protocol(message)
    } else {
        TransportError::Connect(message)
    }
}

fn classify_reqwest_error(version: ProtocolVersion, error: &reqwest::Error) -> TransportError {
    let message = error_chain(error);
    if error.is_timeout() {
        TransportError::Timeout(message)
    } else if error.is_builder() {
        TransportError::Request(message)
    } else {
        classify_message(version, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::PoolSettings;
    use reqwest::StatusCode;
    use std::time::Duration;

    fn settings() -> TransportSettings {
        TransportSettings {
            pool: PoolSettings {
                max_pools: 10,
                max_connections: 10,
            },
            connect_timeout: Duration::from_secs(2),
            read_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn test_http11_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/items?page=1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items": [1, 2]}"#)
            .create_async()
            .await;

        let transport = ReqwestTransportFactory::new()
            .create(ProtocolVersion::Http11, &settings())
            .unwrap();
        let request = Request::get(&format!("{}/items", server.url()))
            .unwrap()
            .query(&[("page", "1")]);
        let handle = transport.open(&request.target().unwrap()).await.unwrap();
        let response = transport.send(&handle, &request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.version(), ProtocolVersion::Http11);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["items"][1], 2);
    }

    #[tokio::test]
    async fn test_server_status_is_not_a_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(503)
            .with_header("retry-after", "2")
            .create_async()
            .await;

        let transport = ReqwestTransportFactory::new()
            .create(ProtocolVersion::Http11, &settings())
            .unwrap();
        let request = Request::post(&server.url()).unwrap().body("payload");
        let handle = transport.open(&request.target().unwrap()).await.unwrap();
        let response = transport.send(&handle, &request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.header_str("retry-after"), Some("2"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = ReqwestTransportFactory::new()
            .create(ProtocolVersion::Http11, &settings())
            .unwrap();
        let request = Request::get(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let handle = transport.open(&request.target().unwrap()).await.unwrap();
        let err = transport.send(&handle, &request).await.unwrap_err();

        assert!(matches!(err, TransportError::Connect(_)), "got {:?}", err);
    }

    #[test]
    fn test_http3_is_unsupported() {
        let result = ReqwestTransportFactory::new().create(ProtocolVersion::Http3, &settings());
        assert!(matches!(
            result,
            Err(TransportError::Unsupported(ProtocolVersion::Http3))
        ));
    }

    #[test]
    fn test_h2_handshake_failures_are_protocol_errors() {
        let err = classify_message(
            ProtocolVersion::Http2,
            "error sending request: http2 error: connection error detected: frame with invalid size".into(),
        );
        assert!(err.is_negotiation_failure());

        // HTTP/1.1 has nothing to fall back to, so the same text stays a network failure
        let err = classify_message(ProtocolVersion::Http11, "http2 error".into());
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
