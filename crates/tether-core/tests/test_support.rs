//! Shared test support utilities for integration tests

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use tether_core::auth::oauth2::{ClientAuth, ExchangeError, Grant, Token, TokenExchanger};
use tether_core::http::{
    Capabilities, ConnectionHandle, EnhancedSession, ProtocolVersion, Request, Response, RoutingTable,
    SessionBuilder, StatusCode, Target, Transport, TransportError, TransportFactory, TransportSettings,
};

/// One scripted answer of the mock transport
#[derive(Debug, Clone)]
pub enum Step {
    Status(u16),
    StatusWithRetryAfter(u16, &'static str),
    Fail(TransportError),
}

/// Shared state of every transport a [`MockFactory`] creates
#[derive(Default)]
pub struct MockState {
    pub creates: AtomicUsize,
    pub opens: AtomicUsize,
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,
    /// (host, version) pairs whose handshake fails
    refused: Mutex<HashSet<(String, ProtocolVersion)>>,
    script: Mutex<VecDeque<Step>>,
    /// Every exchange as (host, version, authorization header)
    log: Mutex<Vec<(String, ProtocolVersion, Option<String>)>>,
    send_delay: Mutex<Option<Duration>>,
}

impl MockState {
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<(String, ProtocolVersion, Option<String>)> {
        self.log.lock().unwrap().clone()
    }

    pub fn authorizations(&self) -> Vec<Option<String>> {
        self.log().into_iter().map(|(_, _, auth)| auth).collect()
    }
}

/// Factory for scripted in-memory transports
#[derive(Clone, Default)]
pub struct MockFactory {
    pub state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers returned in order; once exhausted every exchange answers 200
    pub fn script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.state.script.lock().unwrap().extend(steps);
        self
    }

    pub fn statuses(self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.script(statuses.into_iter().map(Step::Status))
    }

    /// Make the handshake for `version` against `host` fail
    pub fn refuse(self, host: &str, version: ProtocolVersion) -> Self {
        self.state
            .refused
            .lock()
            .unwrap()
            .insert((host.to_string(), version));
        self
    }

    pub fn send_delay(self, delay: Duration) -> Self {
        *self.state.send_delay.lock().unwrap() = Some(delay);
        self
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        version: ProtocolVersion,
        _settings: &TransportSettings,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.state.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport {
            version,
            state: Arc::clone(&self.state),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockTransport {
    version: ProtocolVersion,
    state: Arc<MockState>,
}

#[async_trait]
impl Transport for MockTransport {
    fn version(&self) -> ProtocolVersion {
        self.version
    }

    async fn open(&self, target: &Target) -> Result<ConnectionHandle, TransportError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .state
            .refused
            .lock()
            .unwrap()
            .contains(&(target.host().to_string(), self.version));
        if refused {
            return Err(TransportError::Protocol(format!("{} refused {}", target, self.version)));
        }
        Ok(ConnectionHandle::new(target.clone(), self.version))
    }

    async fn send(&self, handle: &ConnectionHandle, request: &Request) -> Result<Response, TransportError> {
        self.state.sends.fetch_add(1, Ordering::SeqCst);
        let authorization = request
            .header_map()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.state.log.lock().unwrap().push((
            handle.target().host().to_string(),
            self.version,
            authorization,
        ));

        let delay = *self.state.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let step = self.state.script.lock().unwrap().pop_front();
        let mut headers = HeaderMap::new();
        let status = match step.unwrap_or(Step::Status(200)) {
            Step::Status(status) => status,
            Step::StatusWithRetryAfter(status, retry_after) => {
                headers.insert("retry-after", HeaderValue::from_static(retry_after));
                status
            }
            Step::Fail(error) => return Err(error),
        };
        Ok(Response::new(
            StatusCode::from_u16(status).unwrap(),
            headers,
            format!("status {}", status),
            self.version,
            request.url().clone(),
        ))
    }

    async fn close(&self, _handle: ConnectionHandle) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session builder routing every `https://` URL to `factory`, with all protocols available
pub fn mock_session_builder(factory: &MockFactory) -> SessionBuilder {
    EnhancedSession::builder()
        .routing(RoutingTable::builder().mount("https://", Arc::new(factory.clone())))
        .capabilities(Capabilities::all())
}

/// Token exchanger counting refresh calls
pub struct MockExchanger {
    pub refreshes: AtomicUsize,
    pub fetches: AtomicUsize,
    delay: Duration,
    outcome: Mutex<Result<Token, ExchangeError>>,
}

impl MockExchanger {
    pub fn issuing(access_token: &str) -> Self {
        Self {
            refreshes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
            outcome: Mutex::new(Ok(Token::new(access_token).with_expires_in(Duration::from_secs(3600)))),
        }
    }

    pub fn failing(error: ExchangeError) -> Self {
        Self {
            outcome: Mutex::new(Err(error)),
            ..Self::issuing("unused")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchanger for MockExchanger {
    async fn fetch(&self, _token_url: &str, _grant: &Grant, _client: &ClientAuth) -> Result<Token, ExchangeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.outcome.lock().unwrap().clone()
    }

    async fn refresh(
        &self,
        _token_url: &str,
        _refresh_token: &str,
        _client: &ClientAuth,
    ) -> Result<Token, ExchangeError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.outcome.lock().unwrap().clone()
    }
}
