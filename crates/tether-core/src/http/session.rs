//! Enhanced Session: protocol selection and retries behind one request call
//!
//! For every request the session asks the [`TransportSelector`] for the
//! current candidate version, executes the exchange, classifies the outcome
//! with the [`RetryPolicy`] and either returns, falls back to the next
//! protocol, sleeps and retries, or gives up. The whole loop runs under the
//! request's wall-clock budget.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Method;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::auth::{AuthHandler, HeaderAuthorizer, RequestAuthorizer};
use crate::config::SessionConfig;
use crate::error::{Error, Failure, Result};
use crate::http::events::{EventSink, SessionEvent};
use crate::http::fallback::TransportSelector;
use crate::http::protocol::{Capabilities, ProtocolVersion};
use crate::http::request::{Request, RequestOptions, Response};
use crate::http::retry::{AttemptOutcome, RetryConfig, RetryContext, RetryDecision, RetryPolicy, StopReason};
use crate::http::routing::{RoutingTable, RoutingTableBuilder};
use crate::http::target::Target;
use crate::http::timeout::{with_timeout, TimeoutConfig};
use crate::http::transport::{TransportError, TransportFactory};

struct SessionInner {
    selector: TransportSelector,
    retry: RetryConfig,
    timeout: TimeoutConfig,
    http_version: ProtocolVersion,
    default_headers: HeaderMap,
    events: EventSink,
}

/// HTTP session with protocol fallback, retries and connection reuse
///
/// Cloning is cheap; clones share bindings and configuration.
#[derive(Clone)]
pub struct EnhancedSession {
    inner: Arc<SessionInner>,
    auth: Option<Arc<dyn RequestAuthorizer>>,
}

impl EnhancedSession {
    /// Session with default configuration and the reqwest transports
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn from_config(config: SessionConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.inner.retry
    }

    pub fn timeout_config(&self) -> &TimeoutConfig {
        &self.inner.timeout
    }

    pub fn http_version(&self) -> ProtocolVersion {
        self.inner.http_version
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.inner.default_headers
    }

    pub fn selector(&self) -> &TransportSelector {
        &self.inner.selector
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.inner.events
    }

    pub fn has_static_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// A handle sharing bindings and configuration but without static auth
    pub(crate) fn without_static_auth(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            auth: None,
        }
    }

    /// A handle sharing bindings and configuration, authorizing every attempt with `auth`
    pub(crate) fn with_authorizer(&self, auth: Arc<dyn RequestAuthorizer>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            auth: Some(auth),
        }
    }

    /// Execute a request
    ///
    /// Returns the response, or exactly one of `RetryExhausted`,
    /// `RequestTimeout` or `Transport`.
    pub async fn execute(&self, mut request: Request, options: RequestOptions) -> Result<Response> {
        request.merge_default_headers(&self.inner.default_headers);

        let target = request.target()?;
        let requested = options.http_version.unwrap_or(self.inner.http_version);
        let policy = RetryPolicy::new(options.retry.unwrap_or_else(|| self.inner.retry.clone()));
        let budget = options.timeout.or_else(|| self.inner.timeout.total_timeout());

        let mut context = RetryContext::new(budget);
        let outcome = with_timeout(
            self.run(&request, &target, requested, &policy, &mut context),
            budget,
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let attempts = context.attempts_made();
                let elapsed = context.elapsed();
                self.inner.events.emit(SessionEvent::TimedOut {
                    target,
                    attempts,
                    elapsed,
                });
                Err(Error::RequestTimeout {
                    attempts,
                    elapsed,
                    last_failure: context.last_failure().cloned(),
                })
            }
        }
    }

    async fn run(
        &self,
        request: &Request,
        target: &Target,
        requested: ProtocolVersion,
        policy: &RetryPolicy,
        context: &mut RetryContext,
    ) -> Result<Response> {
        let selector = &self.inner.selector;
        let mut version = selector.current(target, requested).ok_or_else(|| Error::Transport {
            message: format!("no available protocol for {} (requested {})", target, requested),
            source: None,
        })?;

        loop {
            let signed = self.authorize(request)?;
            let attempt = signed.as_ref().unwrap_or(request);

            context.begin_attempt();
            let result = match selector.acquire(attempt.url(), target, version).await {
                Ok(binding) => {
                    let result = binding.send(attempt).await;
                    if result.is_ok() {
                        selector.mark_negotiated(&binding);
                    }
                    result
                }
                Err(e) => Err(e),
            };

            let mut outcome = AttemptOutcome::classify(policy.config(), &result);
            if selector.is_negotiated(target, version) {
                outcome = outcome.on_established();
            }
            match policy.should_retry(context, request.method(), &outcome) {
                RetryDecision::Fallback => {
                    let reason = describe(&outcome);
                    match selector.advance(target, requested, version).await {
                        Some(next) => {
                            self.inner.events.emit(SessionEvent::Fallback {
                                target: target.clone(),
                                from: version,
                                to: next,
                                reason,
                            });
                            version = next;
                        }
                        None => {
                            return Err(self.give_up_transport(
                                target,
                                context,
                                &outcome,
                                format!("protocol negotiation with {} failed for every candidate", target),
                                result.err(),
                            ));
                        }
                    }
                }
                RetryDecision::Retry { delay } => {
                    let failure = outcome.failure().unwrap_or_else(|| Failure::Network(describe(&outcome)));
                    log::warn!(
                        "Request to {} failed on attempt {}, retrying in {:?}: {}",
                        target,
                        context.attempts(),
                        delay,
                        failure
                    );
                    self.inner.events.emit(SessionEvent::Retry {
                        target: target.clone(),
                        version,
                        attempt: context.attempts(),
                        delay,
                        failure,
                    });
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::NoRetry(reason) => {
                    return self.finish(reason, result, target, version, context, &outcome);
                }
            }
        }
    }

    /// Freshly authorized copy of `request` for one attempt
    fn authorize(&self, request: &Request) -> Result<Option<Request>> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let mut attempt = request.clone();
        auth.authorize(&mut attempt)?;
        Ok(Some(attempt))
    }

    fn finish(
        &self,
        reason: StopReason,
        result: std::result::Result<Response, TransportError>,
        target: &Target,
        version: ProtocolVersion,
        context: &RetryContext,
        outcome: &AttemptOutcome,
    ) -> Result<Response> {
        match (reason, result) {
            (StopReason::Succeeded | StopReason::MethodNotAllowed, Ok(response)) => {
                if reason == StopReason::MethodNotAllowed {
                    debug!(
                        status = response.status().as_u16(),
                        "method not retryable, returning response as-is"
                    );
                }
                self.inner.events.emit(SessionEvent::Success {
                    target: target.clone(),
                    version,
                    status: response.status().as_u16(),
                    attempts: context.attempts(),
                });
                Ok(response)
            }
            (StopReason::Exhausted, _) => {
                let last_failure = context
                    .last_failure()
                    .cloned()
                    .unwrap_or_else(|| Failure::Network(describe(outcome)));
                log::error!(
                    "Request to {} failed after {} attempts: {}",
                    target,
                    context.attempts(),
                    last_failure
                );
                self.inner.events.emit(SessionEvent::Exhausted {
                    target: target.clone(),
                    attempts: context.attempts(),
                    failure: last_failure.clone(),
                });
                Err(Error::RetryExhausted {
                    attempts: context.attempts(),
                    last_failure,
                })
            }
            (StopReason::DeadlineExceeded, _) => {
                self.inner.events.emit(SessionEvent::TimedOut {
                    target: target.clone(),
                    attempts: context.attempts(),
                    elapsed: context.elapsed(),
                });
                Err(Error::RequestTimeout {
                    attempts: context.attempts(),
                    elapsed: context.elapsed(),
                    last_failure: context.last_failure().cloned(),
                })
            }
            (_, result) => Err(self.give_up_transport(
                target,
                context,
                outcome,
                format!("request to {} failed", target),
                result.err(),
            )),
        }
    }

    fn give_up_transport(
        &self,
        target: &Target,
        context: &RetryContext,
        outcome: &AttemptOutcome,
        message: String,
        source: Option<TransportError>,
    ) -> Error {
        let failure = outcome
            .failure()
            .unwrap_or_else(|| Failure::Network(describe(outcome)));
        self.inner.events.emit(SessionEvent::Exhausted {
            target: target.clone(),
            attempts: context.attempts(),
            failure,
        });
        Error::Transport { message, source }
    }

    pub async fn request(&self, method: Method, url: &str) -> Result<Response> {
        self.execute(Request::new(method, url)?, RequestOptions::default())
            .await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url).await
    }

    pub async fn head(&self, url: &str) -> Result<Response> {
        self.request(Method::HEAD, url).await
    }

    pub async fn options(&self, url: &str) -> Result<Response> {
        self.request(Method::OPTIONS, url).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.request(Method::DELETE, url).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        self.send_body(Method::POST, url, body.into()).await
    }

    pub async fn put(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        self.send_body(Method::PUT, url, body.into()).await
    }

    pub async fn patch(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        self.send_body(Method::PATCH, url, body.into()).await
    }

    async fn send_body(&self, method: Method, url: &str, body: Bytes) -> Result<Response> {
        let request = Request::new(method, url)?.body(body);
        self.execute(request, RequestOptions::default()).await
    }

    /// Close every open binding
    pub async fn close(&self) {
        self.inner.selector.close_all().await;
    }
}

impl std::fmt::Debug for EnhancedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnhancedSession")
            .field("selector", &self.inner.selector)
            .field("retry", &self.inner.retry)
            .field("timeout", &self.inner.timeout)
            .field("http_version", &self.inner.http_version)
            .field("static_auth", &self.auth.is_some())
            .finish()
    }
}

fn describe(outcome: &AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Success => "success".to_string(),
        AttemptOutcome::RetryableStatus { status, .. } => format!("status {}", status.as_u16()),
        AttemptOutcome::RetryableNetwork(e)
        | AttemptOutcome::Negotiation(e)
        | AttemptOutcome::Fatal(e) => e.to_string(),
    }
}

/// Builder for [`EnhancedSession`]
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    routing: Option<RoutingTableBuilder>,
    capabilities: Option<Capabilities>,
    events: Option<UnboundedSender<SessionEvent>>,
    auth: Option<Arc<dyn AuthHandler>>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self.config.max_retries = None;
        self
    }

    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn http_version(mut self, version: ProtocolVersion) -> Self {
        self.config.http_version = version;
        self
    }

    /// Mount a transport factory for URLs starting with `prefix`
    ///
    /// Mounts are added on top of the default `http://` and `https://` ones.
    pub fn mount(mut self, prefix: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        let routing = self
            .routing
            .take()
            .unwrap_or_else(RoutingTableBuilder::with_defaults);
        self.routing = Some(routing.mount(prefix, factory));
        self
    }

    /// Replace the routing table entirely
    pub fn routing(mut self, routing: RoutingTableBuilder) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Deliver classification events to `sender`
    pub fn events(mut self, sender: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Use a custom handler instead of the configured static credential
    pub fn auth_handler(mut self, auth: Arc<dyn AuthHandler>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn build(self) -> Result<EnhancedSession> {
        let config = self.config;
        config.validate()?;

        let handler = match (self.auth, config.auth.clone()) {
            (Some(handler), _) => Some(handler),
            (None, Some(static_auth)) => Some(Arc::new(static_auth) as Arc<dyn AuthHandler>),
            (None, None) => None,
        };
        let auth = match handler {
            Some(handler) => {
                handler.validate_credentials()?;
                Some(Arc::new(HeaderAuthorizer(handler)) as Arc<dyn RequestAuthorizer>)
            }
            None => None,
        };

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("tether/", env!("CARGO_PKG_VERSION"))),
        );
        default_headers.extend(config.header_map()?);

        let routing: RoutingTable = match self.routing {
            Some(builder) => builder.build(),
            None => RoutingTable::default(),
        };
        let capabilities = self.capabilities.unwrap_or_default();
        if !capabilities.supports(config.http_version) {
            warn!(
                requested = %config.http_version,
                "requested protocol is not available, falling back along its chain"
            );
        }

        let selector = TransportSelector::new(routing, capabilities, config.transport_settings());

        Ok(EnhancedSession {
            inner: Arc::new(SessionInner {
                selector,
                retry: config.effective_retry(),
                timeout: config.timeout.clone(),
                http_version: config.http_version,
                default_headers,
                events: EventSink::new(self.events),
            }),
            auth,
        })
    }
}
