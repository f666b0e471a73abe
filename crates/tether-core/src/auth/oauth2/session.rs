//! Authenticated session driven by an OAuth2 token
//!
//! Requests carry the current access token. An expired token is refreshed
//! before the request goes out; a 401 answer triggers one refresh and one
//! replay of the original request. A second 401 is fatal.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::oauth2::exchange::{ClientAuth, Grant, HttpTokenExchanger, TokenExchanger};
use crate::auth::oauth2::manager::{TokenManager, TokenSink, TokenState, Versioned};
use crate::auth::oauth2::token::Token;
use crate::error::{Error, Result};
use crate::http::request::{Request, RequestOptions, Response};
use crate::http::session::EnhancedSession;
use crate::http::timeout::with_timeout;

const STATE_LENGTH: usize = 30;

/// Session attaching OAuth2 bearer tokens and refreshing them on demand
#[derive(Clone)]
pub struct OAuth2Session {
    session: EnhancedSession,
    manager: Arc<TokenManager>,
    redirect_uri: Option<String>,
    scope: Vec<String>,
    pending_state: Arc<Mutex<Option<String>>>,
}

impl OAuth2Session {
    pub fn builder(client_id: impl Into<String>) -> OAuth2SessionBuilder {
        OAuth2SessionBuilder::new(client_id)
    }

    pub fn session(&self) -> &EnhancedSession {
        &self.session
    }

    pub fn manager(&self) -> &Arc<TokenManager> {
        &self.manager
    }

    pub fn token(&self) -> Option<Token> {
        self.manager.token()
    }

    /// Replace the token; `None` or an empty token leaves the session unauthenticated
    pub fn set_token(&self, token: Option<Token>) {
        self.manager.set_token(token);
    }

    pub fn clear_token(&self) {
        self.manager.clear_token();
    }

    pub fn state(&self) -> TokenState {
        self.manager.state()
    }

    pub fn is_authorized(&self) -> bool {
        self.state() == TokenState::HasToken
    }

    /// Build the URL the resource owner is sent to, with a fresh `state` value
    ///
    /// Returns the URL and the state; the state is checked again by
    /// [`fetch_token_from_redirect`](Self::fetch_token_from_redirect).
    pub fn authorization_url(&self, base: &str, extra: &[(&str, &str)]) -> Result<(String, String)> {
        let mut url = Url::parse(base).map_err(|e| Error::invalid_url(base, e.to_string()))?;
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_LENGTH)
            .map(char::from)
            .collect();

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.manager.client().client_id);
            if let Some(redirect_uri) = &self.redirect_uri {
                query.append_pair("redirect_uri", redirect_uri);
            }
            if !self.scope.is_empty() {
                query.append_pair("scope", &self.scope.join(" "));
            }
            query.append_pair("state", &state);
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }

        *self.pending_state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok((url.into(), state))
    }

    /// Obtain a token with `grant` and make it the session's token
    pub async fn fetch_token(&self, grant: Grant) -> Result<Token> {
        let token_url = self.token_url()?.to_string();
        let token = self.manager.fetch(&token_url, &grant).await?;
        Ok((*token).clone())
    }

    /// Exchange the redirect the authorization server sent back for a token
    pub async fn fetch_token_from_redirect(&self, authorization_response: &str) -> Result<Token> {
        let url = Url::parse(authorization_response)
            .map_err(|e| Error::invalid_url(authorization_response, e.to_string()))?;
        let param = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        };

        if let Some(error) = param("error") {
            return Err(Error::AuthExchange {
                message: match param("error_description") {
                    Some(description) => format!("authorization denied: {} ({})", error, description),
                    None => format!("authorization denied: {}", error),
                },
                source: None,
            });
        }

        let expected = self
            .pending_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(expected) = expected {
            if param("state").as_deref() != Some(expected.as_str()) {
                return Err(Error::AuthExchange {
                    message: "state in authorization response does not match the request".to_string(),
                    source: None,
                });
            }
        }

        let code = param("code").ok_or_else(|| Error::AuthExchange {
            message: "authorization response carries no code".to_string(),
            source: None,
        })?;
        self.fetch_token(Grant::AuthorizationCode {
            code,
            redirect_uri: self.redirect_uri.clone(),
        })
        .await
    }

    /// Refresh the token now through the shared single-flight path
    pub async fn refresh_token(&self) -> Result<Token> {
        let token = self.manager.refresh_now().await?;
        Ok((*token).clone())
    }

    fn token_url(&self) -> Result<&str> {
        self.manager
            .token_url()
            .ok_or_else(|| Error::configuration("no token URL configured"))
    }

    /// Execute a request with the current token
    ///
    /// The timeout covers the refresh wait, the request and the replay.
    pub async fn execute(&self, request: Request, options: RequestOptions) -> Result<Response> {
        let started = Instant::now();
        let budget = options
            .timeout
            .or_else(|| self.session.timeout_config().total_timeout());

        let (mut generation, mut token) = self.manager.snapshot();
        if token.as_ref().is_some_and(|t| t.is_expired()) {
            debug!("access token expired, refreshing before sending");
            let (refreshed_generation, refreshed) = self.await_refresh(generation, budget, started).await?;
            generation = refreshed_generation;
            token = Some(refreshed);
        }

        let Some(token) = token else {
            return self.send(request, None, &options, budget, started).await;
        };

        let response = self
            .send(request.clone(), Some(&*token), &options, budget, started)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!(url = %request.url(), "authorization rejected, refreshing token and replaying once");
        let (_, refreshed) = self.await_refresh(generation, budget, started).await?;
        let replay = self
            .send(request, Some(&*refreshed), &options, budget, started)
            .await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %replay.url(), "refreshed token was rejected as well");
            return Err(Error::Authentication {
                message: format!("{} rejected the refreshed token", replay.url()),
            });
        }
        Ok(replay)
    }

    async fn send(
        &self,
        mut request: Request,
        token: Option<&Token>,
        options: &RequestOptions,
        budget: Option<Duration>,
        started: Instant,
    ) -> Result<Response> {
        if let Some(token) = token {
            let value = token.authorization_header().ok_or_else(|| Error::Authentication {
                message: "access token cannot be sent in a header".to_string(),
            })?;
            request.header_map_mut().insert(AUTHORIZATION, value);
        }
        let mut options = options.clone();
        options.timeout = remaining(budget, started);
        self.session.execute(request, options).await
    }

    async fn await_refresh(
        &self,
        generation: u64,
        budget: Option<Duration>,
        started: Instant,
    ) -> Result<Versioned> {
        match with_timeout(self.manager.refresh(generation), remaining(budget, started)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout {
                attempts: 0,
                elapsed: started.elapsed(),
                last_failure: None,
            }),
        }
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

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.request(Method::DELETE, url).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        let request = Request::post(url)?.body(body);
        self.execute(request, RequestOptions::default()).await
    }

    pub async fn put(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        let request = Request::new(Method::PUT, url)?.body(body);
        self.execute(request, RequestOptions::default()).await
    }

    pub async fn patch(&self, url: &str, body: impl Into<Bytes>) -> Result<Response> {
        let request = Request::new(Method::PATCH, url)?.body(body);
        self.execute(request, RequestOptions::default()).await
    }
}

impl std::fmt::Debug for OAuth2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Session")
            .field("manager", &self.manager)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .finish()
    }
}

fn remaining(budget: Option<Duration>, started: Instant) -> Option<Duration> {
    budget.map(|budget| budget.saturating_sub(started.elapsed()))
}

/// Builder for [`OAuth2Session`]
pub struct OAuth2SessionBuilder {
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    scope: Vec<String>,
    token_url: Option<String>,
    token: Option<Token>,
    session: Option<EnhancedSession>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    sink: Option<Arc<dyn TokenSink>>,
}

impl OAuth2SessionBuilder {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: None,
            scope: Vec::new(),
            token_url: None,
            token: None,
            session: None,
            exchanger: None,
            sink: None,
        }
    }

    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    pub fn scope<S: Into<String>>(mut self, scope: impl IntoIterator<Item = S>) -> Self {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    /// Token endpoint used for fetches and automatic refresh
    pub fn token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = Some(token_url.into());
        self
    }

    pub fn token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Send requests through `session`; its static credential is not used
    pub fn session(mut self, session: EnhancedSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = Some(exchanger);
        self
    }

    /// Notify `sink` of every token that replaces the current one
    pub fn on_token_update(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<OAuth2Session> {
        let session = match self.session {
            Some(session) => session,
            None => EnhancedSession::new()?,
        };
        if session.has_static_auth() {
            warn!("static credential configured on an OAuth2 session is ignored");
        }
        let session = session.without_static_auth();

        let exchanger = match self.exchanger {
            Some(exchanger) => exchanger,
            None => Arc::new(HttpTokenExchanger::with_session(session.clone())) as Arc<dyn TokenExchanger>,
        };

        let mut manager = TokenManager::new(
            exchanger,
            ClientAuth::new(self.client_id, self.client_secret),
            self.token_url,
        )
        .with_events(session.events().clone())
        .with_token(self.token);
        if let Some(sink) = self.sink {
            manager = manager.with_sink(sink);
        }

        Ok(OAuth2Session {
            session,
            manager: Arc::new(manager),
            redirect_uri: self.redirect_uri,
            scope: self.scope,
            pending_state: Arc::new(Mutex::new(None)),
        })
    }
}
