//! OAuth2 token state and single-flight refresh
//!
//! The manager holds the one authoritative [`Token`]. Every replacement bumps a
//! generation counter, which lets a caller tell whether the token it saw
//! rejected is still current. At most one refresh runs at a time: concurrent
//! callers share the in-flight refresh and observe the same result. The refresh
//! runs on its own task, so a caller giving up on its timeout does not cancel a
//! refresh other callers are waiting for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::auth::oauth2::exchange::{ClientAuth, ExchangeError, Grant, TokenExchanger};
use crate::auth::oauth2::token::Token;
use crate::error::{Error, Result};
use crate::http::events::{EventSink, SessionEvent};

/// Observable credential state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    HasToken,
    Expired,
    Refreshing,
}

/// Receives every token that replaces the authoritative one
///
/// Called while the refresh is still exclusive, so calls never overlap.
/// Errors are logged and otherwise ignored.
pub trait TokenSink: Send + Sync {
    fn notify(&self, token: &Token) -> anyhow::Result<()>;
}

impl<F> TokenSink for F
where
    F: Fn(&Token) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, token: &Token) -> anyhow::Result<()> {
        self(token)
    }
}

/// Sink delivering tokens to a single channel subscriber
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: UnboundedSender<Token>,
}

impl TokenSink for ChannelSink {
    fn notify(&self, token: &Token) -> anyhow::Result<()> {
        self.sender
            .send(token.clone())
            .map_err(|_| anyhow::anyhow!("token update receiver was dropped"))
    }
}

/// A sink and the receiver its token updates arrive on
pub fn token_update_channel() -> (ChannelSink, UnboundedReceiver<Token>) {
    let (sender, receiver) = unbounded_channel();
    (ChannelSink { sender }, receiver)
}

/// Why a refresh produced no token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// Nothing to refresh with: no token, refresh value or token URL
    Unavailable(String),
    /// The refresh value was rejected; the token has been cleared
    Revoked(String),
    /// The refresh call itself failed; the token is unchanged
    Exchange(ExchangeError),
}

impl From<RefreshError> for Error {
    fn from(error: RefreshError) -> Self {
        match error {
            RefreshError::Unavailable(message) => Error::Authentication { message },
            RefreshError::Revoked(reason) => Error::Authentication {
                message: format!("refresh token was rejected ({}) and the token has been cleared", reason),
            },
            RefreshError::Exchange(source) => Error::AuthExchange {
                message: format!("token refresh failed: {}", source),
                source: Some(anyhow::Error::new(source)),
            },
        }
    }
}

/// A token together with the generation it was stored under
pub type Versioned = (u64, Arc<Token>);

type RefreshResult = std::result::Result<Versioned, RefreshError>;
type RefreshFuture = Shared<BoxFuture<'static, RefreshResult>>;

struct Slot {
    generation: u64,
    token: Option<Arc<Token>>,
}

/// Owner of the authoritative OAuth2 token
pub struct TokenManager {
    slot: RwLock<Slot>,
    /// The refresh lock: present while a refresh is in flight
    in_flight: Mutex<Option<RefreshFuture>>,
    /// Serializes replacement and sink notification
    update_lock: Mutex<()>,
    exchanger: Arc<dyn TokenExchanger>,
    client: ClientAuth,
    token_url: Option<String>,
    sink: Option<Arc<dyn TokenSink>>,
    events: EventSink,
    refreshes: AtomicU64,
}

impl TokenManager {
    pub fn new(exchanger: Arc<dyn TokenExchanger>, client: ClientAuth, token_url: Option<String>) -> Self {
        Self {
            slot: RwLock::new(Slot {
                generation: 0,
                token: None,
            }),
            in_flight: Mutex::new(None),
            update_lock: Mutex::new(()),
            exchanger,
            client,
            token_url,
            sink: None,
            events: EventSink::default(),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Initial token; the sink is not notified
    pub fn with_token(self, token: Option<Token>) -> Self {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.token = token.filter(|t| !t.is_empty()).map(Arc::new);
        }
        self
    }

    pub fn token_url(&self) -> Option<&str> {
        self.token_url.as_deref()
    }

    pub fn client(&self) -> &ClientAuth {
        &self.client
    }

    /// Number of refresh calls made to the exchanger
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Current generation and token, read together
    pub fn snapshot(&self) -> (u64, Option<Arc<Token>>) {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        (slot.generation, slot.token.clone())
    }

    pub fn token(&self) -> Option<Token> {
        self.snapshot().1.map(|t| (*t).clone())
    }

    /// Replace the token; an empty token clears it
    pub fn set_token(&self, token: Option<Token>) {
        self.store(token.filter(|t| !t.is_empty()));
    }

    pub fn clear_token(&self) {
        self.store(None);
    }

    pub fn state(&self) -> TokenState {
        let refreshing = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if refreshing {
            return TokenState::Refreshing;
        }
        match self.snapshot().1 {
            None => TokenState::NoToken,
            Some(token) if token.is_expired() => TokenState::Expired,
            Some(_) => TokenState::HasToken,
        }
    }

    fn store(&self, token: Option<Token>) -> Option<Versioned> {
        let _update = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let token = token.map(Arc::new);
        let generation = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.generation += 1;
            slot.token = token.clone();
            slot.generation
        };

        let token = token?;
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.notify(&token) {
                warn!(error = %e, "token update sink failed; continuing");
            }
        }
        Some((generation, token))
    }

    /// Obtain a token through `grant`; one-shot, never retried
    pub async fn fetch(&self, token_url: &str, grant: &Grant) -> Result<Arc<Token>> {
        let token = self
            .exchanger
            .fetch(token_url, grant, &self.client)
            .await
            .map_err(|e| Error::AuthExchange {
                message: format!("token fetch from {} failed: {}", token_url, e),
                source: Some(anyhow::Error::new(e)),
            })?;
        if token.is_empty() {
            return Err(Error::AuthExchange {
                message: "token endpoint returned an empty access token".to_string(),
                source: None,
            });
        }
        info!(token_url, "fetched new token");
        let (_, token) = self.store(Some(token)).ok_or_else(|| Error::AuthExchange {
            message: "token could not be stored".to_string(),
            source: None,
        })?;
        Ok(token)
    }

    /// Refresh now, regardless of the current token's expiry
    pub async fn refresh_now(self: &Arc<Self>) -> Result<Arc<Token>> {
        let (generation, _) = self.snapshot();
        self.refresh(generation).await.map(|(_, token)| token)
    }

    /// Refresh the token of generation `observed`
    ///
    /// If that token was already replaced, the current one is returned without
    /// another exchange. If a refresh is in flight, its result is shared.
    pub async fn refresh(self: &Arc<Self>, observed: u64) -> Result<Versioned> {
        let refresh = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.as_ref() {
                Some(refresh) => {
                    debug!("joining in-flight token refresh");
                    refresh.clone()
                }
                None => {
                    let (generation, token) = self.snapshot();
                    if generation != observed {
                        return match token {
                            Some(token) => Ok((generation, token)),
                            None => Err(Error::Authentication {
                                message: "token was cleared".to_string(),
                            }),
                        };
                    }
                    let refresh = self.spawn_refresh(token);
                    *in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await.map_err(Error::from)
    }

    fn spawn_refresh(self: &Arc<Self>, token: Option<Arc<Token>>) -> RefreshFuture {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this.perform_refresh(token).await;
            *this.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
            result
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(RefreshError::Exchange(ExchangeError::failed(format!(
                    "refresh task failed: {}",
                    e
                ))))
            })
        }
        .boxed()
        .shared()
    }

    async fn perform_refresh(&self, current: Option<Arc<Token>>) -> RefreshResult {
        let current = current.ok_or_else(|| RefreshError::Unavailable("no token to refresh".into()))?;
        let refresh_token = current
            .refresh_token()
            .ok_or_else(|| RefreshError::Unavailable("token has no refresh value".into()))?;
        let token_url = self
            .token_url
            .as_deref()
            .ok_or_else(|| RefreshError::Unavailable("no token URL configured for refresh".into()))?;

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        match self.exchanger.refresh(token_url, refresh_token, &self.client).await {
            Ok(token) if token.is_empty() => Err(RefreshError::Exchange(ExchangeError::failed(
                "token endpoint returned an empty access token",
            ))),
            Ok(token) => {
                let token = token.inherit_refresh_token(&current);
                let expires_at = token.expires_at();
                let stored = self
                    .store(Some(token))
                    .ok_or_else(|| RefreshError::Unavailable("token could not be stored".into()))?;
                self.events.emit(SessionEvent::TokenRefreshed { expires_at });
                Ok(stored)
            }
            Err(ExchangeError::Revoked(reason)) => {
                warn!(reason = %reason, "refresh token rejected, clearing token");
                self.store(None);
                Err(RefreshError::Revoked(reason))
            }
            Err(e) => Err(RefreshError::Exchange(e)),
        }
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (generation, token) = self.snapshot();
        f.debug_struct("TokenManager")
            .field("generation", &generation)
            .field("token", &token)
            .field("client", &self.client)
            .field("token_url", &self.token_url)
            .finish()
    }
}
