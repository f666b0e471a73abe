//! Token endpoint exchanges
//!
//! [`TokenExchanger`] is the seam between the credential manager and the
//! authorization server. [`HttpTokenExchanger`] talks to a standard RFC 6749
//! token endpoint through a session that never retries.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use thiserror::Error;

use crate::auth::basic_auth;
use crate::auth::oauth2::token::Token;
use crate::error::Result;
use crate::http::request::{Request, RequestOptions};
use crate::http::retry::RetryConfig;
use crate::http::session::EnhancedSession;

/// Client identity presented to the token endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct ClientAuth {
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl ClientAuth {
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuth")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Grant-specific parameters of a token request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode {
        code: String,
        redirect_uri: Option<String>,
    },
    ClientCredentials {
        scope: Vec<String>,
    },
    Password {
        username: String,
        password: String,
        scope: Vec<String>,
    },
}

impl Grant {
    fn form(&self) -> Vec<(&'static str, String)> {
        let scope_param = |scope: &[String]| (!scope.is_empty()).then(|| ("scope", scope.join(" ")));
        match self {
            Grant::AuthorizationCode { code, redirect_uri } => {
                let mut form = vec![("grant_type", "authorization_code".to_string()), ("code", code.clone())];
                if let Some(redirect_uri) = redirect_uri {
                    form.push(("redirect_uri", redirect_uri.clone()));
                }
                form
            }
            Grant::ClientCredentials { scope: s } => {
                let mut form = vec![("grant_type", "client_credentials".to_string())];
                form.extend(scope_param(s.as_slice()));
                form
            }
            Grant::Password { username, password, scope: s } => {
                let mut form = vec![
                    ("grant_type", "password".to_string()),
                    ("username", username.clone()),
                    ("password", password.clone()),
                ];
                form.extend(scope_param(s.as_slice()));
                form
            }
        }
    }
}

/// Failure of a token endpoint call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The refresh value itself is invalid, expired or revoked
    #[error("refresh token rejected: {0}")]
    Revoked(String),

    /// The exchange failed for any other reason
    #[error("{message}")]
    Failed { message: String, status: Option<u16> },
}

impl ExchangeError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExchangeError::Failed {
            message: message.into(),
            status: None,
        }
    }
}

/// Performs token fetches and refreshes against an authorization server
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn fetch(
        &self,
        token_url: &str,
        grant: &Grant,
        client: &ClientAuth,
    ) -> std::result::Result<Token, ExchangeError>;

    async fn refresh(
        &self,
        token_url: &str,
        refresh_token: &str,
        client: &ClientAuth,
    ) -> std::result::Result<Token, ExchangeError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    error_description: Option<String>,
}

/// Token exchanger speaking form-encoded RFC 6749 requests
#[derive(Debug, Clone)]
pub struct HttpTokenExchanger {
    session: EnhancedSession,
}

impl HttpTokenExchanger {
    /// Exchanger with its own session; token requests are never retried
    pub fn new() -> Result<Self> {
        let session = EnhancedSession::builder()
            .retry(RetryConfig::disabled())
            .build()?;
        Ok(Self { session })
    }

    /// Use `session` for token requests; retries are disabled per call
    pub fn with_session(session: EnhancedSession) -> Self {
        Self {
            session: session.without_static_auth(),
        }
    }

    async fn post(
        &self,
        token_url: &str,
        mut form: Vec<(&'static str, String)>,
        client: &ClientAuth,
        refreshing: bool,
    ) -> std::result::Result<Token, ExchangeError> {
        let mut request = Request::post(token_url).map_err(|e| ExchangeError::failed(e.to_string()))?;
        match &client.client_secret {
            Some(secret) => {
                let value = basic_auth(&client.client_id, secret)
                    .map_err(|e| ExchangeError::failed(e.to_string()))?;
                request.header_map_mut().insert(AUTHORIZATION, value);
            }
            None => form.push(("client_id", client.client_id.clone())),
        }
        let request = request
            .form(&form)
            .header(ACCEPT.as_str(), "application/json")
            .map_err(|e| ExchangeError::failed(e.to_string()))?;

        let options = RequestOptions::default().with_retry(RetryConfig::disabled());
        let response = self
            .session
            .execute(request, options)
            .await
            .map_err(|e| ExchangeError::failed(format!("token request to {} failed: {}", token_url, e)))?;

        if response.is_success() {
            return Token::from_response(response.body(), Utc::now()).map_err(|e| ExchangeError::Failed {
                message: format!("invalid token response: {}", e),
                status: Some(response.status().as_u16()),
            });
        }

        let status = response.status().as_u16();
        match serde_json::from_slice::<ErrorBody>(response.body()) {
            Ok(body) if refreshing && body.error == "invalid_grant" => Err(ExchangeError::Revoked(
                body.error_description.unwrap_or(body.error),
            )),
            Ok(body) => Err(ExchangeError::Failed {
                message: match body.error_description {
                    Some(description) => format!("{}: {}", body.error, description),
                    None => body.error,
                },
                status: Some(status),
            }),
            Err(_) => Err(ExchangeError::Failed {
                message: format!("token endpoint returned status {}", status),
                status: Some(status),
            }),
        }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn fetch(
        &self,
        token_url: &str,
        grant: &Grant,
        client: &ClientAuth,
    ) -> std::result::Result<Token, ExchangeError> {
        self.post(token_url, grant.form(), client, false).await
    }

    async fn refresh(
        &self,
        token_url: &str,
        refresh_token: &str,
        client: &ClientAuth,
    ) -> std::result::Result<Token, ExchangeError> {
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        self.post(token_url, form, client, true).await
    }
}
