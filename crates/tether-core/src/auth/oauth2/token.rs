//! OAuth2 token values

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use serde::{Deserialize, Deserializer, Serialize};

use crate::logging::redact;

/// Longest lifetime taken from a server, about a century
const MAX_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// An OAuth2 access token and the material needed to refresh it
///
/// A token with an empty access value is treated as no token at all.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_scope", skip_serializing_if = "BTreeSet::is_empty")]
    scope: BTreeSet<String>,
}

impl Token {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expires_at: None,
            scope: BTreeSet::new(),
        }
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expiry relative to now
    pub fn with_expires_in(self, expires_in: Duration) -> Self {
        let expires_in = chrono::Duration::from_std(expires_in.min(MAX_LIFETIME))
            .unwrap_or_else(|_| chrono::Duration::seconds(MAX_LIFETIME.as_secs() as i64));
        let at = Utc::now()
            .checked_add_signed(expires_in)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.with_expires_at(at)
    }

    pub fn with_scope<S: Into<String>>(mut self, scope: impl IntoIterator<Item = S>) -> Self {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// `Authorization` header value for this token
    pub fn authorization_header(&self) -> Option<HeaderValue> {
        let scheme = if self.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        let mut value = HeaderValue::from_str(&format!("{} {}", scheme, self.access_token)).ok()?;
        value.set_sensitive(true);
        Some(value)
    }

    /// A refreshed token keeps the old refresh value when the server omits one
    pub(crate) fn inherit_refresh_token(mut self, previous: &Token) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        self
    }

    /// Parse a token endpoint response body
    pub fn from_response(body: &[u8], now: DateTime<Utc>) -> serde_json::Result<Self> {
        let raw: TokenResponse = serde_json::from_slice(body)?;
        let expires_at = raw.expires_in.and_then(|secs| {
            let secs = secs.clamp(0.0, MAX_LIFETIME.as_secs_f64()) as i64;
            now.checked_add_signed(chrono::Duration::seconds(secs))
        });
        Ok(Self {
            access_token: raw.access_token,
            token_type: raw.token_type.unwrap_or_else(default_token_type),
            refresh_token: raw.refresh_token.filter(|r| !r.is_empty()),
            expires_at,
            scope: raw.scope.map(Scope::into_set).unwrap_or_default(),
        })
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &redact(&self.access_token))
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<f64>,
    scope: Option<Scope>,
}

/// Scope as sent by servers: space-delimited string or list
#[derive(Deserialize)]
#[serde(untagged)]
enum Scope {
    Delimited(String),
    List(Vec<String>),
}

impl Scope {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            Scope::Delimited(s) => s.split_whitespace().map(str::to_string).collect(),
            Scope::List(items) => items.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }
}

fn deserialize_scope<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<String>, D::Error> {
    Ok(Option::<Scope>::deserialize(deserializer)?
        .map(Scope::into_set)
        .unwrap_or_default())
}
