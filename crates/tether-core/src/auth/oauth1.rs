//! OAuth 1.0a request signing and token exchanges
//!
//! Signing is delegated to an [`OAuth1Signer`]. The exchanges that obtain the
//! request token and the access token are single calls that are never retried:
//! the tokens and verifiers involved are single-use. Every attempt the session
//! makes, including retries and protocol fallbacks, carries its own signature
//! with a fresh nonce and timestamp.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Method;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

use crate::auth::RequestAuthorizer;
use crate::error::{Error, Result};
use crate::http::request::{Request, RequestOptions, Response};
use crate::http::retry::RetryConfig;
use crate::http::session::EnhancedSession;
use crate::logging::redact;

/// RFC 3986 unreserved characters stay as they are
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const NONCE_LENGTH: usize = 32;

/// Signing material of an OAuth1 client
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OAuth1Credential {
    pub client_key: String,
    pub client_secret: String,
    pub resource_owner_key: Option<String>,
    pub resource_owner_secret: Option<String>,
    pub callback_uri: Option<String>,
    pub verifier: Option<String>,
    pub realm: Option<String>,
}

impl OAuth1Credential {
    pub fn new(client_key: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_key: client_key.into(),
            client_secret: client_secret.into(),
            ..Self::default()
        }
    }

    pub fn with_resource_owner(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.resource_owner_key = Some(key.into());
        self.resource_owner_secret = Some(secret.into());
        self
    }

    pub fn with_callback_uri(mut self, callback_uri: impl Into<String>) -> Self {
        self.callback_uri = Some(callback_uri.into());
        self
    }
}

impl std::fmt::Debug for OAuth1Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Credential")
            .field("client_key", &self.client_key)
            .field("client_secret", &redact(&self.client_secret))
            .field("resource_owner_key", &self.resource_owner_key)
            .field(
                "resource_owner_secret",
                &self.resource_owner_secret.as_deref().map(redact),
            )
            .field("callback_uri", &self.callback_uri)
            .field("verifier", &self.verifier.as_deref().map(redact))
            .field("realm", &self.realm)
            .finish()
    }
}

/// Produces a signed copy of a request
pub trait OAuth1Signer: Send + Sync {
    fn sign(&self, request: Request, credential: &OAuth1Credential) -> Result<Request>;
}

/// `PLAINTEXT` signature method (RFC 5849 section 3.4.4)
///
/// Only suitable over TLS. HMAC and RSA signers plug in through [`OAuth1Signer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextSigner;

impl PlaintextSigner {
    fn signature(credential: &OAuth1Credential) -> String {
        format!(
            "{}&{}",
            encode(&credential.client_secret),
            encode(credential.resource_owner_secret.as_deref().unwrap_or(""))
        )
    }
}

impl OAuth1Signer for PlaintextSigner {
    fn sign(&self, mut request: Request, credential: &OAuth1Credential) -> Result<Request> {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();

        let mut params = vec![("oauth_consumer_key", credential.client_key.clone())];
        if let Some(token) = &credential.resource_owner_key {
            params.push(("oauth_token", token.clone()));
        }
        params.push(("oauth_signature_method", "PLAINTEXT".to_string()));
        params.push(("oauth_timestamp", Utc::now().timestamp().to_string()));
        params.push(("oauth_nonce", nonce));
        params.push(("oauth_version", "1.0".to_string()));
        if let Some(callback) = &credential.callback_uri {
            params.push(("oauth_callback", callback.clone()));
        }
        if let Some(verifier) = &credential.verifier {
            params.push(("oauth_verifier", verifier.clone()));
        }
        params.push(("oauth_signature", Self::signature(credential)));

        let mut fields: Vec<String> = credential
            .realm
            .iter()
            .map(|realm| format!("realm=\"{}\"", encode(realm)))
            .collect();
        fields.extend(
            params
                .iter()
                .map(|(key, value)| format!("{}=\"{}\"", key, encode(value))),
        );

        let mut value = HeaderValue::from_str(&format!("OAuth {}", fields.join(", ")))
            .map_err(|e| Error::configuration(format!("invalid OAuth1 header: {}", e)))?;
        value.set_sensitive(true);
        request.header_map_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

/// Signs each attempt with the credential current at send time
struct CredentialSigner {
    signer: Arc<dyn OAuth1Signer>,
    credential: Arc<RwLock<OAuth1Credential>>,
}

impl RequestAuthorizer for CredentialSigner {
    fn authorize(&self, request: &mut Request) -> Result<()> {
        let credential = self
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        *request = self.signer.sign(request.clone(), &credential)?;
        Ok(())
    }
}

/// Session signing every request with an OAuth1 credential
#[derive(Clone)]
pub struct OAuth1Session {
    session: EnhancedSession,
    credential: Arc<RwLock<OAuth1Credential>>,
    signer: Arc<dyn OAuth1Signer>,
}

impl OAuth1Session {
    /// Session using the `PLAINTEXT` signer
    pub fn new(session: EnhancedSession, credential: OAuth1Credential) -> Self {
        Self::with_signer(session, credential, Arc::new(PlaintextSigner))
    }

    pub fn with_signer(
        session: EnhancedSession,
        credential: OAuth1Credential,
        signer: Arc<dyn OAuth1Signer>,
    ) -> Self {
        if session.has_static_auth() {
            warn!("static credential configured on an OAuth1 session is ignored");
        }
        let credential = Arc::new(RwLock::new(credential));
        let authorizer = CredentialSigner {
            signer: Arc::clone(&signer),
            credential: Arc::clone(&credential),
        };
        Self {
            session: session.with_authorizer(Arc::new(authorizer)),
            credential,
            signer,
        }
    }

    /// Snapshot of the current credential
    pub fn credential(&self) -> OAuth1Credential {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_credential(&self, update: impl FnOnce(&mut OAuth1Credential)) {
        let mut credential = self.credential.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut credential);
    }

    /// Execute a request, signing each attempt
    pub async fn execute(&self, request: Request, options: RequestOptions) -> Result<Response> {
        self.session.execute(request, options).await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute(Request::get(url)?, RequestOptions::default()).await
    }

    pub async fn post(&self, url: &str, body: impl Into<bytes::Bytes>) -> Result<Response> {
        self.execute(Request::post(url)?.body(body), RequestOptions::default())
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.execute(Request::new(Method::DELETE, url)?, RequestOptions::default())
            .await
    }

    /// Obtain a temporary request token
    ///
    /// On success the request token becomes the credential's resource owner.
    pub async fn fetch_request_token(
        &self,
        url: &str,
        realm: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        if let Some(realm) = realm {
            self.update_credential(|c| c.realm = Some(realm.to_string()));
        }
        let mut credential = self.credential();
        credential.resource_owner_key = None;
        credential.resource_owner_secret = None;
        credential.verifier = None;

        let token = self.exchange(url, &credential).await?;
        info!(url, "obtained OAuth1 request token");
        self.update_credential(|c| {
            c.resource_owner_key = token.get("oauth_token").cloned();
            c.resource_owner_secret = token.get("oauth_token_secret").cloned();
            c.verifier = None;
        });
        Ok(token)
    }

    /// URL the resource owner visits to authorize the request token
    pub fn authorization_url(&self, base: &str) -> Result<String> {
        let token = self.credential().resource_owner_key.ok_or_else(|| {
            Error::configuration("no request token; fetch one before building the authorization URL")
        })?;
        let mut url = Url::parse(base).map_err(|e| Error::invalid_url(base, e.to_string()))?;
        url.query_pairs_mut().append_pair("oauth_token", &token);
        Ok(url.into())
    }

    /// Record the token and verifier from the callback URL
    pub fn parse_authorization_response(&self, url: &str) -> Result<BTreeMap<String, String>> {
        let parsed = Url::parse(url).map_err(|e| Error::invalid_url(url, e.to_string()))?;
        let params: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();
        let verifier = params.get("oauth_verifier").cloned().ok_or_else(|| Error::AuthExchange {
            message: "authorization response carries no oauth_verifier".to_string(),
            source: None,
        })?;
        self.update_credential(|c| {
            if let Some(token) = params.get("oauth_token") {
                c.resource_owner_key = Some(token.clone());
            }
            c.verifier = Some(verifier);
        });
        Ok(params)
    }

    /// Exchange the authorized request token for an access token
    pub async fn fetch_access_token(
        &self,
        url: &str,
        verifier: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        if let Some(verifier) = verifier {
            self.update_credential(|c| c.verifier = Some(verifier.to_string()));
        }
        let credential = self.credential();
        if credential.verifier.is_none() {
            return Err(Error::configuration("no verifier available for the access token exchange"));
        }

        let token = self.exchange(url, &credential).await?;
        info!(url, "obtained OAuth1 access token");
        self.update_credential(|c| {
            c.resource_owner_key = token.get("oauth_token").cloned();
            c.resource_owner_secret = token.get("oauth_token_secret").cloned();
            c.verifier = None;
        });
        Ok(token)
    }

    async fn exchange(&self, url: &str, credential: &OAuth1Credential) -> Result<BTreeMap<String, String>> {
        // signed with the exchange credential, not the stored one
        let authorizer = CredentialSigner {
            signer: Arc::clone(&self.signer),
            credential: Arc::new(RwLock::new(credential.clone())),
        };
        let options = RequestOptions::default().with_retry(RetryConfig::disabled());
        let response = self
            .session
            .with_authorizer(Arc::new(authorizer))
            .execute(Request::post(url)?, options)
            .await
            .map_err(|e| Error::AuthExchange {
                message: format!("token request to {} failed", url),
                source: Some(anyhow::Error::new(e)),
            })?;

        if !response.is_success() {
            return Err(Error::AuthExchange {
                message: format!(
                    "token request to {} returned {}: {}",
                    url,
                    response.status(),
                    response.text()
                ),
                source: None,
            });
        }

        let params: BTreeMap<String, String> = form_urlencoded::parse(response.body())
            .into_owned()
            .collect();
        debug!(url, fields = params.len(), "parsed OAuth1 token response");
        if !params.contains_key("oauth_token") {
            return Err(Error::AuthExchange {
                message: format!("token response from {} carries no oauth_token", url),
                source: None,
            });
        }
        Ok(params)
    }
}

impl std::fmt::Debug for OAuth1Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Session")
            .field("session", &self.session)
            .field("credential", &self.credential())
            .finish()
    }
}
