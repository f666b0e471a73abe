//! Tether Core - HTTP sessions with protocol fallback, retries and OAuth
//!
//! One session object hides protocol selection, retry policy and credential
//! lifecycle behind a single `execute` call.
//!
//! # Main Components
//!
//! - **Enhanced Session**: protocol fallback, connection reuse and retries ([`http`])
//! - **Credentials**: static auth, OAuth1 signing and OAuth2 refresh ([`auth`])
//! - **Configuration**: TOML/JSON files with `TETHER_*` overrides ([`config`])
//! - **Error Handling**: one error taxonomy using `thiserror` and `anyhow` ([`error`])
//!
//! # Example
//!
//! ```no_run
//! use tether_core::{EnhancedSession, Result};
//!
//! async fn example() -> Result<()> {
//!     let session = EnhancedSession::new()?;
//!     let response = session.get("https://api.example.com/status").await?;
//!     println!("{} over {}", response.status(), response.version());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;

// Re-export main types for convenience
pub use auth::oauth1::{OAuth1Credential, OAuth1Session, OAuth1Signer, PlaintextSigner};
pub use auth::oauth2::{Grant, OAuth2Session, Token, TokenState};
pub use auth::{AuthHandler, RequestAuthorizer, StaticAuth};
pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::{Error, Failure, Result};
pub use http::{
    Capabilities, EnhancedSession, ProtocolVersion, Request, RequestOptions, Response, RetryConfig,
    SessionEvent, Target, TimeoutConfig,
};
pub use logging::{init_logging, LogFormat, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
