//! OAuth2 token lifecycle
//!
//! - [`Token`]: the access token and its refresh material
//! - [`TokenManager`]: the authoritative token and single-flight refresh
//! - [`TokenExchanger`]: calls to the authorization server
//! - [`OAuth2Session`]: requests with automatic refresh and one replay

pub mod exchange;
pub mod manager;
pub mod session;
pub mod token;

pub use exchange::{ClientAuth, ExchangeError, Grant, HttpTokenExchanger, TokenExchanger};
pub use manager::{token_update_channel, ChannelSink, RefreshError, TokenManager, TokenSink, TokenState};
pub use session::{OAuth2Session, OAuth2SessionBuilder};
pub use token::Token;
