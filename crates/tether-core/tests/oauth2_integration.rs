//! Integration tests for OAuth2 refresh coordination

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tether_core::auth::oauth2::{token_update_channel, ExchangeError, OAuth2Session, Token, TokenState};
use tether_core::error::Error;
use tether_core::http::{Request, RequestOptions, StatusCode};

mod test_support;
use test_support::{mock_session_builder, MockExchanger, MockFactory};

const TOKEN_URL: &str = "https://auth.example.com/token";

fn expired_token() -> Token {
    Token::new("stale")
        .with_refresh_token("r1")
        .with_expires_at(Utc::now() - chrono::Duration::seconds(30))
}

fn oauth_session(factory: &MockFactory, exchanger: &Arc<MockExchanger>, token: Option<Token>) -> OAuth2Session {
    let mut builder = OAuth2Session::builder("app")
        .client_secret("secret")
        .token_url(TOKEN_URL)
        .session(mock_session_builder(factory).build().unwrap())
        .exchanger(exchanger.clone());
    if let Some(token) = token {
        builder = builder.token(token);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once_before_sending() {
    let factory = MockFactory::new();
    let exchanger = Arc::new(MockExchanger::issuing("fresh"));
    let session = oauth_session(&factory, &exchanger, Some(expired_token()));
    assert_eq!(session.state(), TokenState::Expired);

    let response = session.get("https://api.example.com/me").await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(exchanger.refreshes(), 1);
    assert_eq!(factory.state.authorizations(), vec![Some("Bearer fresh".to_string())]);
    assert_eq!(session.state(), TokenState::HasToken);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_refresh() {
    let factory = MockFactory::new();
    let exchanger = Arc::new(MockExchanger::issuing("fresh").with_delay(Duration::from_millis(100)));
    let session = oauth_session(&factory, &exchanger, Some(expired_token()));

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .get(&format!("https://api.example.com/items/{}", i))
                    .await
                    .unwrap()
                    .status()
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    assert_eq!(exchanger.refreshes(), 1);
    assert!(factory
        .state
        .authorizations()
        .iter()
        .all(|auth| auth.as_deref() == Some("Bearer fresh")));
}

#[tokio::test]
async fn test_unauthorized_is_refreshed_and_replayed_once() {
    let factory = MockFactory::new().statuses([401, 200]);
    let exchanger = Arc::new(MockExchanger::issuing("fresh"));
    let session = oauth_session(&factory, &exchanger, Some(Token::new("revoked-upstream").with_refresh_token("r1")));

    let response = session.get("https://api.example.com/me").await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(exchanger.refreshes(), 1);
    assert_eq!(
        factory.state.authorizations(),
        vec![
            Some("Bearer revoked-upstream".to_string()),
            Some("Bearer fresh".to_string())
        ]
    );
}

#[tokio::test]
async fn test_second_unauthorized_is_fatal() {
    let factory = MockFactory::new().statuses([401, 401, 200]);
    let exchanger = Arc::new(MockExchanger::issuing("fresh"));
    let session = oauth_session(&factory, &exchanger, Some(Token::new("a").with_refresh_token("r1")));

    let err = session.get("https://api.example.com/me").await.unwrap_err();

    assert!(err.requires_reauthentication());
    assert_eq!(exchanger.refreshes(), 1);
    assert_eq!(factory.state.sends(), 2);
}

#[tokio::test]
async fn test_revoked_refresh_value_clears_token() {
    let factory = MockFactory::new();
    let exchanger = Arc::new(MockExchanger::failing(ExchangeError::Revoked("invalid_grant".into())));
    let session = oauth_session(&factory, &exchanger, Some(expired_token()));

    let err = session.get("https://api.example.com/me").await.unwrap_err();

    assert!(matches!(err, Error::Authentication { .. }));
    assert_eq!(session.state(), TokenState::NoToken);
    assert_eq!(session.token(), None);
    // never downgraded to an unauthenticated request
    assert_eq!(factory.state.sends(), 0);
}

#[tokio::test]
async fn test_failed_refresh_surfaces_exchange_error() {
    let factory = MockFactory::new();
    let exchanger = Arc::new(MockExchanger::failing(ExchangeError::failed("server unavailable")));
    let session = oauth_session(&factory, &exchanger, Some(expired_token()));

    let err = session.get("https://api.example.com/me").await.unwrap_err();

    assert!(matches!(err, Error::AuthExchange { .. }));
    assert_eq!(session.token().unwrap().access_token(), "stale");
}

#[tokio::test]
async fn test_set_token_round_trip() {
    let factory = MockFactory::new();
    let exchanger = Arc::new(MockExchanger::issuing("fresh"));
    let session = oauth_session(&factory, &exchanger, None);

    let token = Token::new("abc").with_refresh_token("r").with_scope(["read"]);
    session.set_token(Some(token.clone()));
    assert_eq!(session.token(), Some(token));
    session.get("https://api.example.com/a").await.unwrap();

    session.set_token(None);
    assert_eq!(session.state(), TokenState::NoToken);
    session.get("https://api.example.com/b").await.unwrap();

    assert_eq!(
        factory.state.authorizations(),
        vec![Some("Bearer abc".to_string()), None]
    );
    assert_eq!(exchanger.refreshes(), 0);
}

#[tokio::test]
async fn test_sink_is_notified_of_refreshed_token() {
    let factory = MockFactory::new();
    let exchanger = Arc::new(MockExchanger::issuing("fresh"));
    let (sink, mut updates) = token_update_channel();
    let session = OAuth2Session::builder("app")
        .token_url(TOKEN_URL)
        .session(mock_session_builder(&factory).build().unwrap())
        .exchanger(exchanger.clone())
        .token(expired_token())
        .on_token_update(Arc::new(sink))
        .build()
        .unwrap();

    session.get("https://api.example.com/me").await.unwrap();

    let persisted = updates.recv().await.unwrap();
    assert_eq!(persisted.access_token(), "fresh");
    assert_eq!(persisted.refresh_token(), Some("r1"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_covers_refresh_wait_without_cancelling_it() {
    let factory = MockFactory::new();
    let exchanger = Arc::new(MockExchanger::issuing("fresh").with_delay(Duration::from_secs(10)));
    let session = oauth_session(&factory, &exchanger, Some(expired_token()));

    let err = session
        .execute(
            Request::get("https://api.example.com/me").unwrap(),
            RequestOptions::default().with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestTimeout { .. }));
    assert_eq!(factory.state.sends(), 0);

    // the shared refresh still lands and benefits later callers
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(session.token().unwrap().access_token(), "fresh");

    session.get("https://api.example.com/me").await.unwrap();
    assert_eq!(exchanger.refreshes(), 1);
}
