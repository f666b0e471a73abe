//! Request and response values exchanged between the session and transports

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};
use crate::http::protocol::ProtocolVersion;
use crate::http::retry::RetryConfig;
use crate::http::target::Target;

/// An HTTP request as handed to a transport
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::invalid_url(url, e.to_string()))?;
        if url.host_str().is_none() {
            return Err(Error::invalid_url(url.as_str(), "URL has no host"));
        }
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self> {
        Self::new(Method::POST, url)
    }

    /// Add a header, replacing any previous value with the same name
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            Error::configuration(format!("invalid header name '{}': {}", name, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            Error::configuration(format!("invalid value for header '{}': {}", name, e))
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Append query parameters to the URL
    pub fn query<K: AsRef<str>, V: AsRef<str>>(mut self, params: &[(K, V)]) -> Self {
        if !params.is_empty() {
            let mut pairs = self.url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key.as_ref(), value.as_ref());
            }
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(value)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(encoded));
        Ok(self)
    }

    /// Encode `params` as an `application/x-www-form-urlencoded` body
    pub fn form<K: AsRef<str>, V: AsRef<str>>(mut self, params: &[(K, V)]) -> Self {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in params {
            serializer.append_pair(key.as_ref(), value.as_ref());
        }
        self.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self.body = Some(Bytes::from(serializer.finish()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn header_map(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header_map_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn target(&self) -> Result<Target> {
        Target::from_url(&self.url)
    }

    /// Insert headers that the request does not already carry
    pub(crate) fn merge_default_headers(&mut self, defaults: &HeaderMap) {
        for (name, value) in defaults.iter() {
            if !self.headers.contains_key(name) {
                self.headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// A fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    version: ProtocolVersion,
    url: Url,
}

impl Response {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
        version: ProtocolVersion,
        url: Url,
    ) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            version,
            url,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Protocol version the response was received over
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a 4xx or 5xx response into an error
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(Error::HttpStatus {
                status: self.status,
                url: self.url.to_string(),
            });
        }
        Ok(self)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Per-call overrides of the session configuration
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Wall-clock budget for the whole attempt loop
    pub timeout: Option<Duration>,
    /// Replaces the session retry configuration for this call
    pub retry: Option<RetryConfig>,
    /// Requested protocol version for this call
    pub http_version: Option<ProtocolVersion>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_http_version(mut self, version: ProtocolVersion) -> Self {
        self.http_version = Some(version);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parameters_are_appended() {
        let request = Request::get("https://api.example.com/items?sort=asc")
            .unwrap()
            .query(&[("page", "2"), ("q", "a b")]);
        assert_eq!(
            request.url().as_str(),
            "https://api.example.com/items?sort=asc&page=2&q=a+b"
        );
    }

    #[test]
    fn test_default_headers_do_not_override_request_headers() {
        let mut defaults = HeaderMap::new();
        defaults.insert("accept", HeaderValue::from_static("application/json"));
        defaults.insert("x-api-version", HeaderValue::from_static("2.0"));

        let mut request = Request::get("https://api.example.com")
            .unwrap()
            .header("Accept", "text/plain")
            .unwrap();
        request.merge_default_headers(&defaults);

        assert_eq!(request.header_map()["accept"], "text/plain");
        assert_eq!(request.header_map()["x-api-version"], "2.0");
    }

    #[test]
    fn test_form_body() {
        let request = Request::post("https://auth.example.com/token")
            .unwrap()
            .form(&[("grant_type", "refresh_token"), ("refresh_token", "r&1")]);
        assert_eq!(
            request.body_bytes().unwrap().as_ref(),
            b"grant_type=refresh_token&refresh_token=r%261"
        );
        assert_eq!(
            request.header_map()[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let result = Request::get("https://api.example.com")
            .unwrap()
            .header("bad header", "x");
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_response_json() {
        let response = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            r#"{"name":"tether"}"#,
            ProtocolVersion::Http2,
            Url::parse("https://api.example.com").unwrap(),
        );
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["name"], "tether");
        assert_eq!(response.version(), ProtocolVersion::Http2);
    }

    #[test]
    fn test_error_for_status() {
        let url = Url::parse("https://api.example.com/missing").unwrap();
        let ok = Response::new(StatusCode::NO_CONTENT, HeaderMap::new(), "", ProtocolVersion::Http11, url.clone());
        assert!(ok.error_for_status().is_ok());

        let missing = Response::new(StatusCode::NOT_FOUND, HeaderMap::new(), "", ProtocolVersion::Http11, url);
        let err = missing.error_for_status().unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: StatusCode::NOT_FOUND, .. }));
    }
}
