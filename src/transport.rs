//! Raw HTTP transport used by the orchestrator.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, ETAG, HeaderMap, HeaderName, HeaderValue,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::document::ConditionalHeaders;
use crate::error::{ConfigError, FetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    /// Headers only, used to probe the content type.
    Head,
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl TransportRequest {
    pub fn get(url: Url) -> Self {
        TransportRequest {
            method: Method::Get,
            url,
            headers: HeaderMap::new(),
        }
    }

    pub fn head(url: Url) -> Self {
        TransportRequest {
            method: Method::Head,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Set a header. Values that are not valid header text are skipped with a warning.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(e) => tracing::warn!("Skipping invalid {} header value: {}", name, e),
        }
        self
    }

    pub fn accept(self, media_type: &str) -> Self {
        self.with_header(ACCEPT, media_type)
    }

    pub fn conditional(mut self, headers: &ConditionalHeaders) -> Self {
        if let Some(etag) = &headers.if_none_match {
            self = self.with_header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &headers.if_modified_since {
            self = self.with_header(IF_MODIFIED_SINCE, last_modified);
        }
        self
    }

    pub fn authorization(self, credentials: &Credentials) -> Self {
        self.with_header(AUTHORIZATION, &credentials.header_value())
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        TransportResponse {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.insert(name, HeaderValue::from_static(value));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    pub fn etag(&self) -> Option<String> {
        self.header(ETAG).map(str::to_string)
    }

    pub fn last_modified(&self) -> Option<String> {
        self.header(LAST_MODIFIED).map(str::to_string)
    }
}

/// Sends requests to the network.
///
/// Implementations report connectivity problems and timeouts as [`FetchError::Transport`] and
/// return every HTTP response, whatever its status, as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, FetchError>;
}

/// Authorization attached to requests made with `use_auth`.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

impl Credentials {
    /// Value of the `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Bearer(token) => format!("Bearer {}", token),
            Credentials::Basic { username, password } => {
                format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// [`Transport`] over a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(Self::user_agent())
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                name: "http_client",
                value: e.to_string(),
            })?;
        Ok(ReqwestTransport { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }

    pub fn user_agent() -> &'static str {
        concat!("docfetch/", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, FetchError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
        };
        let url = request.url.to_string();

        let response = self
            .client
            .request(method, request.url)
            .headers(request.headers)
            .send()
            .await
            .map_err(|e| FetchError::transport(&url, e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::transport(&url, e))?;

        tracing::debug!("{} {} -> {}", request_label(request.method), url, status);
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn request_label(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Head => "HEAD",
    }
}
