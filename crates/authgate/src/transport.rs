//! Transport contract and the reqwest-backed HTTP transport
//!
//! A transport performs exactly one network exchange per call. It knows
//! nothing about credentials beyond the headers it is handed.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::GatewayConfig;
use crate::{GatewayError, Result};

/// Header name -> value
pub type Headers = BTreeMap<String, String>;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Patch => write!(f, "PATCH"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

impl std::str::FromStr for Method {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(GatewayError::InvalidConfig(format!(
                "Unsupported method: {}",
                other
            ))),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// What the caller wants sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: Method,

    /// Path relative to the base URL
    pub path: String,

    /// JSON body
    pub body: Option<serde_json::Value>,

    /// Extra headers (the credential header is added by the dispatcher)
    pub headers: Headers,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Headers::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl std::fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Successful exchange
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string())
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Body as UTF-8 text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failed exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A single network exchange
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &RequestDescriptor,
        headers: &Headers,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// HTTP transport on top of reqwest
///
/// The cookie jar carries the refresh token between the login response and
/// later refresh calls.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration, cookie_store: bool) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| GatewayError::InvalidConfig(format!("base_url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(cookie_store)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            config.timeout(),
            config.transport.cookie_store,
        )
    }

    /// Resolve a request path against the base URL
    pub fn url_for(&self, path: &str) -> std::result::Result<Url, TransportError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).map_err(|e| TransportError::InvalidRequest(e.to_string()));
        }
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }
}

/// Request headers overlaid with `overrides`; names compare case-insensitively
/// and the override wins.
pub fn merge_headers(request: &Headers, overrides: &Headers) -> Headers {
    let mut merged: Headers = request
        .iter()
        .filter(|(name, _)| {
            !overrides
                .keys()
                .any(|key| key.eq_ignore_ascii_case(name.as_str()))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &RequestDescriptor,
        headers: &Headers,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        let mut builder = self.client.request(request.method.into(), url);

        for (name, value) in merge_headers(&request.headers, headers) {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let response_headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        if !(200..300).contains(&status) {
            return Err(TransportError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(TransportResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}
