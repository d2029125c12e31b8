//! HTTP client for service-to-service calls
//!
//! Wraps reqwest with a base URL, the internal shared-secret header and an
//! error type that classifies failures as transient or terminal.

use anyhow::{Context, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client, Method,
};
use serde::{de::DeserializeOwned, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Header carrying the shared secret on internal endpoints
pub const SECRET_HEADER: &str = "X-Internal-Secret";

/// HTTP client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Connection refused to {0}")]
    ConnectionRefused(String),

    #[error("HTTP {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ClientError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Every 5xx counts; callers with their own meaning for a status (the
    /// executor's 502 and 504) map it before it becomes an error.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Timeout(_) | ClientError::ConnectionRefused(_) => true,
            ClientError::RequestFailed(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            ClientError::Decode { .. } => false,
        }
    }
}

/// Raw HTTP response
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: String,
    pub duration_ms: u64,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        serde_json::from_str(&self.body).map_err(|e| ClientError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Client bound to one service
#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    base_url: String,
    default_headers: HeaderMap,
    timeout_secs: u64,
}

impl ServiceClient {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            timeout_secs,
        })
    }

    /// Send the shared secret with every request
    pub fn with_secret(mut self, secret: Option<&str>) -> Result<Self> {
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            let value = HeaderValue::from_str(secret).context("Invalid secret header value")?;
            self.default_headers.insert(SECRET_HEADER, value);
        }
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    /// Send a request and return the raw response, whatever its status
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<HttpResponse, ClientError> {
        let url = self.build_url(path);
        debug!("Sending {} request to {}", method, url);

        let mut req_builder = self
            .client
            .request(method, &url)
            .headers(self.default_headers.clone());
        if let Some(body) = body {
            req_builder = req_builder.json(body);
        }

        let start = Instant::now();
        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                ClientError::ConnectionRefused(url.clone())
            } else {
                ClientError::RequestFailed(e.to_string())
            }
        })?;

        let status_code = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(self.timeout_secs)
            } else {
                ClientError::RequestFailed(e.to_string())
            }
        })?;
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!("Response: {} from {} in {}ms", status_code, url, duration_ms);
        Ok(HttpResponse {
            status_code,
            body,
            duration_ms,
        })
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let url = self.build_url(path);
        let response = self.send(method, path, body).await?;
        if !response.is_success() {
            return Err(ClientError::Status {
                status: response.status_code,
                url,
                body: response.body,
            });
        }
        response.json(&url)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.call::<(), T>(Method::GET, path, None).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.call(Method::POST, path, Some(body)).await
    }

    pub async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.call(Method::PUT, path, Some(body)).await
    }
}
