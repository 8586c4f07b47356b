//! Network transport seam.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use http::{Method, StatusCode};

/// Error type for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Failed to reach the server.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request could not be issued.
    #[error("request error: {0}")]
    Request(String),

    /// The body stream failed mid-read.
    #[error("body error: {0}")]
    Body(String),
}

/// Relative priority of a prefetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPriority {
    /// Background work; yield to navigations.
    Low,
    /// Let the platform decide.
    #[default]
    Auto,
    /// The user is likely to need this imminently.
    High,
}

/// An outbound prefetch request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: Method,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Scheduling priority hint.
    pub priority: FetchPriority,
}

impl FetchRequest {
    /// Build a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            priority: FetchPriority::default(),
        }
    }

    /// Build a HEAD request.
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::HEAD,
            headers: Vec::new(),
            priority: FetchPriority::default(),
        }
    }

    /// Add a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: FetchPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Look up a request header, case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Streamed response body: a sequence of byte chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// A response from the transport.
pub struct FetchResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Whether the request was redirected before producing this response.
    pub redirected: bool,
    /// Final URL after redirects.
    pub url: String,
    headers: Vec<(String, String)>,
    body: Option<BodyStream>,
}

impl FetchResponse {
    /// Build a response.
    pub fn new(status: StatusCode, url: impl Into<String>) -> Self {
        Self {
            status,
            redirected: false,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Mark the response as having followed a redirect.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Add a response header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a streaming body.
    pub fn with_body(mut self, body: BodyStream) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach a single-chunk body.
    pub fn with_body_bytes(self, bytes: Vec<u8>) -> Self {
        self.with_body(Box::pin(futures::stream::iter([Ok(bytes)])))
    }

    /// Whether the response has a 2xx status.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Look up a response header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Take the body stream, leaving `None` behind.
    pub fn take_body(&mut self) -> Option<BodyStream> {
        self.body.take()
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("redirected", &self.redirected)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// The network collaborator.
///
/// Implementations issue the request and surface the response envelope
/// without interpreting navigation payloads.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a request.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// Spin-backed transport for wasm targets.
///
/// Spin's outbound HTTP future is not `Send`, so this type exposes an
/// inherent async `fetch` that the embedding glue drives on the local task,
/// mirroring the [`Transport`] trait's shape.
#[cfg(target_arch = "wasm32")]
pub struct SpinTransport;

#[cfg(target_arch = "wasm32")]
impl SpinTransport {
    /// Issue a request through Spin's outbound HTTP host.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        use spin_sdk::http::{Method as SpinMethod, Request};

        let method = if request.method == Method::HEAD {
            SpinMethod::Head
        } else {
            SpinMethod::Get
        };
        let mut builder = Request::builder();
        builder.method(method).uri(&request.url);
        for (name, value) in &request.headers {
            builder.header(name, value);
        }
        let response: spin_sdk::http::Response = spin_sdk::http::send(builder.build())
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = StatusCode::from_u16(*response.status())
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let mut out = FetchResponse::new(status, request.url.clone());
        for (name, value) in response.headers() {
            if let Some(value) = value.as_str() {
                out = out.with_header(name, value);
            }
        }
        Ok(out.with_body_bytes(response.body().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = FetchResponse::new(StatusCode::OK, "/a").with_header("Content-Type", "text/x-nav-stream");
        assert_eq!(response.header("content-type"), Some("text/x-nav-stream"));
        assert_eq!(response.header("CONTENT-TYPE"), Some("text/x-nav-stream"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn test_take_body_leaves_none() {
        let mut response = FetchResponse::new(StatusCode::OK, "/a").with_body_bytes(vec![1, 2]);
        assert!(response.take_body().is_some());
        assert!(response.take_body().is_none());
    }

    #[test]
    fn test_request_builder_accumulates_headers() {
        let request = FetchRequest::get("/a")
            .header("x-nav-segment", "/_tree")
            .header("x-nav-url", "/ctx")
            .with_priority(FetchPriority::High);
        assert_eq!(request.header_value("X-Nav-Segment"), Some("/_tree"));
        assert_eq!(request.header_value("x-nav-url"), Some("/ctx"));
        assert_eq!(request.priority, FetchPriority::High);
    }
}
