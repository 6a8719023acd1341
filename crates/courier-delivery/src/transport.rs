use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use courier_core::DeliveryError;

/// One outgoing HTTP exchange.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn post(url: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: reqwest::Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body,
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("could not build request: {0}")]
    Build(String),
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Http { status, body } => DeliveryError::from_status(status, body),
            TransportError::Network(msg) => DeliveryError::Network(msg),
            TransportError::Timeout => DeliveryError::Timeout,
            // An unbuildable request (bad endpoint URL or header) fails the same way every time.
            TransportError::Build(msg) => DeliveryError::InvalidPayload(msg),
        }
    }
}

/// Low-level HTTP seam. Implementations own TLS and connection handling;
/// they report non-2xx statuses as [`TransportError::Http`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, req: Request) -> Result<Response, TransportError>;
}

#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// A client with the courier user agent.
    pub fn with_default_client() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::new(client))
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::Build(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, req: Request) -> Result<Response, TransportError> {
        let Request {
            method,
            url,
            headers,
            body,
            timeout,
        } = req;
        trace!(%method, %url, bytes = body.len(), "sending request");

        let mut builder = self.client.request(method, &url).body(body);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await.map_err(Self::map_error)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(Self::map_error)?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(Response {
            status: status.as_u16(),
            body: bytes,
        })
    }
}
