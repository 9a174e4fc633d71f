//! Blocking HTTP transport used by the license and provisioning clients.
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// HTTP method of a DRM exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// One outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<&'a [u8]>,
    /// Overrides the transport's read timeout when set.
    pub timeout: Option<Duration>,
}

impl<'a> HttpRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            method: Method::Get,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: &'a str, body: &'a [u8]) -> Self {
        Self {
            method: Method::Post,
            url,
            headers: Vec::new(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Value of the first header called `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP client.
///
/// Implementations map connection failures to [`crate::Error::Transport`]
/// and timeouts to [`crate::Error::timeout`]. Any status code, including
/// errors, is returned as a response. TLS trust is the transport's concern.
pub trait HttpTransport: Send + Sync {
    fn request(&self, request: &HttpRequest<'_>) -> Result<HttpResponse>;
}

#[cfg(feature = "http")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "http")]
mod reqwest_transport {
    use reqwest::blocking::Client;

    use super::{HttpRequest, HttpResponse, HttpTransport, Method};
    use crate::config::HttpConfig;
    use crate::error::{Error, Result};

    /// [`HttpTransport`] backed by `reqwest`'s blocking client.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: Client,
    }

    impl ReqwestTransport {
        pub fn new(config: &HttpConfig) -> Result<Self> {
            let client = Client::builder()
                .user_agent(config.user_agent.as_str())
                .connect_timeout(config.connect_timeout())
                .timeout(config.read_timeout())
                .build()
                .map_err(|e| Error::transport(format!("Failed to build HTTP client: {}", e)))?;
            Ok(Self { client })
        }
    }

    fn map_error(e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(format!("HTTP request timed out: {}", e))
        } else {
            Error::transport(format!("HTTP request failed: {}", e))
        }
    }

    impl HttpTransport for ReqwestTransport {
        fn request(&self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
            let mut builder = match request.method {
                Method::Get => self.client.get(request.url),
                Method::Post => self.client.post(request.url),
            };
            for (name, value) in &request.headers {
                builder = builder.header(*name, value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body.to_vec());
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let response = builder.send().map_err(map_error)?;
            let status = response.status().as_u16();
            let body = response.bytes().map_err(map_error)?.to_vec();
            Ok(HttpResponse { status, body })
        }
    }
}
