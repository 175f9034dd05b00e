//! Outbound HTTP seam.
//!
//! Webhook delivery, notification routing, and the HTTP variable source all
//! talk to the network through [`HttpClient`]. Production uses
//! [`ReqwestClient`]; tests plug in [`RecordingClient`] and never touch a
//! socket. No store lock is ever held across a call.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// HTTP method used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

/// A fully built outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute `http(s)://` URL.
    pub url: String,
    /// Header name/value pairs in send order.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// A JSON `POST`.
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body,
        }
    }

    /// A bodiless `GET`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status and body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests. Transport failures are `Err`; non-2xx statuses are `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync + fmt::Debug {
    /// Perform one request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// `reqwest`-backed client with a fixed total timeout.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).body(request.body),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

/// In-process client that records requests and replies from a script.
///
/// Responses are matched by URL prefix; unmatched URLs get `200` with an empty
/// body. A scripted status of `0` simulates a transport error.
#[derive(Debug, Default)]
pub struct RecordingClient {
    requests: Mutex<Vec<HttpRequest>>,
    responses: Mutex<Vec<(String, u16, Vec<u8>)>>,
}

impl RecordingClient {
    /// Empty recorder answering `200` to everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests whose URL starts with `url_prefix`.
    pub fn respond(&self, url_prefix: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) {
        self.responses.lock().push((url_prefix.into(), status, body.into()));
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpClient for RecordingClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let scripted = self
            .responses
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _, _)| request.url.starts_with(prefix.as_str()))
            .map(|(_, status, body)| (*status, body.clone()));
        self.requests.lock().push(request);
        match scripted {
            Some((0, _)) => Err(Error::Http("connection refused".to_string())),
            Some((status, body)) => Ok(HttpResponse { status, body }),
            None => Ok(HttpResponse { status: 200, body: Vec::new() }),
        }
    }
}

/// Validate that `url` is an absolute `http://` or `https://` URL with a host.
pub fn validate_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let parsed = reqwest::Url::parse(trimmed)
        .map_err(|_| Error::validation("url must be an absolute http or https url"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(Error::validation("url must be an absolute http or https url"));
    }
    Ok(trimmed.to_string())
}
