//! Backend origins and round-robin selection
//!
//! A backend is an opaque [`Fetch`] capability: it fills a caller-owned
//! response from a caller-owned request. The production implementation
//! drives a pooled hyper client; tests substitute mocks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use tracing::debug;

/// Reusable backend-bound request buffer. Part of the pooled per-request
/// scratch; cleared between requests without releasing capacity.
#[derive(Debug)]
pub struct ClientRequest {
    pub method: Method,
    pub path: Vec<u8>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for ClientRequest {
    fn default() -> Self {
        ClientRequest {
            method: Method::GET,
            path: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl ClientRequest {
    pub fn reset(&mut self) {
        self.method = Method::GET;
        self.path.clear();
        self.headers.clear();
        self.body = Bytes::new();
    }
}

/// Reusable backend response buffer.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for ClientResponse {
    fn default() -> Self {
        ClientResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl ClientResponse {
    pub fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.body = Bytes::new();
    }
}

#[derive(Debug)]
pub enum BackendError {
    Client(hyper_util::client::legacy::Error),
    RequestBuild(String),
    Body(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Client(e) => write!(f, "client error: {}", e),
            BackendError::RequestBuild(s) => write!(f, "request build error: {}", s),
            BackendError::Body(s) => write!(f, "response body error: {}", s),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<hyper_util::client::legacy::Error> for BackendError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        BackendError::Client(err)
    }
}

/// An origin reachable through a single `fetch` operation.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, req: &ClientRequest, resp: &mut ClientResponse)
        -> Result<(), BackendError>;
}

/// HTTP origin client with connection pooling.
pub struct HttpBackend {
    addr: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpBackend {
    pub fn new(addr: impl Into<String>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        HttpBackend {
            addr: addr.into(),
            client,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Fetch for HttpBackend {
    async fn fetch(
        &self,
        req: &ClientRequest,
        resp: &mut ClientResponse,
    ) -> Result<(), BackendError> {
        let path = std::str::from_utf8(&req.path).unwrap_or("/");
        let path = if path.is_empty() { "/" } else { path };
        let uri = format!("http://{}{}", self.addr, path);

        let mut builder = Request::builder().method(req.method.clone()).uri(&uri);
        for (name, value) in req.headers.iter() {
            builder = builder.header(name, value);
        }
        let backend_req = builder
            .body(Full::new(req.body.clone()))
            .map_err(|e| BackendError::RequestBuild(e.to_string()))?;

        let response: hyper::Response<Incoming> = self.client.request(backend_req).await?;
        let (parts, body) = response.into_parts();

        resp.status = parts.status;
        resp.headers.clear();
        for (name, value) in parts.headers.iter() {
            // Hop-by-hop headers must not be replayed to clients or cached.
            if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
                continue;
            }
            resp.headers.append(name.clone(), value.clone());
        }

        resp.body = body
            .collect()
            .await
            .map_err(|e| BackendError::Body(e.to_string()))?
            .to_bytes();

        Ok(())
    }
}

/// Round-robin selection over the configured origins.
pub struct BackendPool {
    backends: Vec<Arc<dyn Fetch>>,
    cursor: Mutex<usize>,
}

impl BackendPool {
    pub fn new(backends: Vec<Arc<dyn Fetch>>) -> anyhow::Result<BackendPool> {
        if backends.is_empty() {
            anyhow::bail!("at least one backend address is required");
        }
        Ok(BackendPool {
            backends,
            cursor: Mutex::new(0),
        })
    }

    pub fn from_addrs(addrs: &[String]) -> anyhow::Result<BackendPool> {
        let backends = addrs
            .iter()
            .map(|addr| {
                debug!(addr = %addr, "Configured backend");
                Arc::new(HttpBackend::new(addr)) as Arc<dyn Fetch>
            })
            .collect();
        BackendPool::new(backends)
    }

    /// Next origin in rotation. A single-backend pool short-circuits the
    /// cursor entirely.
    pub fn next(&self) -> Arc<dyn Fetch> {
        if self.backends.len() == 1 {
            return Arc::clone(&self.backends[0]);
        }

        let mut cursor = self.cursor.lock();
        *cursor = if *cursor >= self.backends.len() - 1 {
            0
        } else {
            *cursor + 1
        };
        Arc::clone(&self.backends[*cursor])
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
