//! The caching reverse proxy
//!
//! Per request: evaluate the no-cache rules, serve from the cache on a
//! path hit, otherwise forward to the next backend in rotation, run the
//! header rules over the reply, and admit it to the cache when nothing
//! forbids it. [`Proxy`] holds the compiled rules and shared state;
//! [`ProxyServer`] binds the listener and dispatches connections to it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::BackendPool;
use crate::cache::Cache;
use crate::config::ProxyConfig;
use crate::error::error_response;
use crate::rules::{
    apply_header_rules, check_no_cache, HeaderAction, HeaderRule, RequestCtx, ResponseCtx, Rule,
};
use crate::tools::{ProxyTools, ToolPool};

/// Request header stamped on every backend-bound request so origins can
/// detect the hop.
pub const PROXY_HEADER: &str = "x-cachegate-proxy";
pub const PROXY_HEADER_VALUE: &str = "true";

/// Shared request pipeline. Rules are compiled once at construction and
/// immutable afterwards.
pub struct Proxy {
    cache: Arc<Cache>,
    backends: BackendPool,
    nocache_rules: Vec<Rule>,
    header_rules: Vec<HeaderRule>,
    tools: ToolPool,
}

impl Proxy {
    pub fn new(
        config: &ProxyConfig,
        cache: Arc<Cache>,
        backends: BackendPool,
    ) -> anyhow::Result<Proxy> {
        let mut nocache_rules = Vec::with_capacity(config.nocache.len());
        for text in &config.nocache {
            let rule = Rule::compile(text)
                .map_err(|e| anyhow::anyhow!("invalid no-cache rule '{}': {}", text, e))?;
            nocache_rules.push(rule);
        }

        let mut header_rules = Vec::new();
        for h in &config.response.headers.set {
            let rule = HeaderRule::compile(
                HeaderAction::Set,
                &h.name,
                h.value.as_deref(),
                h.when.as_deref(),
            )
            .map_err(|e| anyhow::anyhow!("invalid set-header rule '{}': {}", h.name, e))?;
            header_rules.push(rule);
        }
        for h in &config.response.headers.unset {
            let rule = HeaderRule::compile(HeaderAction::Unset, &h.name, None, h.when.as_deref())
                .map_err(|e| anyhow::anyhow!("invalid unset-header rule '{}': {}", h.name, e))?;
            header_rules.push(rule);
        }

        // Size every binding container to the longest rule.
        let params_capacity = nocache_rules
            .iter()
            .map(|r| r.params.len())
            .chain(header_rules.iter().map(|r| r.params_len()))
            .max()
            .unwrap_or(0);

        Ok(Proxy {
            cache,
            backends,
            nocache_rules,
            header_rules,
            tools: ToolPool::new(params_capacity),
        })
    }

    /// Serve one request. Internal failures become plain-text 500s; this
    /// never errors at the transport level.
    pub async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        let mut tools = self.tools.acquire();
        let response = self.serve(&req, &mut tools).await;
        self.tools.release(tools);
        response
    }

    async fn serve(&self, req: &Request<Bytes>, pt: &mut ProxyTools) -> Response<Full<Bytes>> {
        let host = host_bytes(req);
        let path = req.uri().path();
        let req_ctx = RequestCtx {
            method: req.method(),
            host,
            path: path.as_bytes(),
            headers: req.headers(),
        };

        let no_cache = match check_no_cache(&self.nocache_rules, &req_ctx, None, &mut pt.params) {
            Ok(v) => v,
            Err(e) => {
                error!(path = %path, error = %e, "No-cache rule evaluation failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };

        if !no_cache {
            match self.cache.get_bytes(host, &mut pt.entry) {
                Ok(()) => {
                    if let Some(cached) = pt.entry.get_response(path.as_bytes()) {
                        debug!(
                            cache_key = %String::from_utf8_lossy(host),
                            path = %path,
                            "Cache hit"
                        );
                        return cached_response(cached);
                    }
                }
                Err(e) => {
                    // A broken blob is a miss, not a failed request.
                    warn!(
                        cache_key = %String::from_utf8_lossy(host),
                        error = %e,
                        "Could not read cache entry, treating as miss"
                    );
                    pt.entry.reset();
                }
            }
        }

        match self.fetch_from_backend(&req_ctx, req, pt).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    cache_key = %String::from_utf8_lossy(host),
                    path = %path,
                    error = %e,
                    "Request failed"
                );
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn fetch_from_backend(
        &self,
        req_ctx: &RequestCtx<'_>,
        req: &Request<Bytes>,
        pt: &mut ProxyTools,
    ) -> anyhow::Result<Response<Full<Bytes>>> {
        debug!(method = %req.method(), path = %req.uri().path(), "Forwarding to backend");

        pt.req.reset();
        pt.resp.reset();
        pt.req.method = req.method().clone();
        pt.req.path.extend_from_slice(req_ctx.path);
        pt.req.body = req.body().clone();
        for (name, value) in req.headers().iter() {
            pt.req.headers.append(name.clone(), value.clone());
        }
        pt.req.headers.insert(
            HeaderName::from_static(PROXY_HEADER),
            HeaderValue::from_static(PROXY_HEADER_VALUE),
        );

        let backend = self.backends.next();
        backend
            .fetch(&pt.req, &mut pt.resp)
            .await
            .map_err(|e| anyhow::anyhow!("could not fetch response from backend: {}", e))?;

        // Rules see the outbound copy of the request, proxy header included.
        let backend_ctx = RequestCtx {
            method: &pt.req.method,
            host: req_ctx.host,
            path: &pt.req.path,
            headers: &pt.req.headers,
        };

        apply_header_rules(
            &self.header_rules,
            &backend_ctx,
            pt.resp.status,
            &mut pt.resp.headers,
            &mut pt.params,
        )
        .map_err(|e| anyhow::anyhow!("could not process header rules: {}", e))?;

        // Redirects are terminal: replay them untouched and cache nothing.
        if pt.resp.headers.contains_key(header::LOCATION) {
            return Ok(backend_response(&pt.resp));
        }

        let resp_ctx = ResponseCtx {
            status: pt.resp.status,
            headers: &pt.resp.headers,
        };
        let no_cache = check_no_cache(
            &self.nocache_rules,
            &backend_ctx,
            Some(&resp_ctx),
            &mut pt.params,
        )?;

        let response = backend_response(&pt.resp);

        if !no_cache && pt.resp.status == StatusCode::OK {
            let cached = pt.entry.set_response(req_ctx.path);
            cached.body.extend_from_slice(&pt.resp.body);
            for (name, value) in pt.resp.headers.iter() {
                cached.add_header(name.as_str().as_bytes(), value.as_bytes());
            }
            pt.entry.encode(&mut pt.encode_buf);
            if let Err(e) = self.cache.set(req_ctx.host, &pt.encode_buf) {
                warn!(
                    cache_key = %String::from_utf8_lossy(req_ctx.host),
                    error = %e,
                    "Could not save response in cache"
                );
            }
        }

        Ok(response)
    }
}

/// Cache key for a request: the Host header, falling back to the URI
/// authority.
fn host_bytes(req: &Request<Bytes>) -> &[u8] {
    if let Some(host) = req.headers().get(header::HOST) {
        return host.as_bytes();
    }
    req.uri().host().map(|h| h.as_bytes()).unwrap_or_default()
}

/// Replay a cached response. Hits are always 200: only 200s are admitted.
fn cached_response(cached: &crate::entry::CachedResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(&cached.body)));
    for h in cached.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(&h.key),
            HeaderValue::from_bytes(&h.value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Copy the (possibly mutated) backend reply into an outbound response.
fn backend_response(resp: &crate::backend::ClientResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(resp.body.clone()));
    *response.status_mut() = resp.status;
    response.headers_mut().clone_from(&resp.headers);
    response
}

/// The HTTP front: binds the address and dispatches requests to [`Proxy`].
pub struct ProxyServer {
    bind_addr: SocketAddr,
    proxy: Arc<Proxy>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, proxy: Arc<Proxy>, shutdown_rx: watch::Receiver<bool>) -> Self {
        ProxyServer {
            bind_addr,
            proxy,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let proxy = Arc::clone(&self.proxy);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, proxy).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, proxy: Arc<Proxy>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        format!("could not read request body: {}", e),
                    ));
                }
            };
            Ok::<_, hyper::Error>(proxy.handle(Request::from_parts(parts, body)).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}
