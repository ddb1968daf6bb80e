//! Admin API server for cache invalidation
//!
//! Accepts `POST` requests whose JSON body describes which cached
//! responses to evict, and hands them to the invalidator queue. Replies
//! `200 OK` on accepted enqueue and `400` with a plain-text message when
//! the entry is malformed or the queue is full.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{error_response, response};
use crate::invalidator::{InvalidationEntry, Invalidator};

pub struct AdminServer {
    bind_addr: SocketAddr,
    invalidator: Arc<Invalidator>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        invalidator: Arc<Invalidator>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        AdminServer {
            bind_addr,
            invalidator,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let invalidator = Arc::clone(&self.invalidator);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, invalidator).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: tokio::net::TcpStream,
    invalidator: Arc<Invalidator>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let invalidator = Arc::clone(&invalidator);
        async move {
            if req.method() != Method::POST {
                return Ok::<_, hyper::Error>(error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "only POST is accepted",
                ));
            }
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        format!("could not read request body: {}", e),
                    ));
                }
            };
            Ok(invalidate(&invalidator, &body))
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("admin connection error: {}", e))?;

    Ok(())
}

/// Parse and enqueue one invalidation request body.
fn invalidate(invalidator: &Invalidator, body: &[u8]) -> Response<Full<Bytes>> {
    debug!(body = %String::from_utf8_lossy(body), "Invalidation received");

    let entry: InvalidationEntry = match serde_json::from_slice(body) {
        Ok(entry) => entry,
        Err(e) => {
            error!(error = %e, "Malformed invalidation entry");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid invalidation entry: {}", e),
            );
        }
    };

    match invalidator.add(entry) {
        Ok(()) => response(StatusCode::OK, "OK"),
        Err(e) => {
            error!(error = %e, "Could not add invalidation entry");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}
