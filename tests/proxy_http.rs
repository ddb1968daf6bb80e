//! End-to-end tests over real sockets: an origin server, the proxy front
//! and the admin front, exercised with raw HTTP/1.1 requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachegate::admin::AdminServer;
use cachegate::backend::BackendPool;
use cachegate::cache::{Cache, CacheConfig};
use cachegate::config::ProxyConfig;
use cachegate::invalidator::Invalidator;
use cachegate::proxy::{Proxy, ProxyServer};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const PROXY_PORT: u16 = 18081;
const ADMIN_PORT: u16 = 18082;

/// Minimal origin: every request gets `200 OK`, body "hello", `X-A: 1`.
async fn spawn_origin(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .header("x-a", "1")
                                .body(Full::new(Bytes::from_static(b"hello")))
                                .unwrap(),
                        )
                    }
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    addr
}

async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Send one HTTP/1.1 request and return the raw response text.
async fn http_request(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn http_get(port: u16, host: &str, path: &str) -> String {
    let raw = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    http_request(port, &raw).await
}

async fn http_post(port: u16, path: &str, body: &str) -> String {
    let raw = format!(
        "POST {} HTTP/1.1\r\nHost: admin\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    http_request(port, &raw).await
}

#[tokio::test]
async fn test_end_to_end_cache_and_invalidation() {
    let hits = Arc::new(AtomicUsize::new(0));
    let origin_addr = spawn_origin(Arc::clone(&hits)).await;

    let cache = Arc::new(
        Cache::new(CacheConfig {
            ttl: Duration::from_secs(60),
            clean_frequency: Duration::from_secs(60),
            max_entries: 64,
            max_entry_size: 64 * 1024,
            hard_max_cache_size: 4,
            verbose: false,
        })
        .unwrap(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let invalidator = Invalidator::new(Arc::clone(&cache), 2);
    tokio::spawn(Arc::clone(&invalidator).run(shutdown_rx.clone()));

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", ADMIN_PORT).parse().unwrap();
    let admin = AdminServer::new(admin_addr, Arc::clone(&invalidator), shutdown_rx.clone());
    tokio::spawn(admin.run());

    let config = ProxyConfig::default();
    let backends = BackendPool::from_addrs(&[origin_addr.to_string()]).unwrap();
    let proxy = Arc::new(Proxy::new(&config, Arc::clone(&cache), backends).unwrap());
    let proxy_addr: SocketAddr = format!("127.0.0.1:{}", PROXY_PORT).parse().unwrap();
    tokio::spawn(ProxyServer::new(proxy_addr, proxy, shutdown_rx.clone()).run());

    assert!(wait_for_port(PROXY_PORT, Duration::from_secs(5)).await);
    assert!(wait_for_port(ADMIN_PORT, Duration::from_secs(5)).await);

    // Miss hits the origin.
    let response = http_get(PROXY_PORT, "h", "/p").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("hello"));
    assert!(response.to_lowercase().contains("x-a: 1"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Hit is served from the cache.
    let response = http_get(PROXY_PORT, "h", "/p").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("hello"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Invalidate the host through the admin front.
    let response = http_post(ADMIN_PORT, "/invalidate", r#"{"host":"h"}"#).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("OK"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while invalidator.pending() > 0 {
        assert!(Instant::now() < deadline, "invalidator did not drain");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cache.get(b"h").is_err());

    // Next request reaches the origin again.
    let response = http_get(PROXY_PORT, "h", "/p").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Malformed invalidation entries are rejected with 400.
    let response = http_post(ADMIN_PORT, "/invalidate", r#"{"path":"/p"}"#).await;
    assert!(response.starts_with("HTTP/1.1 400"));

    let _ = shutdown_tx.send(true);
}
