//! Cross-component pipeline tests: proxy, cache, rules and invalidator
//! wired together the way the binary wires them, with scripted backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use cachegate::backend::{BackendError, BackendPool, ClientRequest, ClientResponse, Fetch};
use cachegate::cache::{Cache, CacheConfig};
use cachegate::config::{HeaderEntry, ProxyConfig};
use cachegate::entry::Entry;
use cachegate::invalidator::{InvalidationEntry, InvalidationHeader, Invalidator};
use cachegate::proxy::Proxy;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Request, StatusCode};
use tokio::sync::watch;

struct ScriptedBackend {
    calls: AtomicUsize,
    status: StatusCode,
    body: &'static [u8],
    headers: Vec<(&'static str, &'static str)>,
}

impl ScriptedBackend {
    fn new(
        status: StatusCode,
        body: &'static [u8],
        headers: &[(&'static str, &'static str)],
    ) -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend {
            calls: AtomicUsize::new(0),
            status,
            body,
            headers: headers.to_vec(),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for ScriptedBackend {
    async fn fetch(
        &self,
        _req: &ClientRequest,
        resp: &mut ClientResponse,
    ) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        resp.status = self.status;
        resp.body = Bytes::from_static(self.body);
        resp.headers.clear();
        for (k, v) in &self.headers {
            resp.headers.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_static(v),
            );
        }
        Ok(())
    }
}

fn test_cache() -> Arc<Cache> {
    Arc::new(
        Cache::new(CacheConfig {
            ttl: Duration::from_secs(60),
            clean_frequency: Duration::from_secs(60),
            max_entries: 64,
            max_entry_size: 64 * 1024,
            hard_max_cache_size: 4,
            verbose: false,
        })
        .unwrap(),
    )
}

fn build_proxy(
    cache: Arc<Cache>,
    backends: Vec<Arc<ScriptedBackend>>,
    configure: impl FnOnce(&mut ProxyConfig),
) -> Proxy {
    let mut config = ProxyConfig::default();
    configure(&mut config);
    let pool = BackendPool::new(
        backends
            .into_iter()
            .map(|b| b as Arc<dyn Fetch>)
            .collect(),
    )
    .unwrap();
    Proxy::new(&config, cache, pool).unwrap()
}

fn request(host: &str, path: &str) -> Request<Bytes> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, host)
        .body(Bytes::new())
        .unwrap()
}

async fn drain(invalidator: &Invalidator) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while invalidator.pending() > 0 {
        assert!(Instant::now() < deadline, "invalidator did not drain");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_admitted_response_replays_until_invalidated() {
    let cache = test_cache();
    let backend = ScriptedBackend::new(StatusCode::OK, b"payload", &[("x-tag", "v1")]);
    let proxy = build_proxy(Arc::clone(&cache), vec![Arc::clone(&backend)], |_| {});

    let invalidator = Invalidator::new(Arc::clone(&cache), 2);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&invalidator).run(shutdown_rx));

    // Miss, then hits.
    proxy.handle(request("shop.example", "/catalog")).await;
    proxy.handle(request("shop.example", "/catalog")).await;
    proxy.handle(request("shop.example", "/catalog")).await;
    assert_eq!(backend.calls(), 1);

    // Evict by host, next request reaches the backend again.
    invalidator
        .add(InvalidationEntry {
            host: "shop.example".to_string(),
            ..InvalidationEntry::default()
        })
        .unwrap();
    drain(&invalidator).await;
    assert!(cache.get(b"shop.example").is_err());

    proxy.handle(request("shop.example", "/catalog")).await;
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_header_invalidation_targets_tagged_responses() {
    let cache = test_cache();
    let backend = ScriptedBackend::new(StatusCode::OK, b"x", &[("x-tag", "x")]);
    let proxy = build_proxy(Arc::clone(&cache), vec![Arc::clone(&backend)], |_| {});

    let invalidator = Invalidator::new(Arc::clone(&cache), 2);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&invalidator).run(shutdown_rx));

    // Two cached paths under one host, both tagged.
    proxy.handle(request("h", "/a")).await;
    proxy.handle(request("h", "/b")).await;
    let mut entry = Entry::default();
    cache.get_bytes(b"h", &mut entry).unwrap();
    assert_eq!(entry.len(), 2);

    invalidator
        .add(InvalidationEntry {
            host: "h".to_string(),
            header: InvalidationHeader {
                key: "X-Tag".to_string(),
                value: "x".to_string(),
            },
            ..InvalidationEntry::default()
        })
        .unwrap();
    drain(&invalidator).await;

    cache.get_bytes(b"h", &mut entry).unwrap();
    assert!(entry.is_empty());
}

#[tokio::test]
async fn test_mutated_headers_survive_the_cache() {
    let cache = test_cache();
    let backend = ScriptedBackend::new(
        StatusCode::OK,
        b"data",
        &[("x-data", "1"), ("x-internal", "secret")],
    );
    let proxy = build_proxy(Arc::clone(&cache), vec![Arc::clone(&backend)], |c| {
        c.response.headers.set = vec![HeaderEntry {
            name: "X-Gate".to_string(),
            value: Some("true".to_string()),
            when: Some("$(resp.header::X-Data) == '1'".to_string()),
        }];
        c.response.headers.unset = vec![HeaderEntry {
            name: "X-Internal".to_string(),
            value: None,
            when: None,
        }];
    });

    let first = proxy.handle(request("h", "/p")).await;
    assert_eq!(first.headers().get("x-gate").unwrap(), "true");
    assert!(first.headers().get("x-internal").is_none());

    // The hit replays post-mutation bytes without touching the backend.
    let second = proxy.handle(request("h", "/p")).await;
    assert_eq!(backend.calls(), 1);
    assert_eq!(second.headers().get("x-gate").unwrap(), "true");
    assert!(second.headers().get("x-internal").is_none());
    assert_eq!(second.headers().get("x-data").unwrap(), "1");
}

#[tokio::test]
async fn test_request_rules_and_response_rules_compose() {
    let cache = test_cache();
    let backend = ScriptedBackend::new(StatusCode::OK, b"private", &[("cache-control", "no-store")]);
    let proxy = build_proxy(Arc::clone(&cache), vec![Arc::clone(&backend)], |c| {
        c.nocache = vec![
            "$(method) == 'POST'".to_string(),
            "$(resp.header::Cache-Control) == 'no-store'".to_string(),
        ];
    });

    // GET does not match the request-phase rule, but the response-phase
    // rule forbids admission anyway.
    proxy.handle(request("h", "/p")).await;
    proxy.handle(request("h", "/p")).await;
    assert_eq!(backend.calls(), 2);
    assert!(cache.get(b"h").is_err());
}
