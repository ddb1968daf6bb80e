//! Asynchronous cache invalidation
//!
//! Admin-issued entries are queued on a bounded channel and consumed by a
//! small pool of workers. A supervisor watches the backlog and spawns
//! additional workers up to the configured maximum; idle workers retire
//! themselves, but one worker always stays alive. On shutdown the queue is
//! drained before the supervisor returns.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::entry::Entry;

/// Queue capacity. `add` fails once this many entries are pending.
const QUEUE_CAPACITY: usize = 1024;

/// Backlog poll interval for the supervisor.
const SUPERVISOR_TICK: Duration = Duration::from_millis(500);

/// How long a worker waits on an empty queue before retiring.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Host value that applies an invalidation to every cached host.
const WILDCARD_HOST: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvalidationHeader {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// One invalidation request. `host` alone drops the whole entry; adding
/// `path` and/or `header` narrows the eviction to matching responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InvalidationEntry {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub header: InvalidationHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationError {
    EmptyHost,
    QueueFull,
}

impl fmt::Display for InvalidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationError::EmptyHost => write!(f, "invalidation entry requires a host"),
            InvalidationError::QueueFull => write!(f, "invalidation queue is full"),
        }
    }
}

impl std::error::Error for InvalidationError {}

type Queue = Arc<tokio::sync::Mutex<mpsc::Receiver<InvalidationEntry>>>;

pub struct Invalidator {
    cache: Arc<Cache>,
    tx: mpsc::Sender<InvalidationEntry>,
    rx: Mutex<Option<mpsc::Receiver<InvalidationEntry>>>,
    /// Entries accepted but not yet applied.
    pending: AtomicUsize,
    active_workers: AtomicUsize,
    max_workers: usize,
}

impl Invalidator {
    pub fn new(cache: Arc<Cache>, max_workers: usize) -> Arc<Invalidator> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(Invalidator {
            cache,
            tx,
            rx: Mutex::new(Some(rx)),
            pending: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            max_workers: max_workers.max(1),
        })
    }

    /// Enqueue an invalidation. Fails fast when the entry is malformed or
    /// the queue is full; the caller reports the failure to the admin
    /// client.
    pub fn add(&self, entry: InvalidationEntry) -> Result<(), InvalidationError> {
        if entry.host.is_empty() {
            return Err(InvalidationError::EmptyHost);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(InvalidationError::QueueFull)
            }
        }
    }

    /// Entries accepted but not yet applied.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Run the supervisor until shutdown, then drain the queue. Fails if
    /// called twice.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("invalidator already started"))?;
        let queue: Queue = Arc::new(tokio::sync::Mutex::new(rx));

        info!(max_workers = self.max_workers, "Invalidator started");
        self.spawn_worker(Arc::clone(&queue));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SUPERVISOR_TICK) => {
                    if self.pending() > 0 && self.active_workers() < self.max_workers {
                        self.spawn_worker(Arc::clone(&queue));
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain: wait until every accepted entry has been applied.
        while self.pending() > 0 {
            if self.active_workers() < self.max_workers {
                self.spawn_worker(Arc::clone(&queue));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!("Invalidator drained and stopped");
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, queue: Queue) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        let inv = Arc::clone(self);
        let id = inv.active_workers();
        debug!(worker = id, "Invalidation worker started");

        tokio::spawn(async move {
            let mut scratch = Entry::default();
            let mut encode_buf = Vec::new();

            loop {
                let received = {
                    let mut rx = queue.lock().await;
                    tokio::time::timeout(WORKER_IDLE_TIMEOUT, rx.recv()).await
                };

                match received {
                    Ok(Some(entry)) => {
                        debug!(host = %entry.host, path = %entry.path, "Applying invalidation");
                        inv.apply(&entry, &mut scratch, &mut encode_buf);
                        inv.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    Ok(None) => {
                        // Channel closed: nothing more will arrive.
                        inv.active_workers.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                    Err(_) => {
                        // Idle. Retire unless this is the last worker.
                        if inv.active_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                            inv.active_workers.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        debug!("Invalidation worker retired after idle timeout");
                        return;
                    }
                }
            }
        });
    }

    fn apply(&self, entry: &InvalidationEntry, scratch: &mut Entry, encode_buf: &mut Vec<u8>) {
        if entry.host == WILDCARD_HOST {
            let mut hosts = Vec::new();
            self.cache.iter(|host, _| {
                hosts.push(host.to_vec());
                true
            });
            for host in hosts {
                self.apply_to_host(&host, entry, scratch, encode_buf);
            }
        } else {
            self.apply_to_host(entry.host.as_bytes(), entry, scratch, encode_buf);
        }
    }

    fn apply_to_host(
        &self,
        host: &[u8],
        entry: &InvalidationEntry,
        scratch: &mut Entry,
        encode_buf: &mut Vec<u8>,
    ) {
        let path = entry.path.as_bytes();
        let header_key = entry.header.key.as_bytes();
        let header_value = entry.header.value.as_bytes();

        if path.is_empty() && header_key.is_empty() {
            self.cache.del(host);
            return;
        }

        if let Err(e) = self.cache.get_bytes(host, scratch) {
            warn!(
                cache_key = %String::from_utf8_lossy(host),
                error = %e,
                "Could not load entry for invalidation"
            );
            return;
        }
        if scratch.is_empty() {
            return;
        }

        let removed = if header_key.is_empty() {
            scratch.remove_if(|r| r.path == path)
        } else {
            scratch.remove_if(|r| {
                if !path.is_empty() && r.path != path {
                    return false;
                }
                match r.header(header_key) {
                    Some(value) => header_value.is_empty() || value == header_value,
                    None => false,
                }
            })
        };
        if removed == 0 {
            return;
        }

        if scratch.is_empty() {
            self.cache.del(host);
        } else {
            scratch.encode(encode_buf);
            if let Err(e) = self.cache.set(host, encode_buf) {
                warn!(
                    cache_key = %String::from_utf8_lossy(host),
                    error = %e,
                    "Could not store rewritten entry after invalidation"
                );
            }
        }
    }
}
