//! Pooled per-request scratch
//!
//! Every request borrows one [`ProxyTools`] bundle for its whole lifetime:
//! the rule binding container, a decodable entry buffer, the backend
//! client buffers and the entry encode buffer. Released bundles are reset
//! (lengths cleared, capacity kept) and parked for the next request, so
//! the hot path allocates nothing once the pool is warm.

use parking_lot::Mutex;

use crate::backend::{ClientRequest, ClientResponse};
use crate::entry::Entry;
use crate::rules::Params;

#[derive(Debug, Default)]
pub struct ProxyTools {
    pub params: Params,
    pub entry: Entry,
    pub req: ClientRequest,
    pub resp: ClientResponse,
    pub encode_buf: Vec<u8>,
}

impl ProxyTools {
    fn with_params_capacity(n: usize) -> ProxyTools {
        ProxyTools {
            params: Params::with_capacity(n),
            ..ProxyTools::default()
        }
    }

    pub fn reset(&mut self) {
        self.params.reset();
        self.entry.reset();
        self.req.reset();
        self.resp.reset();
        self.encode_buf.clear();
    }
}

/// Unbounded pool of scratch bundles. Grows under contention; bundles are
/// reset on release.
pub struct ToolPool {
    idle: Mutex<Vec<Box<ProxyTools>>>,
    params_capacity: usize,
}

impl ToolPool {
    /// `params_capacity` sizes each bundle's binding container to the
    /// longest configured rule.
    pub fn new(params_capacity: usize) -> ToolPool {
        ToolPool {
            idle: Mutex::new(Vec::new()),
            params_capacity,
        }
    }

    pub fn acquire(&self) -> Box<ProxyTools> {
        self.idle
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(ProxyTools::with_params_capacity(self.params_capacity)))
    }

    pub fn release(&self, mut tools: Box<ProxyTools>) {
        tools.reset();
        self.idle.lock().push(tools);
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}
