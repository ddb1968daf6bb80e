//! Cachegate - a forward-caching HTTP reverse proxy
//!
//! This library provides a caching reverse proxy that:
//! - Serves repeated requests from an in-memory, per-host cache
//! - Forwards cache misses to configured backends, round-robin
//! - Decides cache admission with compiled no-cache rules
//! - Mutates response headers through rule-gated set/unset actions
//! - Accepts asynchronous invalidation requests over an admin API
//! - Reuses per-request scratch buffers through an object pool

pub mod admin;
pub mod backend;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod expr;
pub mod invalidator;
pub mod proxy;
pub mod rules;
pub mod tools;
