//! Cached entry types and their binary codec
//!
//! A host's cache value is an [`Entry`]: an ordered collection of
//! [`CachedResponse`] records, at most one per path. Entries are serialized
//! to a single self-delimited blob so the byte-map below needs no per-field
//! awareness.
//!
//! Blob layout (all integers little-endian `u32` unless noted):
//!
//! ```text
//! version:u8 | response_count |
//!   ( path_len | path | body_len | body |
//!     header_count | ( key_len | key | value_len | value )* )*
//! ```
//!
//! Blobs carrying an unknown version byte are rejected. Entries and
//! responses reset to zero length without releasing capacity, so pooled
//! reuse stays allocation-free once warm.

use std::fmt;

use bytes::{Buf, BufMut};

/// Version byte stamped at offset 0 of every encoded blob.
pub const SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    UnknownVersion(u8),
    Truncated,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownVersion(v) => write!(f, "unknown entry schema version {}", v),
            CodecError::Truncated => write!(f, "truncated entry blob"),
        }
    }
}

impl std::error::Error for CodecError {}

/// One cached header pair. Keys are stored in the canonical (lowercase)
/// form the HTTP layer produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// One cached (path, body, headers) record.
///
/// Removed or reset responses keep their buffers; live headers are the
/// first `header_len` slots of the backing vector.
#[derive(Debug, Default)]
pub struct CachedResponse {
    pub path: Vec<u8>,
    pub body: Vec<u8>,
    headers: Vec<Header>,
    header_len: usize,
}

impl CachedResponse {
    pub fn reset(&mut self) {
        self.path.clear();
        self.body.clear();
        self.header_len = 0;
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers[..self.header_len]
    }

    /// Append a header pair, reusing a spare slot when one is available.
    pub fn add_header(&mut self, key: &[u8], value: &[u8]) {
        if self.header_len < self.headers.len() {
            let h = &mut self.headers[self.header_len];
            h.key.clear();
            h.key.extend_from_slice(key);
            h.value.clear();
            h.value.extend_from_slice(value);
        } else {
            self.headers.push(Header {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        self.header_len += 1;
    }

    /// First value of `key`, matched case-insensitively.
    pub fn header(&self, key: &[u8]) -> Option<&[u8]> {
        self.headers()
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case(key))
            .map(|h| h.value.as_slice())
    }
}

impl PartialEq for CachedResponse {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.body == other.body && self.headers() == other.headers()
    }
}

/// The cache value for one host: an ordered collection of responses with
/// at most one record per path.
///
/// Removed or reset responses stay behind the live length as spare slots.
#[derive(Debug, Default)]
pub struct Entry {
    responses: Vec<CachedResponse>,
    len: usize,
}

impl Entry {
    pub fn reset(&mut self) {
        self.len = 0;
    }

    pub fn responses(&self) -> &[CachedResponse] {
        &self.responses[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get_response(&self, path: &[u8]) -> Option<&CachedResponse> {
        self.responses().iter().find(|r| r.path == path)
    }

    /// Slot for a response under `path`. Replaces the existing record with
    /// that path, otherwise appends. The returned response has its path set
    /// and everything else cleared.
    pub fn set_response(&mut self, path: &[u8]) -> &mut CachedResponse {
        let idx = match (0..self.len).find(|&i| self.responses[i].path == path) {
            Some(i) => i,
            None => {
                let i = self.next_slot();
                self.len += 1;
                i
            }
        };
        let r = &mut self.responses[idx];
        r.reset();
        r.path.extend_from_slice(path);
        r
    }

    fn next_slot(&mut self) -> usize {
        if self.len == self.responses.len() {
            self.responses.push(CachedResponse::default());
        }
        self.len
    }

    /// Remove every live response matching `pred`, preserving order.
    /// Returns the number removed.
    pub fn remove_if<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&CachedResponse) -> bool,
    {
        let mut removed = 0;
        let mut i = 0;
        while i < self.len {
            if pred(&self.responses[i]) {
                // Rotate the removed record past the live region so its
                // buffers stay available as a spare slot.
                self.responses[i..self.len].rotate_left(1);
                self.len -= 1;
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Serialize into `buf`, replacing its contents.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.put_u8(SCHEMA_VERSION);
        buf.put_u32_le(self.len as u32);
        for r in self.responses() {
            put_chunk(buf, &r.path);
            put_chunk(buf, &r.body);
            buf.put_u32_le(r.headers().len() as u32);
            for h in r.headers() {
                put_chunk(buf, &h.key);
                put_chunk(buf, &h.value);
            }
        }
    }

    /// Deserialize `blob` into this entry, replacing its contents.
    pub fn decode(&mut self, mut blob: &[u8]) -> Result<(), CodecError> {
        self.reset();

        if blob.remaining() < 1 {
            return Err(CodecError::Truncated);
        }
        let version = blob.get_u8();
        if version != SCHEMA_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }

        let count = get_u32(&mut blob)?;
        for _ in 0..count {
            let idx = self.next_slot();
            self.len += 1;
            let r = &mut self.responses[idx];
            r.reset();

            get_chunk(&mut blob, &mut r.path)?;
            get_chunk(&mut blob, &mut r.body)?;

            let header_count = get_u32(&mut blob)?;
            for _ in 0..header_count {
                let key_len = get_u32(&mut blob)? as usize;
                let key = take(&mut blob, key_len)?;
                let value_len = get_u32(&mut blob)? as usize;
                let value = take(&mut blob, value_len)?;
                self.responses[idx].add_header(key, value);
            }
        }
        Ok(())
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.responses() == other.responses()
    }
}

fn put_chunk(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn get_u32(blob: &mut &[u8]) -> Result<u32, CodecError> {
    if blob.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(blob.get_u32_le())
}

fn take<'a>(blob: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if blob.remaining() < n {
        return Err(CodecError::Truncated);
    }
    let (head, tail) = blob.split_at(n);
    *blob = tail;
    Ok(head)
}

fn get_chunk(blob: &mut &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
    let n = get_u32(blob)? as usize;
    let data = take(blob, n)?;
    out.clear();
    out.extend_from_slice(data);
    Ok(())
}
