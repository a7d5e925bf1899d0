//! Partition key → server-addressable key.
//!
//! Each partition key is pinned to one server by a multiplicative hash and
//! offset into that server's key range. Encodings are cached; the first
//! encode of a key fixes its value size for the life of the process.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use gradflow_types::{KeyRange, PsKey, Pskv};
use parking_lot::Mutex;
use tracing::debug;

/// Spreads consecutive keys across servers. Prime, so it only degenerates
/// when the server count is a multiple of it.
pub const SERVER_HASH_MULTIPLIER: u64 = 9973;

/// Index of the server that owns `key`: `(key * 9973) mod num_servers`.
///
/// Panics if there are no servers or if `key * 9973` does not fit a `u64`.
pub fn server_for_key(key: PsKey, num_servers: usize) -> usize {
    assert!(num_servers > 0, "no parameter servers to encode against");
    match key.checked_mul(SERVER_HASH_MULTIPLIER) {
        Some(hashed) => (hashed % num_servers as u64) as usize,
        None => panic!("key {key} overflows the server hash"),
    }
}

type Slot = Arc<OnceLock<Arc<Pskv>>>;

#[derive(Default)]
pub struct KeyEncoder {
    cache: Mutex<HashMap<PsKey, Slot>>,
}

impl KeyEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `key` for a value of `len` bytes.
    ///
    /// The cache lock covers only the slot lookup; the server ranges are
    /// fetched and the slot filled outside it. Repeat encodes return the
    /// same `Arc`.
    ///
    /// Panics if `key` was encoded before with a different `len`, or if the
    /// computed server key falls outside the chosen server's range.
    pub fn encode_default_key(
        &self,
        key: PsKey,
        len: usize,
        server_ranges: impl FnOnce() -> Vec<KeyRange>,
    ) -> Arc<Pskv> {
        let slot = self.cache.lock().entry(key).or_default().clone();

        let mut fresh = false;
        let pskv = slot.get_or_init(|| {
            fresh = true;
            Arc::new(Self::assign(key, len, &server_ranges()))
        });

        if !fresh {
            assert_eq!(
                pskv.size, len,
                "key {key}: encoded with size {} before, now {len}",
                pskv.size
            );
        }
        pskv.clone()
    }

    fn assign(key: PsKey, len: usize, ranges: &[KeyRange]) -> Pskv {
        let server = server_for_key(key, ranges.len());
        let range = ranges[server];
        let ps_key = match range.begin.checked_add(key) {
            Some(k) if k < range.end => k,
            _ => panic!(
                "key {key}: server {server} range [{}, {}) cannot hold it",
                range.begin, range.end
            ),
        };
        debug!(key, server, ps_key, len, "key encoded");
        Pskv {
            keys: vec![ps_key],
            lens: vec![len],
            size: len,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
