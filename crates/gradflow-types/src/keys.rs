// Parameter-server key types.
//
// Consumed by the key encoder in `gradflow-core` and by every
// `PsClient` implementation.

use serde::{Deserialize, Serialize};

/// Integer address of one value slot in the parameter-server key space.
pub type PsKey = u64;

// ── Key Range ────────────────────────────────────────────────────────────────

/// Half-open key range `[begin, end)` owned by one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: PsKey,
    pub end: PsKey,
}

impl KeyRange {
    pub fn new(begin: PsKey, end: PsKey) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, key: PsKey) -> bool {
        key >= self.begin && key < self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Split `[0, u64::MAX)` into `num_servers` equal contiguous ranges.
    ///
    /// Server `i` owns `[MAX / n * i, MAX / n * (i + 1))`.
    pub fn split_even(num_servers: usize) -> Vec<KeyRange> {
        if num_servers == 0 {
            return Vec::new();
        }
        let step = PsKey::MAX / num_servers as u64;
        (0..num_servers as u64)
            .map(|i| KeyRange::new(step * i, step * (i + 1)))
            .collect()
    }
}

// ── PSKV ─────────────────────────────────────────────────────────────────────

/// Cached encoding of one partition key into server-addressable keys.
///
/// The coordinator always produces a single server key per partition;
/// `keys` and `lens` stay parallel vectors so a transport can send them as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pskv {
    pub keys: Vec<PsKey>,
    pub lens: Vec<usize>,
    /// Value size fixed by the first encode of this key.
    pub size: usize,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
