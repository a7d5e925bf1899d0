//! GPU runtime seam: copy streams and pinned host staging memory.
//!
//! The coordinator allocates two non-blocking streams at `init` (reduce and
//! broadcast) and one pinned, device-mapped staging buffer per GPU-resident
//! tensor. Nothing is reference counted: streams and buffers live from
//! allocation until `shutdown` releases them.
//!
//! [`HostRuntime`] is the in-process implementation. Pinned memory is host
//! memory, so it is modelled as a plain byte region that worker stages can
//! read and write; streams are opaque ids.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CoordinatorError, Result};

// ── Handles ──────────────────────────────────────────────────────────────────

/// Opaque handle to a non-blocking device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Pinned, device-mapped host staging buffer.
///
/// Clones share the same memory. The owning tensor context keeps one clone
/// for the lifetime of the process; pipeline entries carry others.
#[derive(Debug, Clone)]
pub struct PinnedBuffer {
    id: u64,
    bytes: Arc<Mutex<Box<[u8]>>>,
}

impl PinnedBuffer {
    pub fn new(id: u64, len: usize) -> Self {
        Self {
            id,
            bytes: Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// Panics if the write would run past the end of the buffer.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes.lock()[offset..offset + len].to_vec()
    }
}

// ── Trait ────────────────────────────────────────────────────────────────────

/// Stream and pinned-memory primitives the coordinator needs from the GPU
/// runtime. Kernels and copies that run on the streams live elsewhere.
pub trait DeviceRuntime: Send + Sync {
    /// Create a non-blocking stream.
    fn create_stream(&self) -> Result<StreamHandle>;

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Allocate `len` bytes of pinned, device-mapped host memory.
    fn alloc_pinned(&self, len: usize) -> Result<PinnedBuffer>;

    fn free_pinned(&self, buffer: &PinnedBuffer) -> Result<()>;
}

// ── Host runtime ─────────────────────────────────────────────────────────────

/// Resource counters reported by [`HostRuntime::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub streams_created: usize,
    pub streams_destroyed: usize,
    pub buffers_allocated: usize,
    pub buffers_freed: usize,
    pub pinned_bytes: usize,
}

/// In-process [`DeviceRuntime`] backed by host memory.
///
/// Tracks live handles so a double destroy or double free is reported as an
/// error instead of silently succeeding.
#[derive(Default)]
pub struct HostRuntime {
    next_id: AtomicU64,
    live_streams: Mutex<HashSet<u64>>,
    live_buffers: Mutex<HashSet<u64>>,
    streams_created: AtomicUsize,
    streams_destroyed: AtomicUsize,
    buffers_allocated: AtomicUsize,
    buffers_freed: AtomicUsize,
    pinned_bytes: AtomicUsize,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            streams_created: self.streams_created.load(Ordering::Acquire),
            streams_destroyed: self.streams_destroyed.load(Ordering::Acquire),
            buffers_allocated: self.buffers_allocated.load(Ordering::Acquire),
            buffers_freed: self.buffers_freed.load(Ordering::Acquire),
            pinned_bytes: self.pinned_bytes.load(Ordering::Acquire),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.lock().len()
    }

    pub fn live_streams(&self) -> usize {
        self.live_streams.lock().len()
    }
}

impl DeviceRuntime for HostRuntime {
    fn create_stream(&self) -> Result<StreamHandle> {
        let id = self.next_id();
        self.live_streams.lock().insert(id);
        self.streams_created.fetch_add(1, Ordering::AcqRel);
        debug!(stream = id, "stream created");
        Ok(StreamHandle(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        if !self.live_streams.lock().remove(&stream.0) {
            return Err(CoordinatorError::Device(format!(
                "stream {} is not live",
                stream.0
            )));
        }
        self.streams_destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn alloc_pinned(&self, len: usize) -> Result<PinnedBuffer> {
        let id = self.next_id();
        self.live_buffers.lock().insert(id);
        self.buffers_allocated.fetch_add(1, Ordering::AcqRel);
        self.pinned_bytes.fetch_add(len, Ordering::AcqRel);
        Ok(PinnedBuffer::new(id, len))
    }

    fn free_pinned(&self, buffer: &PinnedBuffer) -> Result<()> {
        if !self.live_buffers.lock().remove(&buffer.id()) {
            return Err(CoordinatorError::Device(format!(
                "pinned buffer {} is not live",
                buffer.id()
            )));
        }
        self.buffers_freed.fetch_add(1, Ordering::AcqRel);
        self.pinned_bytes.fetch_sub(buffer.len(), Ordering::AcqRel);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
