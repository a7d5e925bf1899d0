//! The unit of work flowing through the pipeline.
//!
//! A [`TensorTableEntry`] covers one partition of one tensor. It is moved
//! by value from queue to queue, so exactly one stage holds it at a time.
//! All partitions of a tensor share one [`Completion`] record that fires
//! the caller's callback once the last partition leaves the pipeline.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gradflow_types::{DataType, Device, PsKey};
use parking_lot::Mutex;

use crate::device::PinnedBuffer;
use crate::error::Result;
use crate::queue::QueueType;

/// Invoked once per synchronization call, after every partition finished
/// (or with the first error a stage reported).
pub type StatusCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

// ── Tensor buffer ────────────────────────────────────────────────────────────

/// Source (and destination) memory of a tensor being synchronized.
///
/// Reduce/broadcast happen in place, so the same buffer is read by the first
/// stage and written by the last.
#[derive(Clone)]
pub struct TensorBuffer(Arc<Mutex<Vec<u8>>>);

impl TensorBuffer {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }

    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.0.lock()[offset..offset + len].to_vec()
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.0.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBuffer").field("len", &self.len()).finish()
    }
}

// ── Completion ───────────────────────────────────────────────────────────────

/// Shared by every partition of one enqueued tensor.
pub(crate) struct Completion {
    remaining: AtomicUsize,
    callback: Mutex<Option<StatusCallback>>,
}

impl Completion {
    pub(crate) fn new(parts: usize, callback: Option<StatusCallback>) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(parts),
            callback: Mutex::new(callback),
        })
    }

    /// Count one partition as done. Returns `true` for the last one.
    pub(crate) fn finish_one(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Run the callback if it has not run yet.
    pub(crate) fn fire(&self, status: Result<()>) {
        let callback = self.callback.lock().take();
        if let Some(cb) = callback {
            cb(status);
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

pub struct TensorTableEntry {
    pub tensor_name: String,
    /// Position of this partition within its tensor.
    pub partition_index: usize,
    /// Parameter-server key assigned to this partition at registration.
    pub key: PsKey,
    pub device: Device,
    pub dtype: DataType,
    /// Byte offset of this partition within the tensor.
    pub offset: usize,
    /// Byte length of this partition.
    pub len: usize,
    pub tensor: Option<TensorBuffer>,
    /// The tensor's pinned staging buffer; GPU tensors only.
    pub staging: Option<PinnedBuffer>,
    /// Current stage at the front, followed by the stages still to run.
    pub(crate) stages: VecDeque<QueueType>,
    pub(crate) completion: Arc<Completion>,
}

impl TensorTableEntry {
    /// A host-resident entry with no buffers and no callback, to be routed
    /// through `stages`.
    pub fn new(
        tensor_name: impl Into<String>,
        partition_index: usize,
        key: PsKey,
        len: usize,
        stages: &[QueueType],
    ) -> Self {
        Self {
            tensor_name: tensor_name.into(),
            partition_index,
            key,
            device: Device::Cpu,
            dtype: DataType::Uint8,
            offset: 0,
            len,
            tensor: None,
            staging: None,
            stages: stages.iter().copied().collect(),
            completion: Completion::new(1, None),
        }
    }

    /// The stage currently holding this entry.
    pub fn current_stage(&self) -> Option<QueueType> {
        self.stages.front().copied()
    }

    /// Stages still to run after the current one.
    pub fn remaining_stages(&self) -> impl Iterator<Item = QueueType> + '_ {
        self.stages.iter().skip(1).copied()
    }

    /// Bytes of this partition read from wherever the host copy lives:
    /// the staging buffer for GPU tensors, the tensor itself otherwise.
    pub fn host_bytes(&self) -> Option<Vec<u8>> {
        match (&self.staging, &self.tensor) {
            (Some(staging), _) => Some(staging.read_at(self.offset, self.len)),
            (None, Some(tensor)) => Some(tensor.read_at(self.offset, self.len)),
            (None, None) => None,
        }
    }

    /// Write this partition's bytes into its host copy.
    pub fn write_host_bytes(&self, data: &[u8]) {
        match (&self.staging, &self.tensor) {
            (Some(staging), _) => staging.write_at(self.offset, data),
            (None, Some(tensor)) => tensor.write_at(self.offset, data),
            (None, None) => {}
        }
    }
}

impl fmt::Debug for TensorTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorTableEntry")
            .field("tensor_name", &self.tensor_name)
            .field("partition_index", &self.partition_index)
            .field("key", &self.key)
            .field("device", &self.device)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("stages", &self.stages)
            .field("pending_parts", &self.completion.remaining())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_fires_once_on_last_part() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let c = Completion::new(
            2,
            Some(Box::new(move |status: Result<()>| {
                assert!(status.is_ok());
                f.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(!c.finish_one());
        assert!(c.finish_one());
        c.fire(Ok(()));
        c.fire(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn host_bytes_prefers_staging() {
        let tensor = TensorBuffer::from_vec(vec![1, 2, 3, 4]);
        let staging = PinnedBuffer::new(1, 4);
        staging.write_at(0, &[9, 9, 9, 9]);

        let mut entry = TensorTableEntry::new("t", 0, 0, 2, &[QueueType::Push]);
        entry.offset = 2;
        entry.tensor = Some(tensor.clone());
        assert_eq!(entry.host_bytes(), Some(vec![3, 4]));

        entry.staging = Some(staging);
        assert_eq!(entry.host_bytes(), Some(vec![9, 9]));

        entry.write_host_bytes(&[7, 7]);
        assert_eq!(entry.host_bytes(), Some(vec![7, 7]));
        // tensor untouched while a staging buffer exists
        assert_eq!(tensor.to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn stage_cursor() {
        let entry = TensorTableEntry::new("t", 0, 0, 1, &[QueueType::Push, QueueType::Pull]);
        assert_eq!(entry.current_stage(), Some(QueueType::Push));
        assert_eq!(entry.remaining_stages().collect::<Vec<_>>(), vec![QueueType::Pull]);

        let empty = TensorTableEntry::new("t", 0, 0, 1, &[]);
        assert!(empty.current_stage().is_none());
    }
}
