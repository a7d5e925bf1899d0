//! Per-stage task queues.
//!
//! One [`ScheduledQueue`] exists per [`QueueType`]. Every operation
//! serializes under the queue's own mutex; there is no ordering across
//! queues. Entries are moved in and out by value, so a queue is the sole
//! owner of whatever it currently holds.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::trace;

use crate::entry::TensorTableEntry;

// ── Stages ───────────────────────────────────────────────────────────────────

/// Pipeline stage slots, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Reduce,
    CopyD2H,
    Push,
    Pull,
    CopyH2D,
    Broadcast,
}

impl QueueType {
    pub const COUNT: usize = 6;

    pub const ALL: [QueueType; Self::COUNT] = [
        QueueType::Reduce,
        QueueType::CopyD2H,
        QueueType::Push,
        QueueType::Pull,
        QueueType::CopyH2D,
        QueueType::Broadcast,
    ];

    /// Slot index in the coordinator's queue array.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueType::Reduce => "reduce",
            QueueType::CopyD2H => "copy_d2h",
            QueueType::Push => "push",
            QueueType::Pull => "pull",
            QueueType::CopyH2D => "copy_h2d",
            QueueType::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Queue ────────────────────────────────────────────────────────────────────

pub struct ScheduledQueue {
    queue_type: QueueType,
    sq: Mutex<VecDeque<TensorTableEntry>>,
    ready: Condvar,
    finished: AtomicU64,
}

impl ScheduledQueue {
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            sq: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            finished: AtomicU64::new(0),
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Append to the tail and wake one waiting consumer.
    pub fn add_task(&self, entry: TensorTableEntry) {
        trace!(
            stage = %self.queue_type,
            tensor = %entry.tensor_name,
            partition = entry.partition_index,
            "task added"
        );
        self.sq.lock().push_back(entry);
        self.ready.notify_one();
    }

    /// Remove and return the head.
    ///
    /// The queue must be non-empty; callers establish that through
    /// [`pending_size`](Self::pending_size) or their own bookkeeping.
    /// Use [`wait_task`](Self::wait_task) to block instead.
    pub fn get_task(&self) -> TensorTableEntry {
        match self.sq.lock().pop_front() {
            Some(entry) => entry,
            None => panic!("get_task on empty {} queue", self.queue_type),
        }
    }

    /// Inspect the head without removing it. Same precondition as
    /// [`get_task`](Self::get_task).
    pub fn peek_task<R>(&self, f: impl FnOnce(&TensorTableEntry) -> R) -> R {
        let sq = self.sq.lock();
        match sq.front() {
            Some(entry) => f(entry),
            None => panic!("peek_task on empty {} queue", self.queue_type),
        }
    }

    /// Current length. Stale as soon as it returns if producers are active.
    pub fn pending_size(&self) -> usize {
        self.sq.lock().len()
    }

    /// Block up to `timeout` for a task. `None` on timeout or after
    /// [`wake_all`](Self::wake_all) with nothing queued.
    pub fn wait_task(&self, timeout: Duration) -> Option<TensorTableEntry> {
        let mut sq = self.sq.lock();
        if sq.is_empty() {
            self.ready.wait_for(&mut sq, timeout);
        }
        sq.pop_front()
    }

    /// Release every consumer blocked in [`wait_task`](Self::wait_task).
    pub fn wake_all(&self) {
        let _sq = self.sq.lock();
        self.ready.notify_all();
    }

    /// Record that `entry` finished this stage.
    // TODO: return flow-control credit sized by `entry.len` once producers
    // gate `add_task` on available credit.
    pub fn report_finish(&self, entry: &TensorTableEntry) {
        let total = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(
            stage = %self.queue_type,
            tensor = %entry.tensor_name,
            partition = entry.partition_index,
            finished = total,
            "task finished"
        );
    }

    /// Entries reported finished over the queue's lifetime.
    pub fn finished_count(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ScheduledQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledQueue")
            .field("queue_type", &self.queue_type)
            .field("pending", &self.pending_size())
            .field("finished", &self.finished_count())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
