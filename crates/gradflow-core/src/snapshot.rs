// Point-in-time view of coordinator state for diagnostics.

use gradflow_types::{PsKey, RankInfo};
use serde::Serialize;

use crate::coordinator::LifecycleState;
use crate::queue::QueueType;

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub state: LifecycleState,
    pub rank: Option<RankInfo>,
    pub partition_bound_bytes: Option<usize>,
    pub tensors: Vec<TensorSnapshot>,
    pub queues: Vec<QueueSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TensorSnapshot {
    pub name: String,
    pub keys: Vec<PsKey>,
    pub part_lens: Vec<usize>,
    /// `None` for host-resident tensors.
    pub staging_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub stage: QueueType,
    pub pending: usize,
    pub finished: u64,
}
