use serde::{Deserialize, Serialize};

/// This process's position in the training cluster, as resolved by the
/// communicator during `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInfo {
    pub rank: usize,
    pub size: usize,
    pub local_rank: usize,
    pub local_size: usize,
}

impl RankInfo {
    /// A lone process: rank 0 of 1.
    pub fn single() -> Self {
        Self {
            rank: 0,
            size: 1,
            local_rank: 0,
            local_size: 1,
        }
    }

    /// True if this process is the first on its host.
    pub fn is_local_root(&self) -> bool {
        self.local_rank == 0
    }
}

impl Default for RankInfo {
    fn default() -> Self {
        Self::single()
    }
}
