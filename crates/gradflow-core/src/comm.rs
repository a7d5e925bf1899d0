//! Rank discovery and barrier.
//!
//! The coordinator calls [`Communicator::init`] exactly once during its own
//! `init`. [`LocalCommunicator`] resolves placement from a [`CommConfig`]
//! and synchronizes an in-process group of workers with a shared barrier.

use std::sync::{Arc, Barrier};

use gradflow_types::config::CommConfig;
use gradflow_types::RankInfo;
use tracing::debug;

use crate::error::Result;

pub trait Communicator: Send + Sync {
    /// Resolve this process's rank, size, local rank and local size.
    fn init(&self) -> Result<RankInfo>;

    /// Block until every member of the group has reached the barrier.
    fn barrier(&self) -> Result<()>;
}

/// In-process communicator.
pub struct LocalCommunicator {
    config: CommConfig,
    barrier: Arc<Barrier>,
}

impl LocalCommunicator {
    /// A communicator whose barrier only waits for itself.
    pub fn new(config: CommConfig) -> Self {
        Self {
            config,
            barrier: Arc::new(Barrier::new(1)),
        }
    }

    /// Build `num_worker` communicators (one per simulated worker, one GPU
    /// each) that share a single barrier.
    pub fn group(num_worker: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(num_worker));
        (0..num_worker)
            .map(|worker_id| Self {
                config: CommConfig {
                    worker_id,
                    num_worker,
                    local_rank: 0,
                    local_size: 1,
                },
                barrier: barrier.clone(),
            })
            .collect()
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }
}

impl Communicator for LocalCommunicator {
    fn init(&self) -> Result<RankInfo> {
        self.config.validate()?;
        let info = self.config.rank_info();
        debug!(
            rank = info.rank,
            size = info.size,
            local_rank = info.local_rank,
            local_size = info.local_size,
            "communicator resolved placement"
        );
        Ok(info)
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
