// Configuration structs for the coordinator and its in-process collaborators.
//
// Every environment variable is read through a lookup closure so callers
// (and tests) can substitute their own source.

use std::time::Duration;

use crate::dtype::DataType;
use crate::error::{GradflowError, Result};
use crate::rank::RankInfo;

// ── Environment variables ────────────────────────────────────────────────────

pub const PARTITION_BOUND_ENV: &str = "GRADFLOW_PARTITION_BOUND";
pub const WORKER_ID_ENV: &str = "GRADFLOW_WORKER_ID";
pub const NUM_WORKER_ENV: &str = "GRADFLOW_NUM_WORKER";
pub const LOCAL_RANK_ENV: &str = "GRADFLOW_LOCAL_RANK";
pub const LOCAL_SIZE_ENV: &str = "GRADFLOW_LOCAL_SIZE";
pub const NUM_SERVER_ENV: &str = "GRADFLOW_NUM_SERVER";
pub const IS_RECOVERY_ENV: &str = "GRADFLOW_IS_RECOVERY";

/// Default partition bound, in elements.
pub const DEFAULT_PARTITION_BOUND: usize = 512_000;

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn lookup_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: usize,
) -> Result<usize> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| GradflowError::InvalidEnv { var, value: raw }),
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum partition size in elements. Converted to bytes with the
    /// element width of the first tensor ever registered.
    /// Default: 512000.
    pub partition_bound: usize,

    /// Whether `init` honors `GRADFLOW_PARTITION_BOUND`.
    pub read_env: bool,

    /// How long a blocked worker waits on its queue before re-checking the
    /// shutdown flag.
    pub poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            partition_bound: DEFAULT_PARTITION_BOUND,
            read_env: true,
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl CoordinatorConfig {
    /// Parse a partition-bound override. Zero is rejected: it would never
    /// make progress through a tensor. So is any bound whose byte size
    /// would overflow for the widest dtype.
    pub fn parse_partition_bound(raw: &str) -> Result<usize> {
        match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 && n.checked_mul(DataType::MAX_ELEMENT_BYTES).is_some() => Ok(n),
            _ => Err(GradflowError::InvalidEnv {
                var: PARTITION_BOUND_ENV,
                value: raw.to_string(),
            }),
        }
    }

    /// The override from the process environment, if one is set.
    pub fn partition_bound_override(&self) -> Option<Result<usize>> {
        self.partition_bound_override_from(process_env)
    }

    pub fn partition_bound_override_from(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<Result<usize>> {
        if !self.read_env {
            return None;
        }
        lookup(PARTITION_BOUND_ENV).map(|raw| Self::parse_partition_bound(&raw))
    }
}

// ── Communicator ─────────────────────────────────────────────────────────────

/// Cluster placement for the in-process communicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommConfig {
    pub worker_id: usize,
    pub num_worker: usize,
    pub local_rank: usize,
    pub local_size: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            num_worker: 1,
            local_rank: 0,
            local_size: 1,
        }
    }
}

impl CommConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let cfg = Self {
            worker_id: lookup_usize(&lookup, WORKER_ID_ENV, 0)?,
            num_worker: lookup_usize(&lookup, NUM_WORKER_ENV, 1)?,
            local_rank: lookup_usize(&lookup, LOCAL_RANK_ENV, 0)?,
            local_size: lookup_usize(&lookup, LOCAL_SIZE_ENV, 1)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_size == 0 || self.num_worker == 0 {
            return Err(GradflowError::Config(
                "local_size and num_worker must be > 0".into(),
            ));
        }
        if self.local_rank >= self.local_size {
            return Err(GradflowError::Config(format!(
                "local_rank {} must be < local_size {}",
                self.local_rank, self.local_size
            )));
        }
        if self.worker_id >= self.num_worker {
            return Err(GradflowError::Config(format!(
                "worker_id {} must be < num_worker {}",
                self.worker_id, self.num_worker
            )));
        }
        Ok(())
    }

    /// Global rank = `worker_id * local_size + local_rank`.
    pub fn rank_info(&self) -> RankInfo {
        RankInfo {
            rank: self.worker_id * self.local_size + self.local_rank,
            size: self.num_worker * self.local_size,
            local_rank: self.local_rank,
            local_size: self.local_size,
        }
    }
}

// ── Loopback parameter server ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Number of logical servers the key space is split across.
    pub num_servers: usize,
    /// Skip the startup barrier, as a restarted worker would.
    pub is_recovery: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            num_servers: 1,
            is_recovery: false,
        }
    }
}

impl LoopbackConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let num_servers = lookup_usize(&lookup, NUM_SERVER_ENV, 1)?;
        if num_servers == 0 {
            return Err(GradflowError::Config("num_servers must be > 0".into()));
        }
        let is_recovery = lookup(IS_RECOVERY_ENV)
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        Ok(Self { num_servers, is_recovery })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
