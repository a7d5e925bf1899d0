//! `gradflow-core`: tensor partitioning and pipeline scheduling for
//! parameter-server gradient synchronization.
//!
//! This crate is the **coordination layer**. It splits each named tensor
//! into bounded partitions, gives every partition a parameter-server key,
//! and moves one task per partition through a fixed set of stage queues
//! drained by dedicated worker threads. Reductions, GPU copies and the
//! parameter-server wire protocol sit behind the [`Communicator`],
//! [`PsClient`] and [`DeviceRuntime`] traits.
//!
//! # Architecture
//!
//! ```text
//!  enqueue_tensor
//!        │  one entry per partition
//!        ▼
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ copy_d2h │──▶│   push   │──▶│   pull   │──▶│ copy_h2d │──▶ callback
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘
//!   worker 0       worker 1       worker 2       worker 3
//!                      │              ▲
//!                      ▼              │
//!              KeyEncoder ──▶ PsClient (server key ranges)
//! ```

pub mod comm;
pub mod coordinator;
pub mod device;
pub mod encoder;
pub mod entry;
pub mod error;
pub mod ps;
pub mod queue;
pub mod registry;
pub mod snapshot;
pub mod worker;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use comm::{Communicator, LocalCommunicator};
pub use coordinator::{Collaborators, EnqueueRequest, GlobalCoordinator, LifecycleState};
pub use device::{DeviceRuntime, HostRuntime, PinnedBuffer, StreamHandle};
pub use encoder::{server_for_key, KeyEncoder};
pub use entry::{StatusCallback, TensorBuffer, TensorTableEntry};
pub use error::{CoordinatorError, Result};
pub use ps::{LoopbackPsClient, PsClient};
pub use queue::{QueueType, ScheduledQueue};
pub use registry::{partition_plan, TensorContext, TensorRegistry};
pub use snapshot::{QueueSnapshot, RegistrySnapshot, TensorSnapshot};
pub use worker::{push_pull_loops, run_stage_loop, stage_loop, LoopFunction, PUSH_PULL_STAGES};
