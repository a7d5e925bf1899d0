//! The process-wide coordinator.
//!
//! One [`GlobalCoordinator`] is constructed explicitly and shared by `Arc`
//! with call sites and worker threads. Its lifecycle is one-way:
//!
//! ```text
//! Uninitialized ──init──▶ Initialized ──shutdown──▶ ShuttingDown ──▶ Shutdown
//!       │                                                ▲
//!       └──init fails──▶ Failed ──────shutdown───────────┘
//! ```
//!
//! A failed `init` is not retried; `Failed` only leads to `shutdown`.
//!
//! `init` runs start to finish under the state lock, so concurrent callers
//! all observe a single setup. The registry, the key encoder and each
//! queue keep their own locks.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use gradflow_types::config::CoordinatorConfig;
use gradflow_types::{DataType, Device, PsKey, Pskv, RankInfo};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::comm::Communicator;
use crate::device::{DeviceRuntime, StreamHandle};
use crate::encoder::KeyEncoder;
use crate::entry::{Completion, StatusCallback, TensorBuffer, TensorTableEntry};
use crate::error::{CoordinatorError, Result};
use crate::ps::PsClient;
use crate::queue::{QueueType, ScheduledQueue};
use crate::registry::{TensorContext, TensorRegistry};
use crate::snapshot::{QueueSnapshot, RegistrySnapshot};
use crate::worker::LoopFunction;

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    ShuttingDown,
    Shutdown,
    /// `init` returned an error. Only `shutdown` is accepted from here.
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Shutdown => "shutdown",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// External services the coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub comm: Arc<dyn Communicator>,
    pub ps: Arc<dyn PsClient>,
    pub device: Arc<dyn DeviceRuntime>,
}

/// A tensor to push through the pipeline.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub name: String,
    pub device: Device,
    pub dtype: DataType,
    pub tensor: TensorBuffer,
    /// Stages each partition visits, in order. Empty completes at once.
    pub stages: Vec<QueueType>,
}

#[derive(Debug, Clone, Copy)]
struct StreamPair {
    reduce: StreamHandle,
    broadcast: StreamHandle,
}

// ── Coordinator ──────────────────────────────────────────────────────────────

pub struct GlobalCoordinator {
    config: CoordinatorConfig,
    comm: Arc<dyn Communicator>,
    ps: Arc<dyn PsClient>,
    device: Arc<dyn DeviceRuntime>,

    state: Mutex<LifecycleState>,
    /// Mirrors `state == Initialized` for lock-free `check_init`.
    initialized: AtomicBool,
    should_shutdown: AtomicBool,
    rank: OnceLock<RankInfo>,

    queues: [OnceLock<ScheduledQueue>; QueueType::COUNT],
    threads: Mutex<Vec<JoinHandle<()>>>,
    streams: Mutex<Option<StreamPair>>,

    registry: TensorRegistry,
    encoder: KeyEncoder,
    /// `(tensor, partition)` pairs currently somewhere in the pipeline.
    in_flight: Mutex<HashSet<(String, usize)>>,
}

impl GlobalCoordinator {
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> Arc<Self> {
        let registry = TensorRegistry::new(config.partition_bound);
        Arc::new(Self {
            config,
            comm: collaborators.comm,
            ps: collaborators.ps,
            device: collaborators.device,
            state: Mutex::new(LifecycleState::Uninitialized),
            initialized: AtomicBool::new(false),
            should_shutdown: AtomicBool::new(false),
            rank: OnceLock::new(),
            queues: std::array::from_fn(|_| OnceLock::new()),
            threads: Mutex::new(Vec::new()),
            streams: Mutex::new(None),
            registry,
            encoder: KeyEncoder::new(),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Bring up rank discovery, the parameter-server client, both streams
    /// and every stage queue.
    ///
    /// Returns immediately if already initialized. A failing step moves the
    /// coordinator to [`LifecycleState::Failed`] and every later `init`
    /// returns [`CoordinatorError::InitFailed`]. Streams created before the
    /// failure are destroyed here; the rest is released by `shutdown`.
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Initialized => return Ok(()),
            LifecycleState::Failed => return Err(CoordinatorError::InitFailed),
            LifecycleState::ShuttingDown | LifecycleState::Shutdown => {
                return Err(CoordinatorError::ShutDown)
            }
            LifecycleState::Uninitialized => {}
        }

        let (rank, bound) = match self.bring_up() {
            Ok(up) => up,
            Err(e) => {
                *state = LifecycleState::Failed;
                warn!(error = %e, "gradflow init failed");
                return Err(e);
            }
        };

        let _ = self.rank.set(rank);
        *state = LifecycleState::Initialized;
        self.initialized.store(true, Ordering::Release);

        info!(
            rank = rank.rank,
            size = rank.size,
            local_rank = rank.local_rank,
            local_size = rank.local_size,
            partition_bound = bound,
            "gradflow initialized"
        );
        Ok(())
    }

    /// The fallible part of `init`. Runs under the state lock.
    fn bring_up(&self) -> Result<(RankInfo, usize)> {
        let rank = self.comm.init()?;

        let mut bound = self.config.partition_bound;
        match self.config.partition_bound_override() {
            Some(Ok(elements)) => bound = elements,
            Some(Err(e)) => warn!(error = %e, bound, "ignoring partition bound override"),
            None => {}
        }
        self.registry.set_partition_bound(bound);

        self.ps.start_async()?;
        if self.ps.is_recovery() {
            info!("recovering worker, skipping startup barrier");
        } else {
            self.ps.barrier()?;
        }

        let reduce = self.device.create_stream()?;
        let broadcast = match self.device.create_stream() {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(destroy) = self.device.destroy_stream(reduce) {
                    warn!(error = %destroy, "failed to destroy reduce stream");
                }
                return Err(e);
            }
        };
        *self.streams.lock() = Some(StreamPair { reduce, broadcast });

        for stage in QueueType::ALL {
            self.create_scheduled_queue(stage);
        }
        Ok((rank, bound))
    }

    /// `Ok` once `init` has completed and until `shutdown` begins.
    pub fn check_init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoordinatorError::NotInitialized)
        }
    }

    /// Spawn one thread per loop function.
    ///
    /// Each call adds threads; calling twice runs two loops per stage.
    pub fn start(self: &Arc<Self>, loops: Vec<LoopFunction>) -> Result<()> {
        self.check_init()?;

        let mut threads = self.threads.lock();
        for body in loops {
            let index = threads.len();
            let coord = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("gradflow-worker-{index}"))
                .spawn(move || body(coord))?;
            debug!(worker = index, "worker thread started");
            threads.push(handle);
        }
        info!(workers = threads.len(), "worker threads running");
        Ok(())
    }

    /// Stop workers and release every resource `init` and registration
    /// acquired.
    ///
    /// Joins each worker in start order and waits as long as it takes.
    /// Teardown continues past a failing step; the first error is returned.
    /// A repeated call logs and does nothing. Must not be called from a
    /// worker thread.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            let current = *state;
            if matches!(
                current,
                LifecycleState::ShuttingDown | LifecycleState::Shutdown
            ) {
                warn!(state = %current, "shutdown called again, ignoring");
                return Ok(());
            }
            *state = LifecycleState::ShuttingDown;
        }
        self.initialized.store(false, Ordering::Release);
        self.should_shutdown.store(true, Ordering::Release);

        for queue in self.queues.iter().filter_map(OnceLock::get) {
            queue.wake_all();
        }

        let workers = std::mem::take(&mut *self.threads.lock());
        let joined = workers.len();
        for (index, handle) in workers.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!(worker = index, "worker thread panicked");
            }
        }

        let mut first_err = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!(step, error = %e, "teardown step failed");
                first_err.get_or_insert(e);
            }
        };

        note("ps finalize", self.ps.finalize());

        if let Some(pair) = self.streams.lock().take() {
            note("reduce stream", self.device.destroy_stream(pair.reduce));
            note("broadcast stream", self.device.destroy_stream(pair.broadcast));
        }

        let buffers = self.registry.staging_buffers();
        let freed = buffers.len();
        for buffer in &buffers {
            note("staging buffer", self.device.free_pinned(buffer));
        }

        *self.state.lock() = LifecycleState::Shutdown;
        info!(workers = joined, staging_buffers = freed, "gradflow shut down");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Polled by worker loops between tasks.
    pub fn should_shutdown(&self) -> bool {
        self.should_shutdown.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.state.lock()
    }

    // ── Queues ───────────────────────────────────────────────────────────

    pub fn get_scheduled_queue(&self, stage: QueueType) -> Option<&ScheduledQueue> {
        self.queues[stage.index()].get()
    }

    /// The queue for `stage`, created on first call.
    pub fn create_scheduled_queue(&self, stage: QueueType) -> &ScheduledQueue {
        self.queues[stage.index()].get_or_init(|| {
            debug!(%stage, "scheduled queue created");
            ScheduledQueue::new(stage)
        })
    }

    // ── Registration & keys ──────────────────────────────────────────────

    /// Register `name` on first use. `false` means this call registered it.
    ///
    /// Panics if `size` is zero.
    pub fn is_tensor_initialized(
        &self,
        name: &str,
        size: usize,
        device: Device,
        dtype: DataType,
    ) -> Result<bool> {
        self.check_init()?;
        self.registry
            .is_tensor_initialized(name, size, device, dtype, self.device.as_ref())
    }

    /// The context for `name`. An unknown name gets an empty context
    /// inserted and returned.
    pub fn get_context_from_name(&self, name: &str) -> Arc<TensorContext> {
        self.registry.get_context_from_name(name)
    }

    /// See [`KeyEncoder::encode_default_key`].
    pub fn encode_default_key(&self, key: PsKey, len: usize) -> Arc<Pskv> {
        self.encoder
            .encode_default_key(key, len, || self.ps.server_key_ranges())
    }

    pub fn tensor_count(&self) -> usize {
        self.registry.tensor_count()
    }

    /// Byte bound, fixed by the first registered tensor.
    pub fn partition_bound_bytes(&self) -> Option<usize> {
        self.registry.partition_bound_bytes()
    }

    // ── Resources ────────────────────────────────────────────────────────

    pub fn reduce_stream(&self) -> Option<StreamHandle> {
        self.streams.lock().as_ref().map(|pair| pair.reduce)
    }

    pub fn broadcast_stream(&self) -> Option<StreamHandle> {
        self.streams.lock().as_ref().map(|pair| pair.broadcast)
    }

    pub fn rank_info(&self) -> Option<RankInfo> {
        self.rank.get().copied()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ps(&self) -> &Arc<dyn PsClient> {
        &self.ps
    }

    pub fn device(&self) -> &Arc<dyn DeviceRuntime> {
        &self.device
    }

    // ── Pipeline ─────────────────────────────────────────────────────────

    /// Register the tensor if needed and queue one entry per partition on
    /// the first stage. `callback` runs once, after the last partition
    /// leaves the pipeline or with the first stage error.
    pub fn enqueue_tensor(&self, request: EnqueueRequest, callback: StatusCallback) -> Result<()> {
        self.check_init()?;
        let EnqueueRequest {
            name,
            device,
            dtype,
            tensor,
            stages,
        } = request;

        let size = tensor.len();
        self.is_tensor_initialized(&name, size, device, dtype)?;
        let ctx = self.registry.get_context_from_name(&name);
        let registered: usize = ctx.part_lens.iter().sum();
        if registered != size {
            return Err(CoordinatorError::SizeMismatch {
                name,
                registered,
                actual: size,
            });
        }

        let Some(&first) = stages.first() else {
            callback(Ok(()));
            return Ok(());
        };

        let parts = ctx.key_list.len();
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(partition) = (0..parts).find(|&p| in_flight.contains(&(name.clone(), p))) {
                return Err(CoordinatorError::DuplicateEntry { name, partition });
            }
            in_flight.extend((0..parts).map(|p| (name.clone(), p)));
        }

        let completion = Completion::new(parts, Some(callback));
        let queue = self.create_scheduled_queue(first);
        for (partition_index, (key, offset, len)) in ctx.partitions().enumerate() {
            queue.add_task(TensorTableEntry {
                tensor_name: name.clone(),
                partition_index,
                key,
                device,
                dtype,
                offset,
                len,
                tensor: Some(tensor.clone()),
                staging: ctx.staging.clone(),
                stages: stages.iter().copied().collect(),
                completion: Arc::clone(&completion),
            });
        }
        debug!(tensor = %name, parts, %first, "tensor enqueued");
        Ok(())
    }

    /// Hand `entry` to its next stage, or complete it if this was the last.
    pub fn finish_or_proceed(&self, mut entry: TensorTableEntry) {
        if let Some(done) = entry.stages.pop_front() {
            if let Some(queue) = self.get_scheduled_queue(done) {
                queue.report_finish(&entry);
            }
        }
        match entry.current_stage() {
            Some(next) => self.create_scheduled_queue(next).add_task(entry),
            None => {
                self.release(&entry);
                if entry.completion.finish_one() {
                    debug!(tensor = %entry.tensor_name, "tensor completed");
                    entry.completion.fire(Ok(()));
                }
            }
        }
    }

    /// Drop `entry` from the pipeline and report `err` to its caller.
    pub fn fail_entry(&self, entry: TensorTableEntry, err: CoordinatorError) {
        warn!(
            tensor = %entry.tensor_name,
            partition = entry.partition_index,
            stage = ?entry.current_stage(),
            error = %err,
            "pipeline stage failed"
        );
        self.release(&entry);
        entry.completion.finish_one();
        entry.completion.fire(Err(err));
    }

    fn release(&self, entry: &TensorTableEntry) {
        self.in_flight
            .lock()
            .remove(&(entry.tensor_name.clone(), entry.partition_index));
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            state: self.lifecycle(),
            rank: self.rank_info(),
            partition_bound_bytes: self.partition_bound_bytes(),
            tensors: self.registry.snapshots(),
            queues: QueueType::ALL
                .iter()
                .filter_map(|&stage| {
                    self.get_scheduled_queue(stage).map(|q| QueueSnapshot {
                        stage,
                        pending: q.pending_size(),
                        finished: q.finished_count(),
                    })
                })
                .collect(),
        }
    }
}

impl fmt::Debug for GlobalCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalCoordinator")
            .field("state", &self.lifecycle())
            .field("rank", &self.rank_info())
            .field("tensors", &self.tensor_count())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
