//! Parameter-server client seam.
//!
//! The coordinator only needs the lifecycle half of this trait (start,
//! barrier, recovery query, finalize) and the server key ranges used by the
//! key encoder. `push`/`pull` are what worker stages call to move encoded
//! partitions.
//!
//! [`LoopbackPsClient`] hosts an in-process key/value server on its own
//! `tokio` runtime. Callers on plain OS threads reach it through an `mpsc`
//! command channel and wait on `oneshot` replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gradflow_types::config::LoopbackConfig;
use gradflow_types::{KeyRange, PsKey};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{CoordinatorError, Result};

/// Command buffer between callers and the server task.
const CHANNEL_CAPACITY: usize = 256;

pub trait PsClient: Send + Sync {
    /// Bring up the client and its async machinery.
    fn start_async(&self) -> Result<()>;

    /// True if this process is rejoining after a failure; the startup
    /// barrier is skipped in that case.
    fn is_recovery(&self) -> bool;

    /// Barrier across workers, servers and the scheduler.
    fn barrier(&self) -> Result<()>;

    /// One contiguous key range per server, in server order.
    fn server_key_ranges(&self) -> Vec<KeyRange>;

    fn push(&self, key: PsKey, value: Vec<u8>) -> Result<()>;

    fn pull(&self, key: PsKey) -> Result<Vec<u8>>;

    fn finalize(&self) -> Result<()>;
}

// ── Loopback server ──────────────────────────────────────────────────────────

enum ServerCommand {
    Push {
        key: PsKey,
        value: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    Pull {
        key: PsKey,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Shutdown,
}

async fn serve(mut cmd_rx: mpsc::Receiver<ServerCommand>) {
    let mut store: HashMap<PsKey, Vec<u8>> = HashMap::new();
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ServerCommand::Push { key, value, reply } => {
                store.insert(key, value);
                let _ = reply.send(());
            }
            ServerCommand::Pull { key, reply } => {
                let _ = reply.send(store.get(&key).cloned());
            }
            ServerCommand::Shutdown => break,
        }
    }
    debug!(keys = store.len(), "loopback server stopped");
}

struct Running {
    runtime: Runtime,
    cmd_tx: mpsc::Sender<ServerCommand>,
}

/// In-process parameter server reachable from synchronous worker threads.
pub struct LoopbackPsClient {
    config: LoopbackConfig,
    ranges: Vec<KeyRange>,
    running: Mutex<Option<Running>>,
    pushes: AtomicUsize,
    pulls: AtomicUsize,
}

impl LoopbackPsClient {
    pub fn new(config: LoopbackConfig) -> Self {
        let ranges = KeyRange::split_even(config.num_servers);
        Self {
            config,
            ranges,
            running: Mutex::new(None),
            pushes: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::Acquire)
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::Acquire)
    }

    fn sender(&self) -> Result<mpsc::Sender<ServerCommand>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.cmd_tx.clone())
            .ok_or_else(|| CoordinatorError::ParameterServer("loopback server is not running".into()))
    }
}

fn server_gone() -> CoordinatorError {
    CoordinatorError::ParameterServer("loopback server task has stopped".into())
}

impl PsClient for LoopbackPsClient {
    fn start_async(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("gradflow-ps")
            .enable_all()
            .build()
            .map_err(|e| CoordinatorError::ParameterServer(format!("runtime: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<ServerCommand>(CHANNEL_CAPACITY);
        runtime.spawn(serve(cmd_rx));

        info!(servers = self.config.num_servers, "loopback parameter server started");
        *running = Some(Running { runtime, cmd_tx });
        Ok(())
    }

    fn is_recovery(&self) -> bool {
        self.config.is_recovery
    }

    fn barrier(&self) -> Result<()> {
        // Every loopback server lives in this process.
        debug!("loopback barrier passed");
        Ok(())
    }

    fn server_key_ranges(&self) -> Vec<KeyRange> {
        self.ranges.clone()
    }

    fn push(&self, key: PsKey, value: Vec<u8>) -> Result<()> {
        let tx = self.sender()?;
        let (reply, done) = oneshot::channel();
        tx.blocking_send(ServerCommand::Push { key, value, reply })
            .map_err(|_| server_gone())?;
        done.blocking_recv().map_err(|_| server_gone())?;
        self.pushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn pull(&self, key: PsKey) -> Result<Vec<u8>> {
        let tx = self.sender()?;
        let (reply, value) = oneshot::channel();
        tx.blocking_send(ServerCommand::Pull { key, reply })
            .map_err(|_| server_gone())?;
        let value = value.blocking_recv().map_err(|_| server_gone())?;
        self.pulls.fetch_add(1, Ordering::AcqRel);
        value.ok_or_else(|| {
            CoordinatorError::ParameterServer(format!("key {key} has never been pushed"))
        })
    }

    fn finalize(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        let _ = running.cmd_tx.blocking_send(ServerCommand::Shutdown);
        running.runtime.shutdown_timeout(Duration::from_secs(1));
        info!("loopback parameter server finalized");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
