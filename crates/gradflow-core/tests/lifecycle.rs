//! Registration, concurrent init and shutdown against in-process
//! collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use gradflow_core::{
    run_stage_loop, Collaborators, Communicator, CoordinatorError, GlobalCoordinator, HostRuntime,
    DeviceRuntime, LifecycleState, LoopFunction, LoopbackPsClient, PinnedBuffer, PsClient,
    QueueType, Result, StreamHandle, PUSH_PULL_STAGES,
};
use gradflow_types::config::{CoordinatorConfig, LoopbackConfig};
use gradflow_types::{DataType, Device, RankInfo};

struct CountingComm {
    inits: AtomicUsize,
}

impl Communicator for CountingComm {
    fn init(&self) -> Result<RankInfo> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        // widen the window for racing callers
        thread::sleep(std::time::Duration::from_millis(20));
        Ok(RankInfo::single())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

struct FailingComm;

impl Communicator for FailingComm {
    fn init(&self) -> Result<RankInfo> {
        Err(CoordinatorError::Communicator("no peers".into()))
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Fails the `fail_at`-th stream creation (1-based).
struct FlakyDevice {
    inner: Arc<HostRuntime>,
    created: AtomicUsize,
    fail_at: usize,
}

impl DeviceRuntime for FlakyDevice {
    fn create_stream(&self) -> Result<StreamHandle> {
        if self.created.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return Err(CoordinatorError::Device("out of streams".into()));
        }
        self.inner.create_stream()
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.inner.destroy_stream(stream)
    }

    fn alloc_pinned(&self, len: usize) -> Result<PinnedBuffer> {
        self.inner.alloc_pinned(len)
    }

    fn free_pinned(&self, buffer: &PinnedBuffer) -> Result<()> {
        self.inner.free_pinned(buffer)
    }
}

struct Harness {
    coord: Arc<GlobalCoordinator>,
    comm: Arc<CountingComm>,
    ps: Arc<LoopbackPsClient>,
    device: Arc<HostRuntime>,
}

fn harness() -> Harness {
    let comm = Arc::new(CountingComm {
        inits: AtomicUsize::new(0),
    });
    let ps = Arc::new(LoopbackPsClient::new(LoopbackConfig::default()));
    let device = Arc::new(HostRuntime::new());
    let coord = GlobalCoordinator::new(
        CoordinatorConfig {
            read_env: false,
            ..Default::default()
        },
        Collaborators {
            comm: comm.clone(),
            ps: ps.clone(),
            device: device.clone(),
        },
    );
    Harness {
        coord,
        comm,
        ps,
        device,
    }
}

#[test]
fn float32_gpu_tensor_gets_one_partition_and_staging() {
    let h = harness();
    h.coord.init().unwrap();

    let known = h
        .coord
        .is_tensor_initialized("grad0", 1_000_000, Device::Gpu(0), DataType::Float32)
        .unwrap();
    assert!(!known);

    let ctx = h.coord.get_context_from_name("grad0");
    assert_eq!(ctx.key_list.len(), 1);
    assert_eq!(ctx.part_lens, vec![1_000_000]);
    assert_eq!(ctx.staging.as_ref().map(PinnedBuffer::len), Some(1_000_000));
    assert_eq!(h.coord.partition_bound_bytes(), Some(2_048_000));

    assert!(h
        .coord
        .is_tensor_initialized("grad0", 1_000_000, Device::Gpu(0), DataType::Float32)
        .unwrap());
    assert_eq!(h.device.stats().buffers_allocated, 1);

    h.coord.shutdown().unwrap();
}

#[test]
fn float16_gpu_tensor_splits_at_converted_bound() {
    let h = harness();
    h.coord.init().unwrap();

    h.coord
        .is_tensor_initialized("grad1", 2_000_000, Device::Gpu(0), DataType::Float16)
        .unwrap();

    let ctx = h.coord.get_context_from_name("grad1");
    assert_eq!(ctx.part_lens, vec![1_024_000, 976_000]);
    assert_eq!(ctx.key_list, vec![ctx.key_list[0], ctx.key_list[0] + 1]);
    assert_eq!(h.coord.tensor_count(), 1);

    h.coord.shutdown().unwrap();
}

#[test]
fn concurrent_init_runs_setup_once() {
    const CALLERS: usize = 8;

    let h = harness();
    let gate = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let coord = h.coord.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                gate.wait();
                coord.init()
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(h.comm.inits.load(Ordering::SeqCst), 1);
    assert_eq!(h.device.stats().streams_created, 2);
    assert!(h.ps.is_running());
    assert_eq!(h.coord.lifecycle(), LifecycleState::Initialized);

    h.coord.shutdown().unwrap();
}

#[test]
fn shutdown_joins_workers_and_releases_everything_once() {
    let h = harness();
    h.coord.init().unwrap();

    for (i, size) in [4_096usize, 10_000, 333].into_iter().enumerate() {
        h.coord
            .is_tensor_initialized(&format!("w{i}"), size, Device::Gpu(0), DataType::Float32)
            .unwrap();
    }

    let exited = Arc::new(AtomicUsize::new(0));
    let loops: Vec<LoopFunction> = PUSH_PULL_STAGES
        .iter()
        .map(|&stage| {
            let exited = exited.clone();
            Box::new(move |coord: Arc<GlobalCoordinator>| {
                run_stage_loop(&coord, stage, |_, _| Ok(()));
                exited.fetch_add(1, Ordering::SeqCst);
            }) as LoopFunction
        })
        .collect();
    h.coord.start(loops).unwrap();

    h.coord.shutdown().unwrap();

    assert_eq!(exited.load(Ordering::SeqCst), 4);
    let stats = h.device.stats();
    assert_eq!(stats.streams_created, 2);
    assert_eq!(stats.streams_destroyed, 2);
    assert_eq!(stats.buffers_allocated, 3);
    assert_eq!(stats.buffers_freed, 3);
    assert_eq!(h.device.live_buffers(), 0);
    assert_eq!(h.device.live_streams(), 0);
    assert!(!h.ps.is_running());
    assert!(h.coord.reduce_stream().is_none());
    assert!(h.coord.broadcast_stream().is_none());

    // A repeated shutdown must not free anything twice.
    h.coord.shutdown().unwrap();
    assert_eq!(h.device.stats().buffers_freed, 3);
}

#[test]
fn failed_init_is_terminal() {
    let coord = GlobalCoordinator::new(
        CoordinatorConfig {
            read_env: false,
            ..Default::default()
        },
        Collaborators {
            comm: Arc::new(FailingComm),
            ps: Arc::new(LoopbackPsClient::new(LoopbackConfig::default())),
            device: Arc::new(HostRuntime::new()),
        },
    );

    assert!(matches!(coord.init(), Err(CoordinatorError::Communicator(_))));
    assert_eq!(coord.lifecycle(), LifecycleState::Failed);
    assert!(matches!(coord.check_init(), Err(CoordinatorError::NotInitialized)));
    assert!(coord.get_scheduled_queue(QueueType::Reduce).is_none());

    assert!(matches!(coord.init(), Err(CoordinatorError::InitFailed)));
    coord.shutdown().unwrap();
    assert_eq!(coord.lifecycle(), LifecycleState::Shutdown);
}

#[test]
fn second_stream_failure_releases_the_first() {
    let comm = Arc::new(CountingComm {
        inits: AtomicUsize::new(0),
    });
    let ps = Arc::new(LoopbackPsClient::new(LoopbackConfig::default()));
    let host = Arc::new(HostRuntime::new());
    let coord = GlobalCoordinator::new(
        CoordinatorConfig {
            read_env: false,
            ..Default::default()
        },
        Collaborators {
            comm: comm.clone(),
            ps: ps.clone(),
            device: Arc::new(FlakyDevice {
                inner: host.clone(),
                created: AtomicUsize::new(0),
                fail_at: 2,
            }),
        },
    );

    assert!(matches!(coord.init(), Err(CoordinatorError::Device(_))));
    assert_eq!(host.live_streams(), 0);
    assert!(coord.reduce_stream().is_none());
    assert_eq!(coord.lifecycle(), LifecycleState::Failed);

    // No retry: the communicator is not touched again.
    assert!(matches!(coord.init(), Err(CoordinatorError::InitFailed)));
    assert_eq!(comm.inits.load(Ordering::SeqCst), 1);

    coord.shutdown().unwrap();
    assert!(!ps.is_running());
    let stats = host.stats();
    assert_eq!(stats.streams_created, 1);
    assert_eq!(stats.streams_destroyed, 1);
    assert_eq!(host.live_streams(), 0);
}

#[test]
fn recovering_worker_skips_barrier() {
    struct NoBarrier(LoopbackPsClient);

    impl PsClient for NoBarrier {
        fn start_async(&self) -> Result<()> {
            self.0.start_async()
        }
        fn is_recovery(&self) -> bool {
            true
        }
        fn barrier(&self) -> Result<()> {
            panic!("barrier must be skipped while recovering");
        }
        fn server_key_ranges(&self) -> Vec<gradflow_types::KeyRange> {
            self.0.server_key_ranges()
        }
        fn push(&self, key: u64, value: Vec<u8>) -> Result<()> {
            self.0.push(key, value)
        }
        fn pull(&self, key: u64) -> Result<Vec<u8>> {
            self.0.pull(key)
        }
        fn finalize(&self) -> Result<()> {
            self.0.finalize()
        }
    }

    let coord = GlobalCoordinator::new(
        CoordinatorConfig {
            read_env: false,
            ..Default::default()
        },
        Collaborators {
            comm: Arc::new(CountingComm {
                inits: AtomicUsize::new(0),
            }),
            ps: Arc::new(NoBarrier(LoopbackPsClient::new(LoopbackConfig::default()))),
            device: Arc::new(HostRuntime::new()),
        },
    );
    coord.init().unwrap();
    coord.shutdown().unwrap();
}
