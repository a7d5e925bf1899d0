//! gradflow-node binary: single-process harness for the coordinator.
//!
//! ```bash
//! # Push and pull 4 tensors of 3 MB each through a 4-server loopback PS
//! RUST_LOG=info cargo run --bin gradflow-node -- run --tensors 4 --size 3000000 --servers 4
//!
//! # Show how a tensor would be partitioned
//! cargo run --bin gradflow-node -- plan --size 2000000 --dtype f16
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gradflow_core::{
    partition_plan, push_pull_loops, Collaborators, EnqueueRequest, GlobalCoordinator,
    HostRuntime, LocalCommunicator, LoopbackPsClient, TensorBuffer, PUSH_PULL_STAGES,
};
use gradflow_types::config::{CommConfig, CoordinatorConfig, LoopbackConfig, DEFAULT_PARTITION_BOUND};
use gradflow_types::{DataType, Device};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "gradflow-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "gradflow: partitioned parameter-server sync in one process"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the coordinator, run push/pull rounds, print a state snapshot.
    Run {
        /// Number of tensors enqueued per round.
        #[arg(long, default_value_t = 4)]
        tensors: usize,

        /// Size of each tensor in bytes.
        #[arg(long, default_value_t = 4_000_000)]
        size: usize,

        /// Element type; fixes the byte bound on first registration.
        #[arg(long, default_value = "f32")]
        dtype: DataType,

        /// GPU index the tensors live on. Host memory if omitted.
        #[arg(long)]
        gpu: Option<u32>,

        /// Number of loopback servers. Defaults to GRADFLOW_NUM_SERVER or 1.
        #[arg(long)]
        servers: Option<usize>,

        #[arg(long, default_value_t = 3)]
        rounds: usize,
    },

    /// Print the partition layout for one tensor.
    Plan {
        /// Tensor size in bytes.
        #[arg(long)]
        size: usize,

        #[arg(long, default_value = "f32")]
        dtype: DataType,

        /// Partition bound in elements.
        #[arg(long, default_value_t = DEFAULT_PARTITION_BOUND)]
        bound: usize,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=gradflow_core=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { tensors, size, dtype, gpu, servers, rounds } => {
            let device = gpu.map(Device::Gpu).unwrap_or(Device::Cpu);
            run_rounds(tensors, size, dtype, device, servers, rounds)
        }
        Command::Plan { size, dtype, bound } => print_plan(size, dtype, bound),
    }
}

// ── Run mode ──────────────────────────────────────────────────────────────────

fn run_rounds(
    tensors: usize,
    size: usize,
    dtype: DataType,
    device: Device,
    servers: Option<usize>,
    rounds: usize,
) -> Result<()> {
    if size == 0 {
        bail!("--size must be > 0");
    }

    let mut loopback = LoopbackConfig::from_env()?;
    if let Some(n) = servers {
        if n == 0 {
            bail!("--servers must be > 0");
        }
        loopback.num_servers = n;
    }

    let coord = GlobalCoordinator::new(
        CoordinatorConfig::default(),
        Collaborators {
            comm: Arc::new(LocalCommunicator::new(CommConfig::from_env()?)),
            ps: Arc::new(LoopbackPsClient::new(loopback)),
            device: Arc::new(HostRuntime::new()),
        },
    );
    coord.init()?;
    coord.start(push_pull_loops())?;

    let buffers: Vec<TensorBuffer> = (0..tensors)
        .map(|i| TensorBuffer::from_vec((0..size).map(|b| (b + i) as u8).collect()))
        .collect();

    let result = drive(&coord, &buffers, dtype, device, rounds);
    coord.shutdown()?;
    result?;

    println!("{}", serde_json::to_string_pretty(&coord.snapshot())?);
    Ok(())
}

fn drive(
    coord: &GlobalCoordinator,
    buffers: &[TensorBuffer],
    dtype: DataType,
    device: Device,
    rounds: usize,
) -> Result<()> {
    const ROUND_TIMEOUT: Duration = Duration::from_secs(60);

    for round in 0..rounds {
        let started = Instant::now();
        let (tx, rx) = mpsc::channel();
        for (i, tensor) in buffers.iter().enumerate() {
            let tx = tx.clone();
            coord.enqueue_tensor(
                EnqueueRequest {
                    name: format!("grad.{i}"),
                    device,
                    dtype,
                    tensor: tensor.clone(),
                    stages: PUSH_PULL_STAGES.to_vec(),
                },
                Box::new(move |status: gradflow_core::Result<()>| {
                    let _ = tx.send((i, status));
                }),
            )?;
        }
        drop(tx);

        for _ in 0..buffers.len() {
            let (i, status) = rx
                .recv_timeout(ROUND_TIMEOUT)
                .with_context(|| format!("round {round} stalled"))?;
            status.with_context(|| format!("grad.{i} failed in round {round}"))?;
        }
        info!(round, tensors = buffers.len(), elapsed = ?started.elapsed(), "round complete");
    }
    Ok(())
}

// ── Plan mode ─────────────────────────────────────────────────────────────────

fn print_plan(size: usize, dtype: DataType, bound: usize) -> Result<()> {
    if size == 0 || bound == 0 {
        bail!("--size and --bound must be > 0");
    }
    let Some(bound_bytes) = bound.checked_mul(dtype.element_bytes()) else {
        bail!("--bound {bound} overflows a byte count for {dtype}");
    };
    let parts = partition_plan(size, bound_bytes);

    println!("tensor: {size} bytes, dtype {dtype}, bound {bound} elements = {bound_bytes} bytes");
    let mut offset = 0;
    for (i, len) in parts.iter().enumerate() {
        println!("  part {i:>4}  offset {offset:>12}  len {len:>12}");
        offset += len;
    }
    println!("{} partitions", parts.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_rejects_overflowing_bound() {
        let err = print_plan(1_024, DataType::Float64, usize::MAX / 4).unwrap_err();
        assert!(err.to_string().contains("overflows"));
        print_plan(1_024, DataType::Uint8, usize::MAX / 4).unwrap();
    }

    #[test]
    fn plan_rejects_zero_bound() {
        assert!(print_plan(1_024, DataType::Float32, 0).is_err());
    }
}
