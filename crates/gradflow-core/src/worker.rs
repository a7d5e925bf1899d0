//! Worker loops.
//!
//! The coordinator owns the threads; a loop body only decides what one
//! stage does to one entry. [`run_stage_loop`] supplies the rest: block on
//! the stage queue, run the handler, hand the entry on, and stop once the
//! shutdown flag is seen.

use std::sync::Arc;

use tracing::debug;

use crate::coordinator::GlobalCoordinator;
use crate::entry::TensorTableEntry;
use crate::error::{CoordinatorError, Result};
use crate::queue::QueueType;

/// Body of one worker thread.
pub type LoopFunction = Box<dyn FnOnce(Arc<GlobalCoordinator>) + Send + 'static>;

/// Stage order for a host-staged push/pull round trip.
pub const PUSH_PULL_STAGES: [QueueType; 4] = [
    QueueType::CopyD2H,
    QueueType::Push,
    QueueType::Pull,
    QueueType::CopyH2D,
];

/// Drain `stage` until shutdown, applying `handler` to each entry.
///
/// A handler error fails the entry's tensor; the loop keeps going.
pub fn run_stage_loop<F>(coord: &GlobalCoordinator, stage: QueueType, mut handler: F)
where
    F: FnMut(&GlobalCoordinator, &mut TensorTableEntry) -> Result<()>,
{
    let queue = coord.create_scheduled_queue(stage);
    let poll = coord.config().poll_interval;
    debug!(%stage, "stage loop started");

    let mut handled = 0u64;
    while !coord.should_shutdown() {
        let Some(mut entry) = queue.wait_task(poll) else {
            continue;
        };
        match handler(coord, &mut entry) {
            Ok(()) => coord.finish_or_proceed(entry),
            Err(e) => coord.fail_entry(entry, e),
        }
        handled += 1;
    }

    debug!(%stage, handled, left = queue.pending_size(), "stage loop stopped");
}

/// Wrap a handler as a [`LoopFunction`] for [`GlobalCoordinator::start`].
pub fn stage_loop<F>(stage: QueueType, handler: F) -> LoopFunction
where
    F: FnMut(&GlobalCoordinator, &mut TensorTableEntry) -> Result<()> + Send + 'static,
{
    Box::new(move |coord: Arc<GlobalCoordinator>| run_stage_loop(&coord, stage, handler))
}

// ── Push/pull handlers ───────────────────────────────────────────────────────

/// Device → staging. A no-op for host tensors, which have no staging buffer.
fn copy_to_staging(entry: &TensorTableEntry) {
    if let (Some(staging), Some(tensor)) = (&entry.staging, &entry.tensor) {
        staging.write_at(entry.offset, &tensor.read_at(entry.offset, entry.len));
    }
}

/// Staging → device.
fn copy_from_staging(entry: &TensorTableEntry) {
    if let (Some(staging), Some(tensor)) = (&entry.staging, &entry.tensor) {
        tensor.write_at(entry.offset, &staging.read_at(entry.offset, entry.len));
    }
}

fn push(coord: &GlobalCoordinator, entry: &mut TensorTableEntry) -> Result<()> {
    let bytes = entry.host_bytes().ok_or_else(|| {
        CoordinatorError::ParameterServer(format!("{}: nothing to push", entry.tensor_name))
    })?;
    let pskv = coord.encode_default_key(entry.key, entry.len);
    coord.ps().push(pskv.keys[0], bytes)
}

fn pull(coord: &GlobalCoordinator, entry: &mut TensorTableEntry) -> Result<()> {
    let pskv = coord.encode_default_key(entry.key, entry.len);
    let bytes = coord.ps().pull(pskv.keys[0])?;
    if bytes.len() != entry.len {
        return Err(CoordinatorError::ParameterServer(format!(
            "{}: pulled {} bytes for a {} byte partition",
            entry.tensor_name,
            bytes.len(),
            entry.len
        )));
    }
    entry.write_host_bytes(&bytes);
    Ok(())
}

/// One loop per stage in [`PUSH_PULL_STAGES`], talking to the coordinator's
/// parameter-server client.
pub fn push_pull_loops() -> Vec<LoopFunction> {
    vec![
        stage_loop(QueueType::CopyD2H, |_, entry| {
            copy_to_staging(entry);
            Ok(())
        }),
        stage_loop(QueueType::Push, push),
        stage_loop(QueueType::Pull, pull),
        stage_loop(QueueType::CopyH2D, |_, entry| {
            copy_from_staging(entry);
            Ok(())
        }),
    ]
}

// ── Tests ─────────────────────────────────────────────────────────────────────
