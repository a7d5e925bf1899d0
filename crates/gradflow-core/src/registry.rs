//! Tensor registry: name → partition layout, keys and staging buffer.
//!
//! Keys come from one counter shared by every tensor in the process, so a
//! tensor's keys are contiguous and no key is ever handed out twice. A
//! context is built once under the registration lock and never changes
//! afterwards; readers get an `Arc` to it.

use std::collections::HashMap;
use std::sync::Arc;

use gradflow_types::{DataType, Device, GradflowError, PsKey};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::device::{DeviceRuntime, PinnedBuffer};
use crate::error::Result;
use crate::snapshot::TensorSnapshot;

/// Partition metadata for one tensor name.
#[derive(Debug, Clone, Default)]
pub struct TensorContext {
    /// Pinned staging buffer; only GPU-resident tensors get one.
    pub staging: Option<PinnedBuffer>,
    pub buff_len: usize,
    /// One key per partition, strictly increasing.
    pub key_list: Vec<PsKey>,
    /// Byte length of each partition, parallel to `key_list`.
    pub part_lens: Vec<usize>,
}

impl TensorContext {
    /// True for the placeholder created by a lookup of an unregistered name.
    pub fn is_empty(&self) -> bool {
        self.key_list.is_empty()
    }

    /// `(key, byte offset, byte length)` for each partition.
    pub fn partitions(&self) -> impl Iterator<Item = (PsKey, usize, usize)> + '_ {
        self.key_list
            .iter()
            .zip(&self.part_lens)
            .scan(0usize, |offset, (&key, &len)| {
                let start = *offset;
                *offset += len;
                Some((key, start, len))
            })
    }
}

/// Split `size` bytes into consecutive parts of at most `bound_bytes`.
/// Only the last part may be shorter.
pub fn partition_plan(size: usize, bound_bytes: usize) -> Vec<usize> {
    assert!(bound_bytes > 0, "partition bound must be > 0");
    let mut parts = Vec::with_capacity(size.div_ceil(bound_bytes));
    let mut accumulated = 0;
    while accumulated < size {
        let len = bound_bytes.min(size - accumulated);
        parts.push(len);
        accumulated += len;
    }
    parts
}

struct RegistryState {
    contexts: HashMap<String, Arc<TensorContext>>,
    next_key: PsKey,
    bound_elements: usize,
    /// Fixed by the dtype of the first tensor ever registered.
    bound_bytes: Option<usize>,
}

pub struct TensorRegistry {
    state: Mutex<RegistryState>,
}

impl TensorRegistry {
    pub fn new(bound_elements: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                contexts: HashMap::new(),
                next_key: 0,
                bound_elements,
                bound_bytes: None,
            }),
        }
    }

    /// Replace the bound (in elements). Has no effect once the first tensor
    /// has pinned the byte conversion.
    pub fn set_partition_bound(&self, elements: usize) {
        let mut state = self.state.lock();
        if state.bound_bytes.is_none() {
            state.bound_elements = elements;
        }
    }

    /// The byte bound, once the first registration has fixed it.
    pub fn partition_bound_bytes(&self) -> Option<usize> {
        self.state.lock().bound_bytes
    }

    /// Register `name` on first use.
    ///
    /// Returns `false` when this call created the context, `true` if the
    /// name was already known. The first registration in the process
    /// converts the element bound to bytes with `dtype`'s width, and that
    /// byte bound then applies to every later tensor whatever its dtype.
    ///
    /// Fails without registering anything if the bound in bytes would
    /// overflow. Panics if `size` is zero.
    pub fn is_tensor_initialized(
        &self,
        name: &str,
        size: usize,
        device: Device,
        dtype: DataType,
        runtime: &dyn DeviceRuntime,
    ) -> Result<bool> {
        assert!(size > 0, "tensor {name}: size must be > 0");

        let mut state = self.state.lock();
        if state.contexts.contains_key(name) {
            return Ok(true);
        }

        let pinned = state.bound_bytes;
        let bound = match pinned {
            Some(bytes) => bytes,
            None => {
                let Some(bytes) = state.bound_elements.checked_mul(dtype.element_bytes()) else {
                    return Err(GradflowError::Config(format!(
                        "partition bound of {} {dtype} elements overflows a byte count",
                        state.bound_elements
                    ))
                    .into());
                };
                info!(
                    elements = state.bound_elements,
                    %dtype,
                    bytes,
                    "partition bound fixed"
                );
                state.bound_bytes = Some(bytes);
                bytes
            }
        };

        let staging = if device.is_gpu() {
            Some(runtime.alloc_pinned(size)?)
        } else {
            None
        };

        let part_lens = partition_plan(size, bound);
        let first_key = state.next_key;
        let key_list: Vec<PsKey> = (first_key..first_key + part_lens.len() as PsKey).collect();
        state.next_key += part_lens.len() as PsKey;

        debug!(
            tensor = name,
            size,
            %device,
            partitions = part_lens.len(),
            first_key,
            "tensor registered"
        );

        state.contexts.insert(
            name.to_string(),
            Arc::new(TensorContext {
                staging,
                buff_len: size,
                key_list,
                part_lens,
            }),
        );
        Ok(false)
    }

    /// The context for `name`, inserting an empty one if the name is unknown.
    pub fn get_context_from_name(&self, name: &str) -> Arc<TensorContext> {
        self.state
            .lock()
            .contexts
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Lookup without the insert side effect.
    pub fn get(&self, name: &str) -> Option<Arc<TensorContext>> {
        self.state.lock().contexts.get(name).cloned()
    }

    pub fn tensor_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Every allocated staging buffer, for release at shutdown.
    pub fn staging_buffers(&self) -> Vec<PinnedBuffer> {
        self.state
            .lock()
            .contexts
            .values()
            .filter_map(|ctx| ctx.staging.clone())
            .collect()
    }

    /// Registered tensors, sorted by name.
    pub fn snapshots(&self) -> Vec<TensorSnapshot> {
        let state = self.state.lock();
        let mut out: Vec<TensorSnapshot> = state
            .contexts
            .iter()
            .map(|(name, ctx)| TensorSnapshot {
                name: name.clone(),
                keys: ctx.key_list.clone(),
                part_lens: ctx.part_lens.clone(),
                staging_len: ctx.staging.as_ref().map(PinnedBuffer::len),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::device::HostRuntime;
    use crate::error::CoordinatorError;

    const BOUND: usize = 512_000;

    #[test]
    fn float32_tensor_fits_one_partition() {
        let rt = HostRuntime::new();
        let reg = TensorRegistry::new(BOUND);

        let known = reg
            .is_tensor_initialized("grad0", 1_000_000, Device::Gpu(0), DataType::Float32, &rt)
            .unwrap();
        assert!(!known);
        assert_eq!(reg.partition_bound_bytes(), Some(2_048_000));

        let ctx = reg.get("grad0").unwrap();
        assert_eq!(ctx.key_list, vec![0]);
        assert_eq!(ctx.part_lens, vec![1_000_000]);
        assert_eq!(ctx.staging.as_ref().map(PinnedBuffer::len), Some(1_000_000));
    }

    #[test]
    fn float16_tensor_splits_in_two() {
        let rt = HostRuntime::new();
        let reg = TensorRegistry::new(BOUND);

        reg.is_tensor_initialized("w", 2_000_000, Device::Gpu(0), DataType::Float16, &rt)
            .unwrap();
        let ctx = reg.get("w").unwrap();
        assert_eq!(ctx.part_lens, vec![1_024_000, 976_000]);
        assert_eq!(ctx.key_list, vec![0, 1]);
    }

    #[test]
    fn second_registration_changes_nothing() {
        let rt = HostRuntime::new();
        let reg = TensorRegistry::new(BOUND);

        reg.is_tensor_initialized("w", 3_000_000, Device::Gpu(1), DataType::Float32, &rt)
            .unwrap();
        let before = reg.get("w").unwrap();

        let known = reg
            .is_tensor_initialized("w", 3_000_000, Device::Gpu(1), DataType::Float32, &rt)
            .unwrap();
        assert!(known);
        let after = reg.get("w").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(rt.stats().buffers_allocated, 1);
    }

    #[test]
    fn first_dtype_pins_the_byte_bound() {
        let rt = HostRuntime::new();
        let reg = TensorRegistry::new(1_000);

        // 1 byte per element: bound becomes 1000 bytes for everyone.
        reg.is_tensor_initialized("bytes", 10, Device::Cpu, DataType::Uint8, &rt)
            .unwrap();
        reg.is_tensor_initialized("doubles", 8_000, Device::Cpu, DataType::Float64, &rt)
            .unwrap();

        assert_eq!(reg.partition_bound_bytes(), Some(1_000));
        assert_eq!(reg.get("doubles").unwrap().part_lens.len(), 8);

        // Later bound updates are ignored once pinned.
        reg.set_partition_bound(4);
        assert_eq!(reg.partition_bound_bytes(), Some(1_000));
    }

    #[test]
    fn overflowing_byte_bound_is_rejected_and_not_pinned() {
        let rt = HostRuntime::new();
        let reg = TensorRegistry::new(usize::MAX / 2);

        let err = reg
            .is_tensor_initialized("wide", 64, Device::Gpu(0), DataType::Float32, &rt)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(GradflowError::Config(_))));
        assert_eq!(reg.partition_bound_bytes(), None);
        assert_eq!(reg.tensor_count(), 0);
        assert_eq!(rt.stats().buffers_allocated, 0);

        // A narrower dtype still converts.
        reg.is_tensor_initialized("narrow", 64, Device::Cpu, DataType::Uint8, &rt)
            .unwrap();
        assert_eq!(reg.partition_bound_bytes(), Some(usize::MAX / 2));
        assert_eq!(reg.get("narrow").unwrap().part_lens, vec![64]);
    }

    #[test]
    fn racing_first_registrations_create_one_context() {
        const CALLERS: usize = 16;

        let rt = Arc::new(HostRuntime::new());
        let reg = Arc::new(TensorRegistry::new(1_000));
        let gate = Arc::new(Barrier::new(CALLERS));
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let rt = rt.clone();
                let reg = reg.clone();
                let gate = gate.clone();
                thread::spawn(move || {
                    gate.wait();
                    reg.is_tensor_initialized(
                        "shared",
                        10_000,
                        Device::Gpu(0),
                        DataType::Float32,
                        rt.as_ref(),
                    )
                    .unwrap()
                })
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&known| !known)
            .count();
        assert_eq!(created, 1);
        assert_eq!(reg.tensor_count(), 1);
        assert_eq!(rt.stats().buffers_allocated, 1);
        let ctx = reg.get("shared").unwrap();
        assert_eq!(ctx.key_list, vec![0, 1, 2]);
        assert_eq!(ctx.part_lens, vec![4_000, 4_000, 2_000]);
    }

    #[test]
    fn keys_are_contiguous_across_tensors() {
        let rt = HostRuntime::new();
        let reg = TensorRegistry::new(100);

        for (name, size) in [("a", 250), ("b", 100), ("c", 1)] {
            reg.is_tensor_initialized(name, size, Device::Cpu, DataType::Uint8, &rt)
                .unwrap();
        }
        let keys: Vec<PsKey> = ["a", "b", "c"]
            .iter()
            .flat_map(|n| reg.get(n).unwrap().key_list.clone())
            .collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4]);
        assert_eq!(reg.tensor_count(), 3);
        assert!(reg.staging_buffers().is_empty());
    }

    #[test]
    fn plan_counts_and_sums() {
        for (size, bound) in [(1, 7), (7, 7), (8, 7), (1_000_003, 4_096), (4_096 * 5, 4_096)] {
            let parts = partition_plan(size, bound);
            assert_eq!(parts.len(), size.div_ceil(bound));
            assert_eq!(parts.iter().sum::<usize>(), size);
            assert!(parts[..parts.len() - 1].iter().all(|&p| p == bound));
            assert!(*parts.last().unwrap() <= bound);
        }
    }

    #[test]
    fn partitions_report_offsets() {
        let ctx = TensorContext {
            key_list: vec![5, 6, 7],
            part_lens: vec![4, 4, 2],
            buff_len: 10,
            staging: None,
        };
        let parts: Vec<_> = ctx.partitions().collect();
        assert_eq!(parts, vec![(5, 0, 4), (6, 4, 4), (7, 8, 2)]);
    }

    #[test]
    fn unknown_name_lookup_inserts_empty_context() {
        let rt = HostRuntime::new();
        let reg = TensorRegistry::new(BOUND);

        let ctx = reg.get_context_from_name("ghost");
        assert!(ctx.is_empty());
        assert_eq!(reg.tensor_count(), 1);

        // The placeholder counts as registered.
        let known = reg
            .is_tensor_initialized("ghost", 16, Device::Cpu, DataType::Float32, &rt)
            .unwrap();
        assert!(known);
    }

    #[test]
    #[should_panic(expected = "size must be > 0")]
    fn zero_size_panics() {
        let rt = HostRuntime::new();
        TensorRegistry::new(BOUND)
            .is_tensor_initialized("empty", 0, Device::Cpu, DataType::Float32, &rt)
            .unwrap();
    }
}
