//! Device runtime seam.
//!
//! The cache manager consumes an inference session for exactly two things:
//! allocating per-device block storage, and launching the precompiled kernels
//! (COW strided memcpy, cache-length increment). Kernel launches are
//! enqueue-only: the manager hands out tensor handles and never reads a
//! device-produced value during its own operations, so `fetch`, `step` and
//! `increment_cache_lengths` introduce no host/device synchronization.
//!
//! `HostSession` is the in-process reference runtime. It backs tensors with
//! host memory and runs the kernels immediately, but observes the same
//! contract: results are only read back through the explicitly synchronizing
//! `read_u32`/`read_i64`/`read_bytes`, which the manager itself never calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::config::DType;
use crate::error::{Error, Result};

/// A device holding block storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    pub id: usize,
    pub label: String,
}

impl Device {
    pub fn cpu() -> Self {
        Self {
            id: 0,
            label: "cpu".to_string(),
        }
    }

    pub fn gpu(id: usize) -> Self {
        Self {
            id,
            label: "gpu".to_string(),
        }
    }
}

/// Opaque handle to a device-resident tensor.
///
/// Handles are cheap to clone and carry only shape and placement; the backing
/// storage is owned by the session that created them.
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    pub id: u64,
    pub shape: Vec<usize>,
    pub device: usize,
}

impl DeviceTensor {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Descriptors for the precompiled graphs the manager loads at construction.
#[derive(Debug, Clone)]
pub enum KernelGraph {
    /// `kv_collection_cow_strided_memcpy.paged`: copy the first `num_tokens`
    /// token slots of one block into another, across all per-device buffers.
    CowStridedMemcpy {
        block_shape: [usize; 6],
        dtype: DType,
    },
    /// `update_cache_lengths`: per device,
    /// `out[i] = cache_lengths[i] + (row_offsets[i + 1] - row_offsets[i])`.
    UpdateCacheLengths { num_devices: usize },
    /// `update_start_pos`: `start_pos + tokens.shape[1]`.
    UpdateStartPos,
}

impl KernelGraph {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CowStridedMemcpy { .. } => "kv_collection_cow_strided_memcpy.paged",
            Self::UpdateCacheLengths { .. } => "update_cache_lengths",
            Self::UpdateStartPos => "update_start_pos",
        }
    }
}

/// Argument to a kernel launch.
#[derive(Debug, Clone)]
pub enum KernelValue {
    U32(u32),
    I64(i64),
    Tensor(DeviceTensor),
}

/// A loaded kernel. `execute` enqueues the computation and returns handles
/// for any produced tensors without waiting for completion.
pub trait CompiledKernel {
    fn execute(&self, args: &[KernelValue]) -> Result<Vec<DeviceTensor>>;
}

/// Interface to the device runtime.
pub trait InferenceSession {
    /// Allocate a zero-filled tensor of `shape` with `elem_bytes`-wide
    /// elements on `device`.
    fn alloc(&self, device: &Device, shape: &[usize], elem_bytes: usize) -> Result<DeviceTensor>;

    /// Upload host values as a u32 tensor on `device`.
    fn upload_u32(&self, device: &Device, shape: &[usize], data: &[u32]) -> Result<DeviceTensor>;

    /// Upload host values as an i64 tensor on `device`.
    fn upload_i64(&self, device: &Device, shape: &[usize], data: &[i64]) -> Result<DeviceTensor>;

    /// Load one of the precompiled graphs.
    fn load(&self, graph: KernelGraph) -> Result<Box<dyn CompiledKernel>>;
}

struct HostTensor {
    shape: Vec<usize>,
    device: usize,
    bytes: Vec<u8>,
}

struct HostStorage {
    next_id: AtomicU64,
    tensors: Mutex<HashMap<u64, HostTensor>>,
}

impl HostStorage {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, HostTensor>> {
        self.tensors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, shape: Vec<usize>, device: usize, bytes: Vec<u8>) -> DeviceTensor {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = DeviceTensor {
            id,
            shape: shape.clone(),
            device,
        };
        self.lock().insert(id, HostTensor { shape, device, bytes });
        handle
    }

    fn bytes_of(&self, tensor: &DeviceTensor) -> Result<Vec<u8>> {
        self.lock()
            .get(&tensor.id)
            .map(|t| t.bytes.clone())
            .ok_or_else(|| Error::Protocol(format!("unknown tensor handle {}", tensor.id)))
    }
}

/// In-process reference runtime backing tensors with host memory.
pub struct HostSession {
    storage: Arc<HostStorage>,
}

impl HostSession {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(HostStorage {
                next_id: AtomicU64::new(1),
                tensors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Read a tensor back as u32 values. Synchronizing; test/debug use only.
    pub fn read_u32(&self, tensor: &DeviceTensor) -> Result<Vec<u32>> {
        let bytes = self.storage.bytes_of(tensor)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Read a tensor back as i64 values. Synchronizing; test/debug use only.
    pub fn read_i64(&self, tensor: &DeviceTensor) -> Result<Vec<i64>> {
        let bytes = self.storage.bytes_of(tensor)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            })
            .collect())
    }

    /// Read raw tensor bytes. Synchronizing; test/debug use only.
    pub fn read_bytes(&self, tensor: &DeviceTensor) -> Result<Vec<u8>> {
        self.storage.bytes_of(tensor)
    }

    /// Overwrite raw bytes at `offset`. Stands in for the model writing KV
    /// projections into block storage; test use only.
    pub fn write_bytes(&self, tensor: &DeviceTensor, offset: usize, data: &[u8]) -> Result<()> {
        let mut tensors = self.storage.lock();
        let t = tensors
            .get_mut(&tensor.id)
            .ok_or_else(|| Error::Protocol(format!("unknown tensor handle {}", tensor.id)))?;
        if offset + data.len() > t.bytes.len() {
            return Err(Error::Protocol("tensor write out of bounds".into()));
        }
        t.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Default for HostSession {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceSession for HostSession {
    fn alloc(&self, device: &Device, shape: &[usize], elem_bytes: usize) -> Result<DeviceTensor> {
        let num_bytes = shape.iter().product::<usize>() * elem_bytes;
        debug!(device = device.id, num_bytes, "allocating device tensor");
        Ok(self
            .storage
            .insert(shape.to_vec(), device.id, vec![0u8; num_bytes]))
    }

    fn upload_u32(&self, device: &Device, shape: &[usize], data: &[u32]) -> Result<DeviceTensor> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(Error::Protocol("upload shape/data length mismatch".into()));
        }
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(self.storage.insert(shape.to_vec(), device.id, bytes))
    }

    fn upload_i64(&self, device: &Device, shape: &[usize], data: &[i64]) -> Result<DeviceTensor> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(Error::Protocol("upload shape/data length mismatch".into()));
        }
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Ok(self.storage.insert(shape.to_vec(), device.id, bytes))
    }

    fn load(&self, graph: KernelGraph) -> Result<Box<dyn CompiledKernel>> {
        debug!(kernel = graph.name(), "loading kernel");
        match graph {
            KernelGraph::CowStridedMemcpy { block_shape, dtype } => {
                Ok(Box::new(HostCowStridedMemcpy {
                    storage: Arc::clone(&self.storage),
                    block_shape,
                    elem_bytes: dtype.size_in_bytes(),
                }))
            }
            KernelGraph::UpdateCacheLengths { num_devices } => {
                Ok(Box::new(HostUpdateCacheLengths {
                    storage: Arc::clone(&self.storage),
                    num_devices,
                }))
            }
            KernelGraph::UpdateStartPos => Ok(Box::new(HostUpdateStartPos {
                storage: Arc::clone(&self.storage),
            })),
        }
    }
}

fn expect_u32(args: &[KernelValue], idx: usize) -> Result<u32> {
    match args.get(idx) {
        Some(KernelValue::U32(v)) => Ok(*v),
        _ => Err(Error::Protocol(format!("kernel arg {idx} must be a u32 scalar"))),
    }
}

fn expect_tensor<'a>(args: &'a [KernelValue], idx: usize) -> Result<&'a DeviceTensor> {
    match args.get(idx) {
        Some(KernelValue::Tensor(t)) => Ok(t),
        _ => Err(Error::Protocol(format!("kernel arg {idx} must be a tensor"))),
    }
}

/// Host implementation of `kv_collection_cow_strided_memcpy.paged`.
///
/// Args: `(dst_block: u32, src_block: u32, num_tokens: u32, *buffers)`.
/// Copies the first `num_tokens` token slots, each a full
/// `[num_layers, 2, n_kv_heads, head_dim]` stride, in every per-device buffer.
struct HostCowStridedMemcpy {
    storage: Arc<HostStorage>,
    block_shape: [usize; 6],
    elem_bytes: usize,
}

impl CompiledKernel for HostCowStridedMemcpy {
    fn execute(&self, args: &[KernelValue]) -> Result<Vec<DeviceTensor>> {
        let dst_block = expect_u32(args, 0)? as usize;
        let src_block = expect_u32(args, 1)? as usize;
        let num_tokens = expect_u32(args, 2)? as usize;

        let [num_blocks, page_size, layers, kv, heads, dim] = self.block_shape;
        if dst_block >= num_blocks || src_block >= num_blocks || num_tokens > page_size {
            return Err(Error::Protocol("cow memcpy args out of range".into()));
        }
        if dst_block == src_block {
            return Err(Error::Protocol("cow memcpy onto the source block".into()));
        }
        let slot_bytes = layers * kv * heads * dim * self.elem_bytes;
        let block_bytes = page_size * slot_bytes;

        for arg in &args[3..] {
            let KernelValue::Tensor(buffer) = arg else {
                return Err(Error::Protocol("cow memcpy buffers must be tensors".into()));
            };
            let mut tensors = self.storage.lock();
            let t = tensors
                .get_mut(&buffer.id)
                .ok_or_else(|| Error::Protocol(format!("unknown tensor handle {}", buffer.id)))?;
            for slot in 0..num_tokens {
                let src_off = src_block * block_bytes + slot * slot_bytes;
                let dst_off = dst_block * block_bytes + slot * slot_bytes;
                let (lo, hi) = if dst_off < src_off {
                    let (a, b) = t.bytes.split_at_mut(src_off);
                    (&mut a[dst_off..dst_off + slot_bytes], &b[..slot_bytes])
                } else {
                    let (a, b) = t.bytes.split_at_mut(dst_off);
                    (&mut b[..slot_bytes], &a[src_off..src_off + slot_bytes])
                };
                lo.copy_from_slice(hi);
            }
        }
        debug!(dst_block, src_block, num_tokens, "cow strided memcpy");
        Ok(Vec::new())
    }
}

/// Host implementation of `update_cache_lengths`.
///
/// Args: `(input_row_offsets, cache_lengths per device)`. Produces one new
/// cache-length tensor per device; inputs are left untouched.
struct HostUpdateCacheLengths {
    storage: Arc<HostStorage>,
    num_devices: usize,
}

impl CompiledKernel for HostUpdateCacheLengths {
    fn execute(&self, args: &[KernelValue]) -> Result<Vec<DeviceTensor>> {
        if args.len() != self.num_devices + 1 {
            return Err(Error::Protocol(format!(
                "update_cache_lengths expects 1 + {} args, got {}",
                self.num_devices,
                args.len()
            )));
        }
        let offsets_tensor = expect_tensor(args, 0)?;
        let offsets: Vec<u32> = self
            .storage
            .bytes_of(offsets_tensor)?
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut outputs = Vec::with_capacity(self.num_devices);
        for idx in 0..self.num_devices {
            let lengths_tensor = expect_tensor(args, idx + 1)?;
            let lengths: Vec<u32> = self
                .storage
                .bytes_of(lengths_tensor)?
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            if offsets.len() != lengths.len() + 1 {
                return Err(Error::Protocol(
                    "row offsets must have one more entry than cache lengths".into(),
                ));
            }
            let updated: Vec<u32> = lengths
                .iter()
                .enumerate()
                .map(|(i, &len)| len + (offsets[i + 1] - offsets[i]))
                .collect();
            let bytes = updated.iter().flat_map(|v| v.to_le_bytes()).collect();
            outputs.push(self.storage.insert(
                lengths_tensor.shape.clone(),
                lengths_tensor.device,
                bytes,
            ));
        }
        Ok(outputs)
    }
}

/// Host implementation of `update_start_pos`: `start_pos + tokens.shape[1]`.
struct HostUpdateStartPos {
    storage: Arc<HostStorage>,
}

impl CompiledKernel for HostUpdateStartPos {
    fn execute(&self, args: &[KernelValue]) -> Result<Vec<DeviceTensor>> {
        let start_pos_tensor = expect_tensor(args, 0)?;
        let tokens = expect_tensor(args, 1)?;
        if tokens.shape.len() != 2 {
            return Err(Error::Protocol("tokens tensor must be [batch, seq_len]".into()));
        }
        let bytes = self.storage.bytes_of(start_pos_tensor)?;
        let start_pos = i64::from_le_bytes(
            bytes
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| Error::Protocol("start_pos must be an i64 scalar".into()))?,
        );
        let new_pos = start_pos + tokens.shape[1] as i64;
        Ok(vec![self.storage.insert(
            Vec::new(),
            start_pos_tensor.device,
            new_pos.to_le_bytes().to_vec(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_and_read_back() {
        let session = HostSession::new();
        let t = session
            .upload_u32(&Device::cpu(), &[4], &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(session.read_u32(&t).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cow_memcpy_copies_leading_slots() {
        let session = HostSession::new();
        // 4 blocks, page_size 2, 1 layer, k+v, 1 head, dim 1, f16 elements:
        // slot = 1 * 2 * 1 * 1 * 2 = 4 bytes, block = 8 bytes
        let shape = [4, 2, 1, 2, 1, 1];
        let buffer = session.alloc(&Device::cpu(), &shape, 2).unwrap();
        session.write_bytes(&buffer, 8, &[9, 9, 9, 9, 7, 7, 7, 7]).unwrap();

        let kernel = session
            .load(KernelGraph::CowStridedMemcpy {
                block_shape: shape,
                dtype: DType::Float16,
            })
            .unwrap();
        kernel
            .execute(&[
                KernelValue::U32(3),
                KernelValue::U32(1),
                KernelValue::U32(1),
                KernelValue::Tensor(buffer.clone()),
            ])
            .unwrap();

        let bytes = session.read_bytes(&buffer).unwrap();
        // first slot of block 1 landed in the first slot of block 3
        assert_eq!(&bytes[24..28], &[9, 9, 9, 9]);
        // second slot of block 3 untouched
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_update_cache_lengths() {
        let session = HostSession::new();
        let device = Device::cpu();
        let offsets = session.upload_u32(&device, &[4], &[0, 3, 5, 6]).unwrap();
        let lengths = session.upload_u32(&device, &[3], &[10, 20, 30]).unwrap();
        let kernel = session
            .load(KernelGraph::UpdateCacheLengths { num_devices: 1 })
            .unwrap();
        let out = kernel
            .execute(&[KernelValue::Tensor(offsets), KernelValue::Tensor(lengths)])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(session.read_u32(&out[0]).unwrap(), vec![13, 22, 31]);
    }

    #[test]
    fn test_update_start_pos() {
        let session = HostSession::new();
        let device = Device::cpu();
        let start = session.upload_i64(&device, &[], &[7]).unwrap();
        let tokens = session.upload_i64(&device, &[2, 5], &[0; 10]).unwrap();
        let kernel = session.load(KernelGraph::UpdateStartPos).unwrap();
        let out = kernel
            .execute(&[KernelValue::Tensor(start), KernelValue::Tensor(tokens)])
            .unwrap();
        assert_eq!(session.read_i64(&out[0]).unwrap(), vec![12]);
    }
}
