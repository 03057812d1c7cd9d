//! Tensor bundles exchanged with the attention kernel.

use crate::session::DeviceTensor;

/// Ragged per-device inputs to the attention kernel.
#[derive(Debug, Clone)]
pub struct RaggedKVCacheInputs {
    /// Block storage, `[num_blocks, page_size, num_layers, 2, n_kv_heads, head_dim]`.
    /// Layout is opaque to the manager and only passed through.
    pub blocks: DeviceTensor,
    /// Cached token count per batch row, u32 `[batch]`
    pub cache_lengths: DeviceTensor,
    /// Ordered block ids backing each row, u32 `[batch, max_blocks_per_seq]`
    pub lookup_table: DeviceTensor,
    /// Host-resident rows of `(max prompt length, max cache length)`, one per
    /// step, consumed row by row across a multi-step episode
    pub max_lengths: Vec<[u32; 2]>,
}

/// Padded per-device inputs (legacy layout).
#[derive(Debug, Clone)]
pub struct PaddedKVCacheInputs {
    pub k_cache: DeviceTensor,
    pub v_cache: DeviceTensor,
    pub start_pos: DeviceTensor,
    pub null_op: DeviceTensor,
}

/// Inputs for one model invocation, one entry per device.
#[derive(Debug, Clone)]
pub enum KVCacheInputs {
    Ragged(Vec<RaggedKVCacheInputs>),
    Padded(Vec<PaddedKVCacheInputs>),
}

impl KVCacheInputs {
    pub fn num_devices(&self) -> usize {
        match self {
            Self::Ragged(inputs) => inputs.len(),
            Self::Padded(inputs) => inputs.len(),
        }
    }
}

/// Batched inputs across the invocations of a multi-step episode.
#[derive(Debug, Clone)]
pub struct KVCacheInputsSequence {
    pub kv_cache_inputs: Vec<KVCacheInputs>,
}

/// One dimension of an input symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    Dynamic(&'static str),
}

/// Shape descriptor for one kernel-facing tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSymbol {
    pub name: &'static str,
    pub dims: Vec<Dim>,
}

/// The four ragged input symbols, per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCacheInputSymbols {
    pub kv_blocks: TensorSymbol,
    pub cache_lengths: TensorSymbol,
    pub lookup_table: TensorSymbol,
    pub max_lengths: TensorSymbol,
}
