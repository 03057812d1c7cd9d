//! PagedKV Core - Paged KV Cache Manager with Prefix Reuse
//!
//! This crate provides the KV cache subsystem of a batched
//! autoregressive-generation serving stack: it allocates, tracks, shares and
//! evicts fixed-size blocks of attention key/value memory across many
//! concurrently executing sequences.
//!
//! # Architecture
//!
//! - Paged block allocation with deterministic, lowest-id-first placement
//! - A reference-counted radix trie indexing committed blocks by their token
//!   runs, with LRU eviction
//! - Copy-on-write reuse of partially matching pages
//! - A fetch/step episode protocol with device-side cache-length advancement
//!   for multi-step decode (no host synchronization)
//!
//! # Example
//!
//! ```ignore
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use pagedkv_core::{Device, HostSession, KVCacheManager, KVCacheParams};
//!
//! let params = KVCacheParams::default();
//! let mut manager = KVCacheManager::new(
//!     params, 8, 4096, 32, 1024, vec![Device::gpu(0)], Arc::new(HostSession::new()),
//! )?;
//!
//! let seq_ids = manager.claim(1)?;
//! let prompts = BTreeMap::from([(seq_ids[0], prompt_tokens)]);
//! let inputs = manager.fetch(&prompts, 1)?;
//! // run the model, then:
//! manager.step(&BTreeMap::from([(seq_ids[0], generated)]))?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod types;

pub use cache::{
    BlockPool, CacheLengthIncrementer, KVCacheInputSymbols, KVCacheInputs, KVCacheInputsSequence,
    KVCacheManager, KVCacheStats, PaddedKVCacheInputs, PagedCacheMetadata, PrefixCache,
    PrevStepInputs, RaggedKVCacheInputs, RadixTrie,
};
pub use config::{CacheStrategy, DType, KVCacheParams};
pub use error::{Error, Result};
pub use session::{
    CompiledKernel, Device, DeviceTensor, HostSession, InferenceSession, KernelGraph, KernelValue,
};
pub use types::{BlockId, SeqId, TokenId};
