//! Façade over the block pool, prefix cache and per-sequence metadata.
//!
//! The serving loop claims sequence ids, then per decode iteration calls
//! `fetch` to obtain the ragged tensors the attention kernel consumes, runs
//! the model `num_steps` times (advancing cache lengths on device in
//! between), and closes the episode with one `step`. `release` returns a
//! sequence's uncommitted blocks to the pool; its committed blocks stay in
//! the trie until evicted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cache::block_pool::BlockPool;
use crate::cache::increment::{CacheLengthIncrementer, PrevStepInputs};
use crate::cache::inputs::{Dim, KVCacheInputSymbols, RaggedKVCacheInputs, TensorSymbol};
use crate::cache::metadata::{ceildiv, PagedCacheMetadata};
use crate::cache::prefix_cache::PrefixCache;
use crate::config::{CacheStrategy, KVCacheParams};
use crate::error::{Error, Result};
use crate::session::{Device, DeviceTensor, InferenceSession, KernelGraph};
use crate::types::{BlockId, SeqId, TokenId};

/// Episode bookkeeping for a sequence between `fetch` and `step`.
struct FetchMetadata {
    prompt: Vec<TokenId>,
    num_steps: usize,
}

/// Point-in-time counters, serializable for logging surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct KVCacheStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub prefix_cache_blocks: usize,
    pub stale_blocks: usize,
    pub active_sequences: usize,
    pub cache_hit_rate: f64,
    pub cow_count: u64,
}

pub struct KVCacheManager {
    params: KVCacheParams,
    max_batch_size: usize,
    max_seq_len: usize,
    num_layers: usize,
    devices: Vec<Device>,
    session: Arc<dyn InferenceSession>,
    /// Per-device block storage, passed through to the attention kernel.
    block_buffers: Vec<DeviceTensor>,
    pool: BlockPool,
    prefix_cache: PrefixCache,
    metadata: HashMap<SeqId, PagedCacheMetadata>,
    available: BTreeSet<SeqId>,
    cache_lengths: HashMap<SeqId, usize>,
    fetch_metadata: HashMap<SeqId, FetchMetadata>,
    incrementer: CacheLengthIncrementer,
}

impl KVCacheManager {
    pub fn new(
        params: KVCacheParams,
        max_batch_size: usize,
        max_seq_len: usize,
        num_layers: usize,
        total_num_blocks: usize,
        devices: Vec<Device>,
        session: Arc<dyn InferenceSession>,
    ) -> Result<Self> {
        params.validate()?;
        if params.cache_strategy != CacheStrategy::Paged {
            return Err(Error::ConfigInvalid(
                "this manager only supports the paged cache strategy".into(),
            ));
        }
        if devices.is_empty() {
            return Err(Error::ConfigInvalid("at least one device is required".into()));
        }
        if max_batch_size == 0 || max_seq_len == 0 || total_num_blocks == 0 || num_layers == 0 {
            return Err(Error::ConfigInvalid(
                "batch size, sequence length, block count and layer count must be nonzero".into(),
            ));
        }

        let block_shape = params.block_shape(total_num_blocks, num_layers);
        let elem_bytes = params.dtype.size_in_bytes();
        let mut block_buffers = Vec::with_capacity(devices.len());
        for device in &devices {
            block_buffers.push(session.alloc(device, &block_shape, elem_bytes)?);
        }

        let cow_kernel = if params.cow_in_effect() {
            Some(session.load(KernelGraph::CowStridedMemcpy {
                block_shape,
                dtype: params.dtype,
            })?)
        } else {
            None
        };
        let prefix_cache = PrefixCache::new(
            params.page_size,
            params.enable_prefix_caching,
            cow_kernel,
            block_buffers.clone(),
        );
        let incrementer = CacheLengthIncrementer::load(session.as_ref(), true, devices.len())?;

        Ok(Self {
            params,
            max_batch_size,
            max_seq_len,
            num_layers,
            devices,
            session,
            block_buffers,
            pool: BlockPool::new(total_num_blocks),
            prefix_cache,
            metadata: HashMap::new(),
            available: (0..max_batch_size).collect(),
            cache_lengths: HashMap::new(),
            fetch_metadata: HashMap::new(),
            incrementer,
        })
    }

    /// Claim `n` sequence slots. Ids are handed out smallest-first so claim
    /// order is deterministic.
    pub fn claim(&mut self, n: usize) -> Result<Vec<SeqId>> {
        if self.available.len() < n {
            return Err(Error::Capacity(format!(
                "requested {n} sequence slots, {} available",
                self.available.len()
            )));
        }
        let mut seq_ids = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(seq_id) = self.available.pop_first() else {
                break;
            };
            self.cache_lengths.insert(seq_id, 0);
            self.metadata.insert(
                seq_id,
                PagedCacheMetadata::new(self.params.page_size, self.max_seq_len),
            );
            self.prefix_cache.external_claim(seq_id)?;
            seq_ids.push(seq_id);
        }
        debug!(?seq_ids, "claimed sequences");
        Ok(seq_ids)
    }

    /// Claim caller-chosen sequence ids. Each must currently be free.
    pub fn external_claim(&mut self, seq_ids: &[SeqId]) -> Result<()> {
        for &seq_id in seq_ids {
            if !self.available.contains(&seq_id) {
                return Err(Error::Protocol(format!(
                    "sequence id {seq_id} is not available to claim"
                )));
            }
        }
        for &seq_id in seq_ids {
            self.available.remove(&seq_id);
            self.cache_lengths.insert(seq_id, 0);
            self.metadata.insert(
                seq_id,
                PagedCacheMetadata::new(self.params.page_size, self.max_seq_len),
            );
            self.prefix_cache.external_claim(seq_id)?;
        }
        Ok(())
    }

    /// Release a sequence, returning its uncommitted blocks to the pool.
    /// Valid mid-episode: an outstanding fetch is simply dropped.
    pub fn release(&mut self, seq_id: SeqId) -> Result<()> {
        if !self.cache_lengths.contains_key(&seq_id) {
            return Err(Error::UnknownSequence(seq_id));
        }
        self.prefix_cache.release(seq_id)?;
        let meta = self
            .metadata
            .remove(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;
        for &block in meta.uncommitted_blocks() {
            self.pool.free(block);
        }
        self.cache_lengths.remove(&seq_id);
        self.fetch_metadata.remove(&seq_id);
        self.available.insert(seq_id);
        debug!(seq_id, "released sequence");
        Ok(())
    }

    /// Prepare the batch for the next episode: prefix lookup, block
    /// allocation and assembly of the per-device ragged inputs.
    ///
    /// The whole batch is validated and admitted against free plus evictable
    /// blocks before any state changes, so a failing call leaves the manager
    /// untouched.
    pub fn fetch(
        &mut self,
        seq_ids_and_prompts: &BTreeMap<SeqId, Vec<TokenId>>,
        num_steps: usize,
    ) -> Result<Vec<RaggedKVCacheInputs>> {
        if num_steps == 0 {
            return Err(Error::Protocol("fetch requires num_steps >= 1".into()));
        }
        let page_size = self.params.page_size;
        let mut demand = 0usize;
        let mut admitted_hits: BTreeSet<BlockId> = BTreeSet::new();
        for (&seq_id, prompt) in seq_ids_and_prompts {
            let meta = self
                .metadata
                .get(&seq_id)
                .ok_or(Error::UnknownSequence(seq_id))?;
            if self.fetch_metadata.contains_key(&seq_id) {
                return Err(Error::Protocol(format!(
                    "sequence {seq_id} already has an outstanding fetch"
                )));
            }
            if prompt.is_empty() {
                return Err(Error::Protocol(format!(
                    "sequence {seq_id} was fetched with an empty prompt"
                )));
            }
            if !meta.prompt_tokens().is_empty() || !meta.inflight_tokens().is_empty() {
                return Err(Error::Protocol(format!(
                    "sequence {seq_id} still has an open episode"
                )));
            }
            let new_seq_len = meta.seq_len() + prompt.len() + (num_steps - 1);
            if new_seq_len > self.max_seq_len {
                return Err(Error::Capacity(format!(
                    "sequence {seq_id} would grow to {new_seq_len} tokens (max {})",
                    self.max_seq_len
                )));
            }
            // probe the trie read-only to credit prefix hits against demand
            let mut probe: Vec<TokenId> = meta.committable_tokens().to_vec();
            probe.extend_from_slice(prompt);
            probe.pop();
            let hits = self.prefix_cache.peek_hit_blocks(seq_id, &probe);
            demand += ceildiv(new_seq_len, page_size)
                .saturating_sub(meta.blocks().len() + hits.len());
            admitted_hits.extend(hits);
        }
        let stale = self.prefix_cache.stale_blocks();
        let supply = self.pool.num_free()
            + stale.iter().filter(|b| !admitted_hits.contains(b)).count();
        if demand > supply {
            return Err(Error::OutOfBlocks(format!(
                "batch needs {demand} new blocks, {supply} available after eviction"
            )));
        }

        // Admitted. Shield the matched blocks so one sequence's eviction
        // cannot consume a hit another sequence was admitted against.
        self.prefix_cache.protect_blocks(admitted_hits);
        let result = self.fetch_apply(seq_ids_and_prompts, num_steps);
        self.prefix_cache.clear_protected();
        result
    }

    fn fetch_apply(
        &mut self,
        seq_ids_and_prompts: &BTreeMap<SeqId, Vec<TokenId>>,
        num_steps: usize,
    ) -> Result<Vec<RaggedKVCacheInputs>> {
        let page_size = self.params.page_size;
        for (&seq_id, prompt) in seq_ids_and_prompts {
            let meta = self
                .metadata
                .get_mut(&seq_id)
                .ok_or(Error::UnknownSequence(seq_id))?;
            meta.fetch(prompt, num_steps)?;
            self.prefix_cache.fetch(seq_id, meta, &mut self.pool)?;
            let blocks_needed = ceildiv(meta.seq_len(), page_size);
            while meta.blocks().len() < blocks_needed {
                let block = self.prefix_cache.alloc_block(&mut self.pool)?;
                meta.blocks.push(block);
            }
            debug!(
                seq_id,
                prompt_len = meta.prompt_tokens().len(),
                num_blocks = meta.blocks().len(),
                "fetched sequence"
            );
        }
        for (&seq_id, prompt) in seq_ids_and_prompts {
            self.fetch_metadata.insert(
                seq_id,
                FetchMetadata {
                    prompt: prompt.clone(),
                    num_steps,
                },
            );
        }
        self.assemble_inputs(seq_ids_and_prompts, num_steps)
    }

    fn assemble_inputs(
        &self,
        batch: &BTreeMap<SeqId, Vec<TokenId>>,
        num_steps: usize,
    ) -> Result<Vec<RaggedKVCacheInputs>> {
        let seq_ids: Vec<SeqId> = batch.keys().copied().collect();
        let batch_size = seq_ids.len();
        let mut max_blocks_per_seq = 0;
        for seq_id in &seq_ids {
            let meta = self.meta(*seq_id)?;
            max_blocks_per_seq = max_blocks_per_seq.max(meta.blocks().len());
        }

        let mut lookup = vec![0u32; batch_size * max_blocks_per_seq];
        let mut lengths = Vec::with_capacity(batch_size);
        for (row, seq_id) in seq_ids.iter().enumerate() {
            let meta = self.meta(*seq_id)?;
            for (col, &block) in meta.blocks().iter().enumerate() {
                lookup[row * max_blocks_per_seq + col] = block as u32;
            }
            lengths.push(meta.cached_idx() as u32);
        }
        let max_lengths = self.max_lengths_rows(&seq_ids, num_steps)?;

        let mut inputs = Vec::with_capacity(self.devices.len());
        for (i, device) in self.devices.iter().enumerate() {
            let cache_lengths = self.session.upload_u32(device, &[batch_size], &lengths)?;
            let lookup_table =
                self.session
                    .upload_u32(device, &[batch_size, max_blocks_per_seq], &lookup)?;
            inputs.push(RaggedKVCacheInputs {
                blocks: self.block_buffers[i].clone(),
                cache_lengths,
                lookup_table,
                max_lengths: max_lengths.clone(),
            });
        }
        Ok(inputs)
    }

    /// Row `i` carries the batch maxima the attention kernel needs at step
    /// `i`: after the first step every row feeds one new token and its cache
    /// has absorbed the prompt plus the earlier steps.
    fn max_lengths_rows(&self, seq_ids: &[SeqId], num_steps: usize) -> Result<Vec<[u32; 2]>> {
        let mut rows = Vec::with_capacity(num_steps);
        for step in 0..num_steps {
            let mut max_prompt = 0u32;
            let mut max_cache = 0u32;
            for &seq_id in seq_ids {
                let meta = self.meta(seq_id)?;
                let prompt_len = meta.prompt_tokens().len();
                let (prompt, cache) = if step == 0 {
                    (prompt_len, meta.cached_idx())
                } else {
                    (1, meta.cached_idx() + prompt_len + step - 1)
                };
                max_prompt = max_prompt.max(prompt as u32);
                max_cache = max_cache.max(cache as u32);
            }
            rows.push([max_prompt, max_cache]);
        }
        Ok(rows)
    }

    /// Close the episodes opened by the matching `fetch`: write the new
    /// tokens, commit page-aligned prefixes into the prefix cache and
    /// advance the per-sequence cache lengths.
    pub fn step(&mut self, seq_ids_and_new_tokens: &BTreeMap<SeqId, Vec<TokenId>>) -> Result<()> {
        for (&seq_id, new_tokens) in seq_ids_and_new_tokens {
            let meta = self
                .metadata
                .get(&seq_id)
                .ok_or(Error::UnknownSequence(seq_id))?;
            let fetched = self.fetch_metadata.get(&seq_id).ok_or_else(|| {
                Error::Protocol(format!("step without a matching fetch for sequence {seq_id}"))
            })?;
            if new_tokens.len() != fetched.num_steps {
                return Err(Error::Protocol(format!(
                    "sequence {seq_id} was fetched for {} steps but stepped with {} tokens",
                    fetched.num_steps,
                    new_tokens.len()
                )));
            }
            if meta.inflight_tokens().len() + 1 != new_tokens.len() {
                return Err(Error::Protocol(format!(
                    "sequence {seq_id} has {} inflight slots for {} new tokens",
                    meta.inflight_tokens().len(),
                    new_tokens.len()
                )));
            }
        }
        for (&seq_id, new_tokens) in seq_ids_and_new_tokens {
            let meta = self
                .metadata
                .get_mut(&seq_id)
                .ok_or(Error::UnknownSequence(seq_id))?;
            meta.step(new_tokens)?;
            self.prefix_cache.step(seq_id, meta, &mut self.pool)?;
            let fetched = self
                .fetch_metadata
                .remove(&seq_id)
                .ok_or(Error::UnknownSequence(seq_id))?;
            let length = self
                .cache_lengths
                .get_mut(&seq_id)
                .ok_or(Error::UnknownSequence(seq_id))?;
            *length += fetched.prompt.len() + fetched.num_steps - 1;
            debug!(seq_id, cache_length = *length, "stepped sequence");
        }
        Ok(())
    }

    /// Produce the next invocation's inputs within a multi-step episode.
    /// Enqueue-only; nothing is read back on the host.
    pub fn increment_cache_lengths(
        &self,
        inputs: Vec<RaggedKVCacheInputs>,
        prev: &PrevStepInputs,
    ) -> Result<Vec<RaggedKVCacheInputs>> {
        let PrevStepInputs::Ragged { input_row_offsets } = prev else {
            return Err(Error::Protocol(
                "the paged manager produces ragged inputs".into(),
            ));
        };
        self.incrementer.increment_ragged(inputs, input_row_offsets)
    }

    pub fn contains(&self, seq_id: SeqId) -> bool {
        self.cache_lengths.contains_key(&seq_id)
    }

    /// Sequence slots still claimable.
    pub fn slots_remaining(&self) -> usize {
        self.available.len()
    }

    /// Longest cache length across active sequences.
    pub fn max_sequence_length(&self) -> usize {
        self.cache_lengths.values().copied().max().unwrap_or(0)
    }

    pub fn cache_length(&self, seq_id: SeqId) -> Result<usize> {
        self.cache_lengths
            .get(&seq_id)
            .copied()
            .ok_or(Error::UnknownSequence(seq_id))
    }

    pub fn cache_hit_rate(&self) -> f64 {
        self.prefix_cache.cache_hit_rate()
    }

    pub fn cow_count(&self) -> u64 {
        self.prefix_cache.cow_count()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn params(&self) -> &KVCacheParams {
        &self.params
    }

    /// Number of KV-cache inputs per device consumed by the model.
    pub fn num_kv_inputs(&self) -> usize {
        4
    }

    /// Shape descriptors for the kernel-facing inputs, one set per device.
    pub fn input_symbols(&self) -> Vec<KVCacheInputSymbols> {
        let symbols = KVCacheInputSymbols {
            kv_blocks: TensorSymbol {
                name: "kv_blocks",
                dims: vec![
                    Dim::Dynamic("total_num_pages"),
                    Dim::Fixed(self.params.page_size),
                    Dim::Fixed(self.num_layers),
                    Dim::Fixed(2),
                    Dim::Fixed(self.params.n_kv_heads),
                    Dim::Fixed(self.params.head_dim),
                ],
            },
            cache_lengths: TensorSymbol {
                name: "cache_lengths",
                dims: vec![Dim::Dynamic("batch_size")],
            },
            lookup_table: TensorSymbol {
                name: "lookup_table",
                dims: vec![Dim::Dynamic("batch_size"), Dim::Dynamic("max_num_pages")],
            },
            max_lengths: TensorSymbol {
                name: "max_lengths",
                dims: vec![Dim::Dynamic("steps_remaining"), Dim::Fixed(2)],
            },
        };
        vec![symbols; self.devices.len()]
    }

    /// Device memory the cache would use for the given budget, rounded down
    /// to whole blocks.
    pub fn estimated_memory_size(
        params: &KVCacheParams,
        num_layers: usize,
        available_cache_memory: usize,
        num_devices: usize,
    ) -> usize {
        let block_bytes = params.block_size_in_bytes(num_layers);
        if block_bytes == 0 {
            return 0;
        }
        (available_cache_memory / block_bytes) * block_bytes * num_devices
    }

    /// Batch size whose worst-case block demand fits the memory budget.
    pub fn infer_optimal_batch_size(
        params: &KVCacheParams,
        max_seq_len: usize,
        num_layers: usize,
        available_cache_memory: usize,
    ) -> usize {
        let block_bytes = params.block_size_in_bytes(num_layers);
        if block_bytes == 0 || max_seq_len == 0 {
            return 1;
        }
        let blocks_available = available_cache_memory / block_bytes;
        let blocks_per_seq = ceildiv(max_seq_len, params.page_size);
        (blocks_available / blocks_per_seq).max(1)
    }

    pub fn stats(&self) -> KVCacheStats {
        KVCacheStats {
            total_blocks: self.pool.total_blocks(),
            free_blocks: self.pool.num_free(),
            prefix_cache_blocks: self.prefix_cache.blocks().len(),
            stale_blocks: self.prefix_cache.stale_blocks().len(),
            active_sequences: self.cache_lengths.len(),
            cache_hit_rate: self.prefix_cache.cache_hit_rate(),
            cow_count: self.prefix_cache.cow_count(),
        }
    }

    pub fn prefix_cache(&self) -> &PrefixCache {
        &self.prefix_cache
    }

    pub fn metadata(&self, seq_id: SeqId) -> Result<&PagedCacheMetadata> {
        self.meta(seq_id)
    }

    fn meta(&self, seq_id: SeqId) -> Result<&PagedCacheMetadata> {
        self.metadata
            .get(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))
    }

    /// Sweep the structural invariants. Panics on violation; meant for tests
    /// and debug builds, not the serving path.
    pub fn assert_invariants(&self) {
        for (seq_id, meta) in &self.metadata {
            if let Err(err) = meta.validate() {
                panic!("sequence {seq_id}: {err}");
            }
        }
        // block ids partition into free, sequence-owned and trie-owned
        let mut seen: BTreeSet<BlockId> = self.pool.free_blocks().clone();
        for (seq_id, meta) in &self.metadata {
            for &block in meta.uncommitted_blocks() {
                assert!(
                    seen.insert(block),
                    "block {block} of sequence {seq_id} is owned twice"
                );
            }
        }
        for block in self.prefix_cache.blocks() {
            assert!(seen.insert(block), "trie block {block} is owned twice");
        }
        assert_eq!(
            seen.len(),
            self.pool.total_blocks(),
            "some block ids are unaccounted for"
        );
        if let Err(err) = self.prefix_cache.validate_refcounts() {
            panic!("{err}");
        }
        assert!(self.prefix_cache.cache_hit_tokens() <= self.prefix_cache.all_tokens());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::HostSession;

    fn manager(total_blocks: usize, page_size: usize) -> KVCacheManager {
        let params = KVCacheParams {
            n_kv_heads: 1,
            head_dim: 2,
            page_size,
            ..Default::default()
        };
        KVCacheManager::new(
            params,
            4,
            64,
            1,
            total_blocks,
            vec![Device::cpu()],
            Arc::new(HostSession::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_claim_is_deterministic_smallest_first() {
        let mut manager = manager(8, 4);
        assert_eq!(manager.claim(2).unwrap(), vec![0, 1]);
        assert_eq!(manager.claim(1).unwrap(), vec![2]);
        manager.release(0).unwrap();
        assert_eq!(manager.claim(1).unwrap(), vec![0]);
    }

    #[test]
    fn test_claim_then_release_restores_pool_state() {
        let mut manager = manager(8, 4);
        let free_before = manager.pool.num_free();
        let slots_before = manager.slots_remaining();
        let seq_ids = manager.claim(2).unwrap();
        for seq_id in seq_ids {
            manager.release(seq_id).unwrap();
        }
        assert_eq!(manager.pool.num_free(), free_before);
        assert_eq!(manager.slots_remaining(), slots_before);
        manager.assert_invariants();
    }

    #[test]
    fn test_claim_beyond_capacity() {
        let mut manager = manager(8, 4);
        assert!(matches!(manager.claim(5), Err(Error::Capacity(_))));
        // the failed claim consumed nothing
        assert_eq!(manager.slots_remaining(), 4);
    }

    #[test]
    fn test_external_claim_rejects_taken_ids() {
        let mut manager = manager(8, 4);
        manager.external_claim(&[1, 3]).unwrap();
        assert!(manager.contains(1));
        assert!(matches!(
            manager.external_claim(&[1]),
            Err(Error::Protocol(_))
        ));
        assert_eq!(manager.claim(2).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_step_without_fetch_is_a_protocol_error() {
        let mut manager = manager(8, 4);
        let seq_ids = manager.claim(1).unwrap();
        let steps: BTreeMap<_, _> = [(seq_ids[0], vec![5u32])].into();
        assert!(matches!(manager.step(&steps), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_release_unknown_sequence() {
        let mut manager = manager(8, 4);
        assert!(matches!(
            manager.release(3),
            Err(Error::UnknownSequence(3))
        ));
    }

    #[test]
    fn test_num_steps_mismatch_is_a_protocol_error() {
        let mut manager = manager(8, 4);
        let seq_ids = manager.claim(1).unwrap();
        let prompts: BTreeMap<_, _> = [(seq_ids[0], vec![1u32, 2, 3])].into();
        manager.fetch(&prompts, 2).unwrap();
        let steps: BTreeMap<_, _> = [(seq_ids[0], vec![4u32])].into();
        assert!(matches!(manager.step(&steps), Err(Error::Protocol(_))));
        // the failed step left the episode open
        let steps: BTreeMap<_, _> = [(seq_ids[0], vec![4u32, 5])].into();
        manager.step(&steps).unwrap();
        manager.assert_invariants();
    }

    #[test]
    fn test_continuous_strategy_rejected_at_construction() {
        let params = KVCacheParams {
            n_kv_heads: 1,
            head_dim: 2,
            cache_strategy: CacheStrategy::Continuous,
            enable_prefix_caching: false,
            ..Default::default()
        };
        let result = KVCacheManager::new(
            params,
            4,
            64,
            1,
            8,
            vec![Device::cpu()],
            Arc::new(HostSession::new()),
        );
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_memory_sizing_helpers() {
        let params = KVCacheParams {
            n_kv_heads: 1,
            head_dim: 2,
            page_size: 4,
            ..Default::default()
        };
        let block_bytes = params.block_size_in_bytes(1);
        assert_eq!(
            KVCacheManager::estimated_memory_size(&params, 1, 10 * block_bytes + 3, 1),
            10 * block_bytes
        );
        // 10 blocks, 2 blocks per max-length sequence
        assert_eq!(
            KVCacheManager::infer_optimal_batch_size(&params, 8, 1, 10 * block_bytes),
            5
        );
    }

    #[test]
    fn test_input_symbols_cover_the_four_ragged_inputs() {
        let manager = manager(8, 4);
        let symbols = manager.input_symbols();
        assert_eq!(symbols.len(), 1);
        assert_eq!(manager.num_kv_inputs(), 4);
        assert_eq!(symbols[0].kv_blocks.dims.len(), 6);
        assert_eq!(
            symbols[0].max_lengths.dims,
            vec![Dim::Dynamic("steps_remaining"), Dim::Fixed(2)]
        );
    }

    #[test]
    fn test_stats_serialize() {
        let manager = manager(8, 4);
        let stats = manager.stats();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"total_blocks\":8"));
    }
}
