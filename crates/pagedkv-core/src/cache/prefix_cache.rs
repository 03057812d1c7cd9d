//! Prefix cache: reuse of committed KV projections across sequences.
//!
//! Wraps the radix trie with per-sequence cursors. `fetch` pulls committed
//! blocks out of the trie for a new prompt (and COW-copies partial pages);
//! `step` pushes freshly computed pages back in. Blocks handed out here are
//! shared and refcounted; a sequence only ever owns its uncommitted tail.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::cache::block_pool::BlockPool;
use crate::cache::metadata::PagedCacheMetadata;
use crate::cache::radix_trie::{NodeId, RadixTrie};
use crate::error::{Error, Result};
use crate::session::{CompiledKernel, DeviceTensor, KernelValue};
use crate::types::{BlockId, SeqId, TokenId};

pub struct PrefixCache {
    page_size: usize,
    enabled: bool,
    trie: RadixTrie,
    /// Deepest committed trie node per active sequence.
    current_node: HashMap<SeqId, NodeId>,
    all_tokens: u64,
    cache_hit_tokens: u64,
    cow_count: u64,
    /// Loaded `kv_collection_cow_strided_memcpy.paged` kernel, present when
    /// COW is in effect.
    cow_kernel: Option<Box<dyn CompiledKernel>>,
    /// Per-device block buffers passed through to the COW kernel.
    block_buffers: Vec<DeviceTensor>,
    /// Blocks shielded from eviction for the duration of a batched fetch.
    protected: BTreeSet<BlockId>,
}

impl PrefixCache {
    pub fn new(
        page_size: usize,
        enabled: bool,
        cow_kernel: Option<Box<dyn CompiledKernel>>,
        block_buffers: Vec<DeviceTensor>,
    ) -> Self {
        Self {
            page_size,
            enabled,
            trie: RadixTrie::new(page_size),
            current_node: HashMap::new(),
            all_tokens: 0,
            cache_hit_tokens: 0,
            cow_count: 0,
            cow_kernel,
            block_buffers,
            protected: BTreeSet::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Start tracking a sequence, with its cursor at the trie root.
    pub fn external_claim(&mut self, seq_id: SeqId) -> Result<()> {
        if self.current_node.contains_key(&seq_id) {
            return Err(Error::Protocol(format!(
                "sequence {seq_id} already claimed by the prefix cache"
            )));
        }
        self.current_node.insert(seq_id, self.trie.root());
        Ok(())
    }

    /// Stop tracking a sequence and drop its references on the committed
    /// path, making those blocks candidates for eviction.
    pub fn release(&mut self, seq_id: SeqId) -> Result<()> {
        let node = self
            .current_node
            .remove(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;
        self.trie.mark_not_in_use_by(node, seq_id);
        Ok(())
    }

    /// Extend the sequence with any committed blocks matching its prompt.
    /// Advances `committed_idx`/`cached_idx` on a hit, which trims the
    /// effective prompt. Returns the reused blocks.
    pub fn fetch(
        &mut self,
        seq_id: SeqId,
        meta: &mut PagedCacheMetadata,
        pool: &mut BlockPool,
    ) -> Result<Vec<BlockId>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let node = *self
            .current_node
            .get(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;

        // Match all but the last committable token: the model needs at least
        // one prompt token to produce a logit.
        let committable = meta.committable_tokens();
        if committable.len() <= 1 {
            return Ok(Vec::new());
        }
        let probe_len = committable.len() - 1;
        let (node, prefix_blocks) = self.trie.match_prefix(&committable[..probe_len], node);
        self.current_node.insert(seq_id, node);
        self.trie.mark_in_use_by(node, seq_id);

        let hit_tokens = prefix_blocks.len() * self.page_size;
        self.cache_hit_tokens += hit_tokens as u64;
        self.all_tokens += probe_len as u64;

        // A partially cached uncommitted block whose tokens the retrieved
        // prefix now covers is discarded in favor of the shared blocks.
        if meta.committed_idx < meta.cached_idx && hit_tokens > 0 {
            debug_assert!(meta.committed_idx + hit_tokens > meta.cached_idx);
            self.release_partial_block(meta, pool);
        }

        meta.blocks.extend_from_slice(&prefix_blocks);
        meta.committed_idx += hit_tokens;
        meta.cached_idx += hit_tokens;
        if hit_tokens > 0 {
            debug!(seq_id, hit_tokens, "prefix cache hit");
        }

        if self.cow_kernel.is_some() {
            self.fetch_cow(seq_id, meta, pool)?;
        }
        Ok(prefix_blocks)
    }

    /// Discard the partially cached, uncommitted trailing block.
    fn release_partial_block(&self, meta: &mut PagedCacheMetadata, pool: &mut BlockPool) {
        debug_assert!(meta.committed_idx < meta.cached_idx);
        debug_assert_eq!(meta.committable_blocks().len(), 1);
        if let Some(&block) = meta.committable_blocks().last() {
            pool.free(block);
            meta.blocks.pop();
        }
        let partial_tokens = meta.cached_idx - meta.committed_idx;
        debug_assert!(partial_tokens < self.page_size);
        meta.cached_idx -= partial_tokens;
    }

    /// Reuse a committed block that shares only part of the next page by
    /// copying its first `k` token slots into a fresh private block.
    /// `committed_idx` is unchanged: COW blocks are not in the trie.
    fn fetch_cow(
        &mut self,
        seq_id: SeqId,
        meta: &mut PagedCacheMetadata,
        pool: &mut BlockPool,
    ) -> Result<()> {
        let committable = meta.committable_tokens();
        if committable.len() <= 1 {
            return Ok(());
        }
        let probe = &committable[..committable.len() - 1];
        let candidate = &probe[..probe.len().min(self.page_size)];
        let node = *self
            .current_node
            .get(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;
        let Some((src_block, num_tokens)) =
            self.trie.find_block_with_largest_common_prefix(node, candidate)
        else {
            return Ok(());
        };
        debug_assert!(num_tokens > 0 && num_tokens < self.page_size);

        // No gain if the existing partial block already caches as much.
        let partial_tokens = meta.cached_idx - meta.committed_idx;
        if num_tokens <= partial_tokens {
            return Ok(());
        }

        // Allocate the destination before touching sequence state; COW is
        // opportunistic and a failed allocation just skips it. The source
        // must survive any eviction the allocation triggers.
        let dst_block = match self.alloc_block_impl(pool, Some(src_block)) {
            Ok(block) => block,
            Err(_) => return Ok(()),
        };

        let mut args = vec![
            KernelValue::U32(dst_block as u32),
            KernelValue::U32(src_block as u32),
            KernelValue::U32(num_tokens as u32),
        ];
        args.extend(self.block_buffers.iter().cloned().map(KernelValue::Tensor));
        let launched = match &self.cow_kernel {
            Some(kernel) => kernel.execute(&args),
            None => {
                pool.free(dst_block);
                return Ok(());
            }
        };
        if let Err(err) = launched {
            pool.free(dst_block);
            return Err(err);
        }

        if partial_tokens > 0 {
            self.release_partial_block(meta, pool);
        }
        self.cow_count += 1;
        meta.blocks.push(dst_block);
        meta.cached_idx += num_tokens;
        debug_assert!(!meta.prompt_tokens().is_empty());
        debug_assert!(meta.cached_idx < meta.inflight_idx);
        debug!(seq_id, src_block, dst_block, num_tokens, "cow partial block reuse");
        Ok(())
    }

    /// Commit the page-aligned prefix of the sequence's freshly computed
    /// tokens into the trie. Pages another sequence committed first are
    /// adopted and the duplicate blocks freed.
    pub fn step(
        &mut self,
        seq_id: SeqId,
        meta: &mut PagedCacheMetadata,
        pool: &mut BlockPool,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let node = *self
            .current_node
            .get(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;

        let committable = meta.committable_tokens_aligned().to_vec();
        let (node, existing) = self.trie.match_prefix(&committable, node);
        self.current_node.insert(seq_id, node);

        // Adopt the canonical block wherever our computed page duplicates one
        // already in the trie.
        let committed_block_idx = meta.committed_idx / self.page_size;
        for (i, &canonical) in existing.iter().enumerate() {
            let mine = meta.blocks[committed_block_idx + i];
            if mine != canonical {
                pool.free(mine);
                meta.blocks[committed_block_idx + i] = canonical;
                debug!(seq_id, freed = mine, adopted = canonical, "adopted canonical block");
            }
        }
        meta.committed_idx += existing.len() * self.page_size;

        let remaining_tokens = meta.committable_tokens_aligned().to_vec();
        let remaining_blocks = meta.committable_blocks_aligned().to_vec();
        debug_assert_eq!(remaining_tokens.len(), remaining_blocks.len() * self.page_size);
        let (node, superseded) = self.trie.insert(&remaining_tokens, &remaining_blocks, node)?;
        self.current_node.insert(seq_id, node);
        let base = meta.committed_idx / self.page_size;
        for (i, existing_block) in superseded {
            let mine = meta.blocks[base + i];
            pool.free(mine);
            meta.blocks[base + i] = existing_block;
        }
        meta.committed_idx += remaining_tokens.len();

        self.trie.mark_in_use_by(node, seq_id);
        Ok(())
    }

    /// Allocate a block, reclaiming trie blocks through LRU eviction when the
    /// pool is dry.
    pub fn alloc_block(&mut self, pool: &mut BlockPool) -> Result<BlockId> {
        self.alloc_block_impl(pool, None)
    }

    fn alloc_block_impl(
        &mut self,
        pool: &mut BlockPool,
        also_protect: Option<BlockId>,
    ) -> Result<BlockId> {
        if let Some(block) = pool.alloc() {
            return Ok(block);
        }
        let reclaimed = match also_protect {
            Some(extra) => {
                let mut protected = self.protected.clone();
                protected.insert(extra);
                self.trie.evict_blocks_guarded(1, &protected)
            }
            None => self.trie.evict_blocks_guarded(1, &self.protected),
        };
        for &block in &reclaimed {
            pool.free(block);
        }
        pool.alloc().ok_or_else(|| {
            Error::OutOfBlocks(format!(
                "no free or evictable blocks ({} total)",
                pool.total_blocks()
            ))
        })
    }

    /// Evict up to `blocks_to_evict` blocks (all evictable blocks when
    /// `None`), returning the reclaimed ids.
    pub fn evict_blocks(&mut self, blocks_to_evict: Option<usize>) -> Vec<BlockId> {
        let desired = blocks_to_evict.unwrap_or_else(|| self.trie.all_blocks().len());
        self.trie.evict_blocks(desired)
    }

    /// Shield blocks from eviction until `clear_protected`. Used while a
    /// batched fetch relies on matches it has admitted but not yet applied.
    pub(crate) fn protect_blocks(&mut self, blocks: impl IntoIterator<Item = BlockId>) {
        self.protected.extend(blocks);
    }

    pub(crate) fn clear_protected(&mut self) {
        self.protected.clear();
    }

    /// Blocks a prompt would reuse, without touching recency or counters.
    pub(crate) fn peek_hit_blocks(&self, seq_id: SeqId, probe: &[TokenId]) -> Vec<BlockId> {
        if !self.enabled {
            return Vec::new();
        }
        let node = self
            .current_node
            .get(&seq_id)
            .copied()
            .unwrap_or_else(|| self.trie.root());
        self.trie.peek_prefix(probe, node).1
    }

    /// All blocks owned by the prefix cache.
    pub fn blocks(&self) -> BTreeSet<BlockId> {
        self.trie.all_blocks()
    }

    /// Blocks not in use by any sequence, reclaimable by eviction.
    pub fn stale_blocks(&self) -> BTreeSet<BlockId> {
        self.trie.evictable_blocks()
    }

    pub fn contains_block(&self, block: BlockId) -> bool {
        self.trie.contains_block(block)
    }

    pub fn all_tokens(&self) -> u64 {
        self.all_tokens
    }

    pub fn cache_hit_tokens(&self) -> u64 {
        self.cache_hit_tokens
    }

    pub fn cow_count(&self) -> u64 {
        self.cow_count
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.all_tokens == 0 {
            return 0.0;
        }
        debug_assert!(self.cache_hit_tokens <= self.all_tokens);
        self.cache_hit_tokens as f64 / self.all_tokens as f64
    }

    /// Tokens of a context-encoding prompt that the cache could serve.
    pub fn get_num_cached_tokens(&self, prompt: &[TokenId]) -> usize {
        if self.enabled && !prompt.is_empty() {
            let probe = &prompt[..prompt.len() - 1];
            self.trie.peek_prefix(probe, self.trie.root()).1.len() * self.page_size
        } else {
            0
        }
    }

    /// Blocks reusable for the given prompt of an active sequence.
    pub fn get_cached_blocks(&self, seq_id: SeqId, prompt: &[TokenId]) -> Vec<BlockId> {
        if prompt.is_empty() {
            return Vec::new();
        }
        self.peek_hit_blocks(seq_id, &prompt[..prompt.len() - 1])
    }

    /// Check that a sequence's committed tokens and blocks match what the
    /// trie actually records along its cursor path.
    pub fn validate_req_state(&self, seq_id: SeqId, meta: &PagedCacheMetadata) -> Result<()> {
        let node = *self
            .current_node
            .get(&seq_id)
            .ok_or(Error::UnknownSequence(seq_id))?;
        let (tokens, blocks) = self.trie.prefix_tokens_and_blocks(node);
        if tokens != meta.committed_tokens() || blocks != meta.committed_blocks() {
            return Err(Error::Protocol(format!(
                "sequence {seq_id} disagrees with its committed trie path"
            )));
        }
        Ok(())
    }

    /// Check that every node's refcount equals the number of active
    /// sequences whose cursor path crosses it.
    pub fn validate_refcounts(&self) -> Result<()> {
        let mut expected: HashMap<NodeId, usize> = HashMap::new();
        for &node in self.current_node.values() {
            for id in self.trie.path_to_root(node) {
                *expected.entry(id).or_insert(0) += 1;
            }
        }
        for (id, refcount) in self.trie.refcounts() {
            if expected.get(&id).copied().unwrap_or(0) != refcount {
                return Err(Error::Protocol(format!(
                    "trie node {id} refcount {refcount} does not match its users"
                )));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self, seq_id: SeqId) -> Option<NodeId> {
        self.current_node.get(&seq_id).copied()
    }
}
