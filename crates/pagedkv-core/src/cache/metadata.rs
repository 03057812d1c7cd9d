//! Per-sequence bookkeeping for the paged KV cache.

use crate::error::{Error, Result};
use crate::types::{BlockId, TokenId};

pub(crate) fn ceildiv(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

/// Token array and indices for a single sequence.
///
/// Four indices partition the token array, and every region is re-derived
/// from them rather than stored:
///
/// ```text
///   0        committed_idx   cached_idx   inflight_idx    seq_len
///   |  committed  |  partial/cow  |   prompt    |  inflight  |
///   |------------ cached --------|---------- uncached -------|
///   |----------- committable (known values) ----|
/// ```
///
/// - committed tokens are recorded in the prefix cache; `committed_idx` is
///   always a multiple of the page size.
/// - cached tokens have a KV projection written into an owned block.
/// - inflight slots are placeholders for tokens the next model invocation
///   will produce; after `fetch` there are `num_steps - 1` of them, filled
///   in by `step`.
pub struct PagedCacheMetadata {
    page_size: usize,
    pub(crate) committed_idx: usize,
    pub(crate) cached_idx: usize,
    pub(crate) inflight_idx: usize,
    pub(crate) seq_len: usize,
    pub(crate) blocks: Vec<BlockId>,
    pub(crate) tokens: Vec<TokenId>,
}

impl PagedCacheMetadata {
    pub fn new(page_size: usize, max_seq_len: usize) -> Self {
        Self {
            page_size,
            committed_idx: 0,
            cached_idx: 0,
            inflight_idx: 0,
            seq_len: 0,
            blocks: Vec::new(),
            tokens: vec![0; max_seq_len],
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.tokens.len()
    }

    pub fn committed_idx(&self) -> usize {
        self.committed_idx
    }

    pub fn cached_idx(&self) -> usize {
        self.cached_idx
    }

    pub fn inflight_idx(&self) -> usize {
        self.inflight_idx
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Blocks recorded in the prefix cache.
    pub fn committed_blocks(&self) -> &[BlockId] {
        &self.blocks[..self.committed_idx / self.page_size]
    }

    /// Blocks owned exclusively by this sequence.
    pub fn uncommitted_blocks(&self) -> &[BlockId] {
        &self.blocks[self.committed_idx / self.page_size..]
    }

    pub fn committed_tokens(&self) -> &[TokenId] {
        &self.tokens[..self.committed_idx]
    }

    /// Tokens whose KV projections the next model invocation must produce.
    pub fn uncached_tokens(&self) -> &[TokenId] {
        &self.tokens[self.cached_idx..self.seq_len]
    }

    pub fn prompt_tokens(&self) -> &[TokenId] {
        &self.tokens[self.cached_idx..self.inflight_idx]
    }

    pub fn inflight_tokens(&self) -> &[TokenId] {
        &self.tokens[self.inflight_idx..self.seq_len]
    }

    /// Known-value tokens not yet committed to the prefix cache.
    pub fn committable_tokens(&self) -> &[TokenId] {
        &self.tokens[self.committed_idx..self.inflight_idx]
    }

    /// Committable tokens restricted to whole pages.
    pub fn committable_tokens_aligned(&self) -> &[TokenId] {
        let aligned_end = self.inflight_idx - self.inflight_idx % self.page_size;
        let aligned_end = aligned_end.max(self.committed_idx);
        &self.tokens[self.committed_idx..aligned_end]
    }

    /// Blocks containing at least one committable token.
    pub fn committable_blocks(&self) -> &[BlockId] {
        &self.blocks[self.committed_idx / self.page_size
            ..ceildiv(self.inflight_idx, self.page_size).min(self.blocks.len())]
    }

    /// Blocks containing only committable tokens.
    pub fn committable_blocks_aligned(&self) -> &[BlockId] {
        &self.blocks[self.committed_idx / self.page_size..self.inflight_idx / self.page_size]
    }

    /// Check the index ordering invariant and page alignment of the
    /// committed region.
    pub fn validate(&self) -> Result<()> {
        if !(self.committed_idx <= self.cached_idx
            && self.cached_idx <= self.inflight_idx
            && self.inflight_idx <= self.seq_len)
        {
            return Err(Error::Protocol(format!(
                "sequence indices out of order: committed {} cached {} inflight {} seq_len {}",
                self.committed_idx, self.cached_idx, self.inflight_idx, self.seq_len
            )));
        }
        if self.seq_len > self.tokens.len() {
            return Err(Error::Capacity(format!(
                "seq_len {} exceeds max_seq_len {}",
                self.seq_len,
                self.tokens.len()
            )));
        }
        if self.committed_idx % self.page_size != 0 {
            return Err(Error::Protocol(format!(
                "committed_idx {} is not a multiple of the page size {}",
                self.committed_idx, self.page_size
            )));
        }
        Ok(())
    }

    /// Write the prompt into the token array and reserve `num_steps - 1`
    /// inflight slots.
    pub fn fetch(&mut self, prompt: &[TokenId], num_steps: usize) -> Result<()> {
        self.validate()?;
        if !self.prompt_tokens().is_empty() {
            return Err(Error::Protocol(
                "fetch requires no outstanding prompt tokens".into(),
            ));
        }
        if !self.inflight_tokens().is_empty() {
            return Err(Error::Protocol(
                "fetch requires no outstanding inflight tokens".into(),
            ));
        }
        if prompt.is_empty() {
            return Err(Error::Protocol("fetch requires a non-empty prompt".into()));
        }
        if num_steps == 0 {
            return Err(Error::Protocol("fetch requires num_steps >= 1".into()));
        }
        let new_seq_len = self.seq_len + prompt.len() + (num_steps - 1);
        if new_seq_len > self.tokens.len() {
            return Err(Error::Capacity(format!(
                "prompt of {} tokens with {} steps would grow the sequence to {} (max {})",
                prompt.len(),
                num_steps,
                new_seq_len,
                self.tokens.len()
            )));
        }
        self.tokens[self.cached_idx..self.cached_idx + prompt.len()].copy_from_slice(prompt);
        self.inflight_idx += prompt.len();
        self.seq_len = new_seq_len;
        self.validate()
    }

    /// Fill the inflight slots with the newly generated tokens. The last new
    /// token has no KV projection yet and becomes the next prompt.
    pub fn step(&mut self, new_tokens: &[TokenId]) -> Result<()> {
        self.validate()?;
        if self.prompt_tokens().is_empty() {
            return Err(Error::Protocol(
                "step without a prompt: the model cannot have run".into(),
            ));
        }
        if self.inflight_tokens().len() + 1 != new_tokens.len() {
            return Err(Error::Protocol(format!(
                "step got {} new tokens but {} inflight slots are reserved",
                new_tokens.len(),
                self.inflight_tokens().len()
            )));
        }
        self.tokens[self.inflight_idx..self.seq_len]
            .copy_from_slice(&new_tokens[..new_tokens.len() - 1]);
        self.cached_idx = self.seq_len;
        self.inflight_idx = self.seq_len;
        debug_assert!(self.uncached_tokens().is_empty());
        self.validate()
    }
}
