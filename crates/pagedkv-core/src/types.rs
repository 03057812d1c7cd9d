//! Shared id types for the cache manager.

/// Index of a fixed-size KV block in `[0, total_num_blocks)`.
pub type BlockId = usize;

/// Opaque identifier of one in-flight generation stream, bounded by the
/// manager's `max_batch_size`.
pub type SeqId = usize;

/// Vocabulary token id.
pub type TokenId = u32;
