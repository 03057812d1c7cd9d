//! Paged KV cache management: block pool, per-sequence metadata, radix trie
//! prefix cache and the façade manager.

pub mod block_pool;
pub mod increment;
pub mod inputs;
pub mod manager;
pub mod metadata;
pub mod prefix_cache;
pub mod radix_trie;

pub use block_pool::BlockPool;
pub use increment::{CacheLengthIncrementer, PrevStepInputs};
pub use inputs::{
    Dim, KVCacheInputSymbols, KVCacheInputs, KVCacheInputsSequence, PaddedKVCacheInputs,
    RaggedKVCacheInputs, TensorSymbol,
};
pub use manager::{KVCacheManager, KVCacheStats};
pub use metadata::PagedCacheMetadata;
pub use prefix_cache::PrefixCache;
pub use radix_trie::RadixTrie;
