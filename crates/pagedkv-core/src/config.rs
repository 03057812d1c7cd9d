//! Configuration types for the paged KV cache manager.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Element type of the block storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    #[default]
    Float16,
    BFloat16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 | Self::BFloat16 => 2,
        }
    }
}

/// Cache layout strategy. Only `Paged` supports the prefix cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Continuous,
    #[default]
    Paged,
}

/// Parameters of the KV cache.
///
/// Geometry that varies per model (`num_layers`, `max_batch_size`,
/// `max_seq_len`) is passed to the manager constructor instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVCacheParams {
    /// Element type of block storage
    #[serde(default)]
    pub dtype: DType,

    /// Number of KV heads per token slot
    pub n_kv_heads: usize,

    /// Dimension of each head
    pub head_dim: usize,

    /// Cache layout strategy
    #[serde(default)]
    pub cache_strategy: CacheStrategy,

    /// Tokens per block; a page size of 1 disables COW
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Reuse committed blocks across sequences via the radix trie
    #[serde(default = "default_enable_prefix_caching")]
    pub enable_prefix_caching: bool,

    /// Copy partial pages out of committed blocks instead of recomputing them
    #[serde(default = "default_enable_cow")]
    pub enable_cow: bool,
}

impl Default for KVCacheParams {
    fn default() -> Self {
        Self {
            dtype: DType::default(),
            n_kv_heads: 8,
            head_dim: 128,
            cache_strategy: CacheStrategy::default(),
            page_size: default_page_size(),
            enable_prefix_caching: default_enable_prefix_caching(),
            enable_cow: default_enable_cow(),
        }
    }
}

fn default_page_size() -> usize {
    16
}

fn default_enable_prefix_caching() -> bool {
    true
}

fn default_enable_cow() -> bool {
    true
}

impl KVCacheParams {
    /// Load parameters from a TOML config file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let params: Self = toml::from_str(&contents)?;
        params.validate()?;
        Ok(params)
    }

    /// Check parameter combinations. Invalid ones are rejected here, at
    /// construction, rather than surfacing later as protocol errors.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::ConfigInvalid("page_size must be at least 1".into()));
        }
        if self.n_kv_heads == 0 || self.head_dim == 0 {
            return Err(Error::ConfigInvalid(
                "n_kv_heads and head_dim must be nonzero".into(),
            ));
        }
        if self.enable_prefix_caching && self.cache_strategy != CacheStrategy::Paged {
            return Err(Error::ConfigInvalid(
                "prefix caching requires the paged cache strategy".into(),
            ));
        }
        Ok(())
    }

    /// Whether COW is actually in effect: it needs prefix caching and a page
    /// size of at least 2 to ever find a partial match.
    pub fn cow_in_effect(&self) -> bool {
        self.enable_prefix_caching && self.enable_cow && self.page_size > 1
    }

    /// Elements in one token slot across all layers, both K and V.
    pub fn token_slot_elements(&self, num_layers: usize) -> usize {
        num_layers * 2 * self.n_kv_heads * self.head_dim
    }

    /// Elements in one block.
    pub fn block_elements(&self, num_layers: usize) -> usize {
        self.page_size * self.token_slot_elements(num_layers)
    }

    /// Bytes of device memory per block.
    pub fn block_size_in_bytes(&self, num_layers: usize) -> usize {
        self.block_elements(num_layers) * self.dtype.size_in_bytes()
    }

    /// Shape of the per-device block storage:
    /// `[num_blocks, page_size, num_layers, 2, n_kv_heads, head_dim]`.
    pub fn block_shape(&self, num_blocks: usize, num_layers: usize) -> [usize; 6] {
        [
            num_blocks,
            self.page_size,
            num_layers,
            2,
            self.n_kv_heads,
            self.head_dim,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = KVCacheParams::default();
        assert_eq!(params.page_size, 16);
        assert!(params.enable_prefix_caching);
        assert_eq!(params.cache_strategy, CacheStrategy::Paged);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_str = r#"
            n_kv_heads = 4
            head_dim = 64
            page_size = 8
            dtype = "bfloat16"
        "#;
        let params: KVCacheParams = toml::from_str(toml_str).unwrap();
        assert_eq!(params.n_kv_heads, 4);
        assert_eq!(params.head_dim, 64);
        assert_eq!(params.page_size, 8);
        assert_eq!(params.dtype, DType::BFloat16);
        // omitted fields come from the serde defaults
        assert!(params.enable_prefix_caching);
        assert!(params.enable_cow);
    }

    #[test]
    fn test_validate_rejects_prefix_caching_without_paging() {
        let params = KVCacheParams {
            cache_strategy: CacheStrategy::Continuous,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let params = KVCacheParams {
            page_size: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_block_geometry() {
        let params = KVCacheParams {
            dtype: DType::Float16,
            n_kv_heads: 2,
            head_dim: 4,
            page_size: 8,
            ..Default::default()
        };
        // 8 tokens * 3 layers * 2 (k+v) * 2 heads * 4 dims * 2 bytes
        assert_eq!(params.block_size_in_bytes(3), 8 * 3 * 2 * 2 * 4 * 2);
        assert_eq!(params.block_shape(10, 3), [10, 8, 3, 2, 2, 4]);
    }

    #[test]
    fn test_from_toml_path_missing_file() {
        let err = KVCacheParams::from_toml_path("/nonexistent/kv_cache.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_malformed_toml_maps_to_parse_error() {
        let err: Error = toml::from_str::<KVCacheParams>("n_kv_heads = []")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_page_size_one_disables_cow() {
        let params = KVCacheParams {
            page_size: 1,
            ..Default::default()
        };
        assert!(params.validate().is_ok());
        assert!(!params.cow_in_effect());
    }
}
