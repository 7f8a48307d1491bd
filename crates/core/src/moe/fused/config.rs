//! Configuration for fused Marlin MoE execution.

use serde::{Deserialize, Serialize};

use crate::error::{unsupported_bail, Result};
use crate::quantization::MarlinMoeQuantConfig;

/// Token block sizes the grouped GEMM can tile expert segments with.
pub const SUPPORTED_MOE_BLOCK_SIZES: &[usize] = &[16, 32, 48, 64];

/// Block size configuration for grouped Marlin MoE GEMMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarlinMoeBlockConfig {
    /// Block size for the M dimension (token slots per expert tile).
    pub moe_block_size: usize,
}

impl Default for MarlinMoeBlockConfig {
    fn default() -> Self {
        Self { moe_block_size: 64 }
    }
}

impl MarlinMoeBlockConfig {
    /// Configuration with an explicit block size.
    pub fn new(moe_block_size: usize) -> Result<Self> {
        validate_moe_block_size(moe_block_size)?;
        Ok(Self { moe_block_size })
    }

    /// Select a block size from the expected number of slots per expert.
    ///
    /// Sparse routing gets small blocks so that padding stays low; dense
    /// routing gets the largest tile.
    pub fn auto_select(num_tokens: usize, top_k: usize, num_experts: usize) -> Self {
        let slots_per_expert = (num_tokens * top_k).div_ceil(num_experts.max(1));
        let moe_block_size = SUPPORTED_MOE_BLOCK_SIZES
            .iter()
            .copied()
            .find(|&bs| slots_per_expert <= bs)
            .unwrap_or(64);
        Self { moe_block_size }
    }
}

/// Check that the grouped GEMM can tile with `moe_block_size`.
pub fn validate_moe_block_size(moe_block_size: usize) -> Result<()> {
    if !SUPPORTED_MOE_BLOCK_SIZES.contains(&moe_block_size) {
        unsupported_bail!(
            "moe_block_size {} is not supported. Supported: {:?}",
            moe_block_size,
            SUPPORTED_MOE_BLOCK_SIZES
        );
    }
    Ok(())
}

/// Configuration for a fused Marlin MoE layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedMarlinMoEConfig {
    /// Number of experts.
    pub num_experts: usize,
    /// Number of experts activated per token.
    pub top_k: usize,
    /// Hidden dimension size.
    pub hidden_size: usize,
    /// Intermediate (FFN) dimension size.
    pub intermediate_size: usize,
    /// Whether to renormalize routing weights.
    pub renormalize: bool,
    /// Packed weight settings shared by w13 and w2.
    pub quant: MarlinMoeQuantConfig,
    /// Fixed block size; chosen per call from the batch when `None`.
    #[serde(default)]
    pub block_config: Option<MarlinMoeBlockConfig>,
}

impl FusedMarlinMoEConfig {
    /// Create a new fused MoE configuration.
    pub fn new(
        num_experts: usize,
        top_k: usize,
        hidden_size: usize,
        intermediate_size: usize,
        renormalize: bool,
    ) -> Self {
        Self {
            num_experts,
            top_k,
            hidden_size,
            intermediate_size,
            renormalize,
            quant: MarlinMoeQuantConfig::default(),
            block_config: None,
        }
    }

    /// Replace the quantization settings.
    pub fn with_quant(mut self, quant: MarlinMoeQuantConfig) -> Self {
        self.quant = quant;
        self
    }

    /// Pin the token block size instead of selecting it per batch.
    pub fn with_block_config(mut self, block_config: MarlinMoeBlockConfig) -> Self {
        self.block_config = Some(block_config);
        self
    }

    /// Block configuration for a batch of `num_tokens`.
    pub fn block_config_for(&self, num_tokens: usize) -> MarlinMoeBlockConfig {
        self.block_config.unwrap_or_else(|| {
            MarlinMoeBlockConfig::auto_select(num_tokens, self.top_k, self.num_experts)
        })
    }

    /// First-projection (w13) N-dimension: gate and up stacked.
    pub fn w13_n_dim(&self) -> usize {
        2 * self.intermediate_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MarlinMoeBlockConfig::default();
        assert_eq!(config.moe_block_size, 64);
    }

    #[test]
    fn test_new_validates_block_size() {
        assert_eq!(MarlinMoeBlockConfig::new(48).unwrap().moe_block_size, 48);
        assert!(MarlinMoeBlockConfig::new(24).is_err());
        assert!(MarlinMoeBlockConfig::new(0).is_err());
        assert!(MarlinMoeBlockConfig::new(128).is_err());
    }

    #[test]
    fn test_auto_select() {
        // 4 tokens * 2 slots over 8 experts: one slot per expert
        assert_eq!(MarlinMoeBlockConfig::auto_select(4, 2, 8).moe_block_size, 16);
        // 64 slots per expert on average
        assert_eq!(MarlinMoeBlockConfig::auto_select(256, 2, 8).moe_block_size, 64);
        // 40 slots per expert
        assert_eq!(MarlinMoeBlockConfig::auto_select(160, 2, 8).moe_block_size, 48);
        // Very dense batches stay at the largest tile
        assert_eq!(MarlinMoeBlockConfig::auto_select(4096, 8, 8).moe_block_size, 64);
    }

    #[test]
    fn test_fused_config_block_override() {
        let config = FusedMarlinMoEConfig::new(8, 2, 4096, 14336, true);
        assert_eq!(config.block_config_for(4).moe_block_size, 16);

        let pinned = config.with_block_config(MarlinMoeBlockConfig::new(32).unwrap());
        assert_eq!(pinned.block_config_for(4).moe_block_size, 32);
        assert_eq!(pinned.block_config_for(4096).moe_block_size, 32);
    }

    #[test]
    fn test_w13_n_dim() {
        let config = FusedMarlinMoEConfig::new(8, 2, 4096, 11008, true);
        assert_eq!(config.w13_n_dim(), 2 * 11008);
    }
}
