//! Token grouping for grouped Marlin MoE execution.
//!
//! Produces the routing metadata consumed by the grouped GEMM:
//! 1. Group token slots by expert assignment
//! 2. Pad every expert segment to a multiple of the block size
//! 3. Record segment boundaries (`expert_offsets`) and per-block expert ids

use candle_core::{DType, Tensor};

use super::config::MarlinMoeBlockConfig;
use crate::error::{unsupported_bail, Result};

/// Result of token alignment operation.
#[derive(Debug)]
pub struct AlignedTokens {
    /// Sorted token-slot indices, U32 `[num_tokens_post_padded]`.
    /// Value `id < num_valid_tokens` is token `id / top_k`, slot `id % top_k`;
    /// padding positions hold `num_valid_tokens`.
    pub sorted_token_ids: Tensor,

    /// Expert ID for each block of `block_size` positions, U32 `[num_blocks]`.
    pub expert_ids: Tensor,

    /// Segment boundaries into `sorted_token_ids`, U32 `[num_experts + 1]`.
    pub expert_offsets: Tensor,

    /// Total number of positions after padding.
    pub num_tokens_post_padded: usize,

    /// Number of valid token slots (before padding).
    pub num_valid_tokens: usize,
}

/// Token grouper that aligns token slots by expert for batched execution.
pub struct MoETokenGrouper {
    block_size: usize,
    num_experts: usize,
}

impl MoETokenGrouper {
    /// Create a new token grouper.
    pub fn new(block_size: usize, num_experts: usize) -> Self {
        Self {
            block_size,
            num_experts,
        }
    }

    /// Create from block config.
    pub fn from_config(config: &MarlinMoeBlockConfig, num_experts: usize) -> Self {
        Self::new(config.moe_block_size, num_experts)
    }

    /// Align token slots to block boundaries.
    ///
    /// # Arguments
    /// * `topk_ids` - Expert indices for each token, shape `[num_tokens, top_k]`
    ///
    /// Slots routed to an expert outside `[0, num_experts)` are dropped.
    /// Within an expert segment slots keep their original order.
    pub fn align_block_size(&self, topk_ids: &Tensor) -> Result<AlignedTokens> {
        if self.block_size == 0 || self.num_experts == 0 {
            unsupported_bail!(
                "token alignment needs a non-zero block size and expert count (got {} and {})",
                self.block_size,
                self.num_experts
            );
        }

        let device = topk_ids.device();
        let (num_tokens, top_k) = topk_ids.dims2()?;
        let numel = num_tokens * top_k;

        let topk_ids_vec: Vec<i64> = topk_ids.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
        let expert_of = |id: i64| -> Option<usize> {
            usize::try_from(id).ok().filter(|&e| e < self.num_experts)
        };

        // Count slots per expert
        let mut expert_counts = vec![0usize; self.num_experts];
        for &expert_id in &topk_ids_vec {
            if let Some(expert_idx) = expert_of(expert_id) {
                expert_counts[expert_idx] += 1;
            }
        }

        // Padded cumulative sums are the segment boundaries
        let mut cumsum = vec![0usize; self.num_experts + 1];
        for (i, &count) in expert_counts.iter().enumerate() {
            let padded_count = count.div_ceil(self.block_size) * self.block_size;
            cumsum[i + 1] = cumsum[i] + padded_count;
        }
        let num_tokens_padded = cumsum[self.num_experts];

        let mut sorted_token_ids = vec![numel as u32; num_tokens_padded];
        let mut cursor = cumsum[..self.num_experts].to_vec();
        for (slot_idx, &expert_id) in topk_ids_vec.iter().enumerate() {
            if let Some(expert_idx) = expert_of(expert_id) {
                sorted_token_ids[cursor[expert_idx]] = slot_idx as u32;
                cursor[expert_idx] += 1;
            }
        }

        let mut expert_ids = vec![0u32; num_tokens_padded / self.block_size];
        for expert_idx in 0..self.num_experts {
            let start_block = cumsum[expert_idx] / self.block_size;
            let end_block = cumsum[expert_idx + 1] / self.block_size;
            for expert_id in expert_ids.iter_mut().take(end_block).skip(start_block) {
                *expert_id = expert_idx as u32;
            }
        }

        let expert_offsets: Vec<u32> = cumsum.iter().map(|&x| x as u32).collect();

        Ok(AlignedTokens {
            sorted_token_ids: Tensor::from_vec(sorted_token_ids, num_tokens_padded, device)?,
            expert_ids: Tensor::from_vec(expert_ids, num_tokens_padded / self.block_size, device)?,
            expert_offsets: Tensor::from_vec(expert_offsets, self.num_experts + 1, device)?,
            num_tokens_post_padded: num_tokens_padded,
            num_valid_tokens: numel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_token_grouper_basic() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(4, 4);

        // Token 0 -> experts [2, 3]
        // Token 1 -> experts [1, 2]
        // Token 2 -> experts [1, 3]
        // Token 3 -> experts [1, 2]
        let topk_ids = Tensor::new(&[[2u32, 3], [1, 2], [1, 3], [1, 2]], &device).unwrap();

        let aligned = grouper.align_block_size(&topk_ids).unwrap();

        // Expert 0: no slots -> 0 padded
        // Expert 1: slots 2, 4, 6 -> 4 padded
        // Expert 2: slots 0, 3, 7 -> 4 padded
        // Expert 3: slots 1, 5 -> 4 padded
        assert_eq!(aligned.num_valid_tokens, 8);
        assert_eq!(aligned.num_tokens_post_padded, 12);

        let offsets: Vec<u32> = aligned.expert_offsets.to_vec1().unwrap();
        assert_eq!(offsets, vec![0, 0, 4, 8, 12]);

        let sorted_ids: Vec<u32> = aligned.sorted_token_ids.to_vec1().unwrap();
        assert_eq!(sorted_ids, vec![2, 4, 6, 8, 0, 3, 7, 8, 1, 5, 8, 8]);

        let expert_ids: Vec<u32> = aligned.expert_ids.to_vec1().unwrap();
        assert_eq!(expert_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_token_grouper_single_expert() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(16, 8);

        let topk_ids = Tensor::new(&[[0u32], [0], [0], [0]], &device).unwrap();

        let aligned = grouper.align_block_size(&topk_ids).unwrap();
        assert_eq!(aligned.num_valid_tokens, 4);
        assert_eq!(aligned.num_tokens_post_padded, 16);

        let offsets: Vec<u32> = aligned.expert_offsets.to_vec1().unwrap();
        assert_eq!(offsets[0], 0);
        assert!(offsets[1..].iter().all(|&o| o == 16));
    }

    #[test]
    fn test_token_grouper_padding() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(64, 8);

        // Small number of tokens - heavily padded
        let topk_ids = Tensor::new(&[[0u32, 1], [2, 3]], &device).unwrap();

        let aligned = grouper.align_block_size(&topk_ids).unwrap();
        assert_eq!(aligned.num_valid_tokens, 4);
        assert_eq!(aligned.num_tokens_post_padded, 4 * 64);

        let sorted_ids: Vec<u32> = aligned.sorted_token_ids.to_vec1().unwrap();
        assert_eq!(sorted_ids.len(), 4 * 64);
        assert_eq!(sorted_ids.iter().filter(|&&id| id < 4).count(), 4);
    }

    #[test]
    fn test_token_grouper_drops_out_of_range_experts() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(16, 2);

        let topk_ids = Tensor::new(&[[0i64, 5], [-1, 1]], &device).unwrap();
        let aligned = grouper.align_block_size(&topk_ids).unwrap();

        let sorted_ids: Vec<u32> = aligned.sorted_token_ids.to_vec1().unwrap();
        let real: Vec<u32> = sorted_ids.into_iter().filter(|&id| id < 4).collect();
        assert_eq!(real, vec![0, 3]);
        assert_eq!(aligned.num_tokens_post_padded, 32);
    }

    #[test]
    fn test_token_grouper_rejects_zero_block() {
        let device = Device::Cpu;
        let topk_ids = Tensor::new(&[[0u32]], &device).unwrap();
        assert!(MoETokenGrouper::new(0, 2).align_block_size(&topk_ids).is_err());
    }
}
