//! Top-k softmax for MoE routing.
//!
//! ## Algorithm
//!
//! 1. Compute softmax over expert logits
//! 2. Select top-k experts by probability (descending arg-sort)
//! 3. Optionally renormalize weights to sum to 1
//!
//! On CPU the arg-sort is stable, so equal probabilities keep the lower
//! expert index first.

use candle_core::{DType, Device, Tensor, D};

use crate::error::{shape_bail, unsupported_bail, Result};

/// Configuration for top-k softmax operation.
#[derive(Debug, Clone, Copy)]
pub struct TopKSoftmaxConfig {
    /// Number of top experts to select.
    pub k: usize,
    /// Whether to renormalize weights to sum to 1.
    pub renormalize: bool,
}

impl Default for TopKSoftmaxConfig {
    fn default() -> Self {
        Self {
            k: 2,
            renormalize: true,
        }
    }
}

impl TopKSoftmaxConfig {
    pub fn new(k: usize, renormalize: bool) -> Self {
        Self { k, renormalize }
    }
}

/// Select the top-k experts of every token.
///
/// # Arguments
/// * `router_logits` - Shape `[num_tokens, num_experts]`, raw gating logits
/// * `config` - Top-k selection configuration
///
/// # Returns
/// `(weights, ids)`: F32 `[num_tokens, k]` probabilities in descending order
/// and U32 `[num_tokens, k]` expert ids, on the logits' device.
pub fn topk_softmax(
    router_logits: &Tensor,
    config: &TopKSoftmaxConfig,
) -> Result<(Tensor, Tensor)> {
    match router_logits.device() {
        Device::Cpu | Device::Cuda(_) => {}
        other => unsupported_bail!("no top-k softmax backend for {:?}", other.location()),
    }

    let num_experts = match router_logits.dims() {
        &[_, e] => e,
        dims => shape_bail!(
            "router logits must be [num_tokens, num_experts], got {:?}",
            dims
        ),
    };
    let k = config.k;
    if k == 0 || k > num_experts {
        unsupported_bail!("k ({}) must be in 1..={} (num_experts)", k, num_experts);
    }

    let logits = router_logits.to_dtype(DType::F32)?;
    let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;

    let sorted_indices = probs.arg_sort_last_dim(false)?;
    let topk_indices = sorted_indices.narrow(1, 0, k)?.contiguous()?;
    let topk_weights = probs.gather(&topk_indices, 1)?;

    let weights = if config.renormalize {
        let sum = topk_weights.sum_keepdim(1)?;
        topk_weights.broadcast_div(&sum)?
    } else {
        topk_weights
    };

    Ok((weights, topk_indices.to_dtype(DType::U32)?))
}
