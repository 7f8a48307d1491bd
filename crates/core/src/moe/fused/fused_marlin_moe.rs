//! Routed MoE forward passes built on the grouped Marlin GEMM.
//!
//! [`fused_marlin_moe`] runs a full SwiGLU expert MLP:
//!
//! 1. Top-k softmax over the gating logits
//! 2. Token alignment by expert
//! 3. Gate+up projection per slot (`replicate_input`, unweighted)
//! 4. `silu(gate) * up`
//! 5. Down projection per slot, scaled by the routing weight, summed per token
//!
//! [`single_marlin_moe`] runs one routed projection.

use candle_core::{DType, Tensor};

use super::config::MarlinMoeBlockConfig;
use super::kernel_wrapper::{marlin_gemm_moe, marlin_gemm_moe_slots};
use super::token_grouper::{AlignedTokens, MoETokenGrouper};
use super::workspace::MarlinMoeWorkspace;
use crate::error::{shape_bail, Result};
use crate::moe::topk_softmax::{topk_softmax, TopKSoftmaxConfig};
use crate::quantization::GPTQ_MARLIN_TILE;

/// Routing shared by every projection of one forward pass.
struct Routing {
    topk_weights: Tensor,
    aligned: AlignedTokens,
    moe_block_size: usize,
}

fn route(
    gating_output: &Tensor,
    num_tokens: usize,
    num_experts: usize,
    topk: usize,
    renormalize: bool,
    block: Option<MarlinMoeBlockConfig>,
) -> Result<Routing> {
    if gating_output.dims() != [num_tokens, num_experts] {
        shape_bail!(
            "gating output has shape {:?}, expected [{}, {}]",
            gating_output.dims(),
            num_tokens,
            num_experts
        );
    }
    let (topk_weights, topk_ids) =
        topk_softmax(gating_output, &TopKSoftmaxConfig::new(topk, renormalize))?;
    let block = block
        .unwrap_or_else(|| MarlinMoeBlockConfig::auto_select(num_tokens, topk, num_experts));
    let aligned =
        MoETokenGrouper::from_config(&block, num_experts).align_block_size(&topk_ids)?;
    tracing::debug!(
        num_tokens,
        num_experts,
        topk,
        moe_block_size = block.moe_block_size,
        num_tokens_post_padded = aligned.num_tokens_post_padded,
        "routed tokens"
    );
    Ok(Routing {
        topk_weights,
        aligned,
        moe_block_size: block.moe_block_size,
    })
}

fn activation_dims(x: &Tensor) -> Result<(usize, usize)> {
    match x.dims() {
        &[m, k] => Ok((m, k)),
        dims => shape_bail!("hidden states must be [num_tokens, K], got {:?}", dims),
    }
}

fn packed_dims(w: &Tensor, name: &str) -> Result<(usize, usize)> {
    match w.dims() {
        &[e, k_tiles, _] => Ok((e, k_tiles * GPTQ_MARLIN_TILE)),
        dims => shape_bail!("{} must be [E, K / 16, packed N], got {:?}", name, dims),
    }
}

fn scales_n(scales: &Tensor, name: &str) -> Result<usize> {
    match scales.dims() {
        &[_, _, n] => Ok(n),
        dims => shape_bail!("{} must be [E, num_groups, N], got {:?}", name, dims),
    }
}

/// Quantized SwiGLU MoE forward.
///
/// # Arguments
/// * `hidden_states` - `[num_tokens, hidden_size]`
/// * `w1` - packed gate+up weights `[E, hidden_size / 16, 2 * intermediate * 16 / pack_factor]`
/// * `w2` - packed down weights `[E, intermediate / 16, hidden_size * 16 / pack_factor]`
/// * `gating_output` - router logits `[num_tokens, E]`
/// * `w1_scales` - `[E, groups, 2 * intermediate]`, Marlin-permuted
/// * `w2_scales` - `[E, groups, hidden_size]`, Marlin-permuted
///
/// The workspace must fit both projections, see [`MarlinMoeWorkspace::for_shapes`].
#[allow(clippy::too_many_arguments)]
pub fn fused_marlin_moe(
    hidden_states: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    gating_output: &Tensor,
    w1_scales: &Tensor,
    w2_scales: &Tensor,
    topk: usize,
    renormalize: bool,
    workspace: &mut MarlinMoeWorkspace,
) -> Result<Tensor> {
    fused_marlin_moe_with_block(
        hidden_states,
        w1,
        w2,
        gating_output,
        w1_scales,
        w2_scales,
        topk,
        renormalize,
        None,
        workspace,
    )
}

/// [`fused_marlin_moe`] with a pinned block size (`None` selects per batch).
#[allow(clippy::too_many_arguments)]
pub(crate) fn fused_marlin_moe_with_block(
    hidden_states: &Tensor,
    w1: &Tensor,
    w2: &Tensor,
    gating_output: &Tensor,
    w1_scales: &Tensor,
    w2_scales: &Tensor,
    topk: usize,
    renormalize: bool,
    block: Option<MarlinMoeBlockConfig>,
    workspace: &mut MarlinMoeWorkspace,
) -> Result<Tensor> {
    let (num_tokens, hidden_size) = activation_dims(hidden_states)?;
    let (num_experts, w1_k) = packed_dims(w1, "w1")?;
    let (w2_experts, intermediate_size) = packed_dims(w2, "w2")?;
    let w13_n = scales_n(w1_scales, "w1_scales")?;

    if w1_k != hidden_size {
        shape_bail!(
            "w1 consumes K={}, hidden_states have {} columns",
            w1_k,
            hidden_size
        );
    }
    if w2_experts != num_experts {
        shape_bail!("w1 has {} experts, w2 has {}", num_experts, w2_experts);
    }
    if w13_n != 2 * intermediate_size {
        shape_bail!(
            "w1 produces N={}, w2 expects 2 * {} gate+up columns",
            w13_n,
            intermediate_size
        );
    }
    if num_tokens == 0 {
        return Ok(Tensor::zeros(
            (0, hidden_size),
            hidden_states.dtype(),
            hidden_states.device(),
        )?);
    }

    let routing = route(
        gating_output,
        num_tokens,
        num_experts,
        topk,
        renormalize,
        block,
    )?;
    let aligned = &routing.aligned;

    let gate_up = marlin_gemm_moe_slots(
        hidden_states,
        w1,
        &aligned.sorted_token_ids,
        None,
        w1_scales,
        &aligned.expert_offsets,
        workspace,
        num_tokens,
        w13_n,
        hidden_size,
        aligned.num_tokens_post_padded,
        num_experts,
        topk,
        routing.moe_block_size,
        true,
        false,
    )?;
    let activated = silu_and_mul(&gate_up.reshape((num_tokens * topk, w13_n))?)?;

    marlin_gemm_moe(
        &activated,
        w2,
        &aligned.sorted_token_ids,
        Some(&routing.topk_weights),
        w2_scales,
        &aligned.expert_offsets,
        workspace,
        num_tokens,
        hidden_size,
        intermediate_size,
        aligned.num_tokens_post_padded,
        num_experts,
        topk,
        routing.moe_block_size,
        false,
        true,
    )
}

/// One routed quantized projection: `sum_j w_j * (x @ W[e_j])`.
///
/// # Arguments
/// * `hidden_states` - `[num_tokens, K]`
/// * `w` - packed weights `[E, K / 16, N * 16 / pack_factor]`
/// * `gating_output` - router logits `[num_tokens, E]`
/// * `scales` - `[E, groups, N]`, Marlin-permuted
#[allow(clippy::too_many_arguments)]
pub fn single_marlin_moe(
    hidden_states: &Tensor,
    w: &Tensor,
    gating_output: &Tensor,
    scales: &Tensor,
    topk: usize,
    renormalize: bool,
    workspace: &mut MarlinMoeWorkspace,
) -> Result<Tensor> {
    let (num_tokens, size_k) = activation_dims(hidden_states)?;
    let (num_experts, _) = packed_dims(w, "w")?;
    let size_n = scales_n(scales, "scales")?;
    if num_tokens == 0 {
        return Ok(Tensor::zeros(
            (0, size_n),
            hidden_states.dtype(),
            hidden_states.device(),
        )?);
    }

    let routing = route(
        gating_output,
        num_tokens,
        num_experts,
        topk,
        renormalize,
        None,
    )?;
    let aligned = &routing.aligned;
    marlin_gemm_moe(
        hidden_states,
        w,
        &aligned.sorted_token_ids,
        Some(&routing.topk_weights),
        scales,
        &aligned.expert_offsets,
        workspace,
        num_tokens,
        size_n,
        size_k,
        aligned.num_tokens_post_padded,
        num_experts,
        topk,
        routing.moe_block_size,
        true,
        true,
    )
}

/// `silu(x[:, :n/2]) * x[:, n/2:]`, computed in f32.
pub fn silu_and_mul(x: &Tensor) -> Result<Tensor> {
    let (_rows, cols) = x.dims2()?;
    if cols % 2 != 0 {
        shape_bail!("silu_and_mul needs an even column count, got {}", cols);
    }
    let half = cols / 2;
    let x32 = x.to_dtype(DType::F32)?;
    let gate = candle_nn::ops::silu(&x32.narrow(1, 0, half)?)?;
    let up = x32.narrow(1, half, half)?;
    Ok(gate.mul(&up)?.to_dtype(x.dtype())?)
}
