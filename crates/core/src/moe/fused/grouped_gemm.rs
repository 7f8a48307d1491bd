//! Host execution of the grouped Marlin MoE GEMM.
//!
//! Experts are visited in order. For each expert with at least one real slot
//! the packed weights are dequantized once into the workspace, then the
//! expert's segment of `sorted_ids` is processed `moe_block_size` positions at
//! a time: real rows are gathered, multiplied against the dequantized tile
//! (rows in parallel) and written to their slot in the output.
//!
//! Accumulation is f32 and the reduction order inside a row never depends on
//! the thread count, so results are deterministic.

use rayon::prelude::*;

use super::workspace::ScratchViews;
use crate::quantization::marlin::{for_each_packed_value, marlin_weight_perm, packed_len};
use crate::quantization::MarlinScalarType;

/// Validated problem dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MoeGemmShape {
    pub size_m: usize,
    pub size_n: usize,
    pub size_k: usize,
    pub num_tokens_post_padded: usize,
    pub num_experts: usize,
    pub topk: usize,
    pub moe_block_size: usize,
    pub replicate_input: bool,
    pub apply_weights: bool,
}

impl MoeGemmShape {
    /// Number of (token, expert) slots; ids at or above this are padding.
    pub fn num_slots(&self) -> usize {
        self.size_m * self.topk
    }

    /// Rows expected in the activation matrix.
    pub fn a_rows(&self) -> usize {
        if self.replicate_input {
            self.size_m
        } else {
            self.num_slots()
        }
    }

    /// Activation row feeding slot `id`.
    #[inline]
    pub fn a_row_of(&self, id: usize) -> usize {
        if self.replicate_input {
            id / self.topk
        } else {
            id
        }
    }
}

/// Host copies of every operand, already validated against the shape.
pub(crate) struct HostOperands<'a> {
    /// `[a_rows, size_k]`
    pub a: &'a [f32],
    /// `[num_experts, packed_len]`
    pub b_q: &'a [u32],
    /// Unpermuted `[num_experts, num_groups, size_n]`
    pub scales: &'a [f32],
    /// `[size_m * topk]`, only read when `apply_weights`
    pub topk_weights: Option<&'a [f32]>,
    /// Normalized ids: padding positions hold `num_slots`
    pub sorted_ids: &'a [usize],
    /// `[num_experts + 1]`
    pub expert_offsets: &'a [usize],
    pub scalar_type: MarlinScalarType,
    pub num_groups: usize,
}

/// Run the grouped GEMM and return per-slot rows `[size_m * topk, size_n]`.
pub(crate) fn grouped_gemm(
    shape: &MoeGemmShape,
    ops: &HostOperands<'_>,
    scratch: ScratchViews<'_>,
) -> Vec<f32> {
    let MoeGemmShape {
        size_n,
        size_k,
        moe_block_size,
        ..
    } = *shape;
    let num_slots = shape.num_slots();
    let expert_words = packed_len(size_k, size_n, ops.scalar_type);
    let expert_scales = ops.num_groups * size_n;
    let group_len = size_k / ops.num_groups;
    let perm = marlin_weight_perm(ops.scalar_type.bits());

    let ScratchViews {
        dequant,
        a_block,
        c_block,
    } = scratch;

    let mut slots = vec![0f32; num_slots * size_n];
    let mut block_ids = Vec::with_capacity(moe_block_size);

    for expert in 0..shape.num_experts {
        let (start, end) = (ops.expert_offsets[expert], ops.expert_offsets[expert + 1]);
        let segment = &ops.sorted_ids[start..end];
        let real = segment.iter().filter(|&&id| id < num_slots).count();
        if real == 0 {
            continue;
        }
        tracing::trace!(
            expert,
            real,
            padded = segment.len(),
            "grouped gemm expert segment"
        );

        dequantize_expert(
            &ops.b_q[expert * expert_words..(expert + 1) * expert_words],
            &ops.scales[expert * expert_scales..(expert + 1) * expert_scales],
            &perm,
            size_n,
            group_len,
            ops.scalar_type,
            dequant,
        );
        let b_tile: &[f32] = &*dequant;

        for block in segment.chunks(moe_block_size) {
            block_ids.clear();
            for &id in block.iter().filter(|&&id| id < num_slots) {
                let src = shape.a_row_of(id) * size_k;
                let dst = block_ids.len() * size_k;
                a_block[dst..dst + size_k].copy_from_slice(&ops.a[src..src + size_k]);
                block_ids.push(id);
            }
            let rows = block_ids.len();
            if rows == 0 {
                continue;
            }

            c_block[..rows * size_n]
                .par_chunks_mut(size_n)
                .zip(a_block[..rows * size_k].par_chunks(size_k))
                .for_each(|(c_row, a_row)| {
                    c_row.fill(0.0);
                    for (k, &a_val) in a_row.iter().enumerate() {
                        let b_row = &b_tile[k * size_n..(k + 1) * size_n];
                        for (c, &b) in c_row.iter_mut().zip(b_row) {
                            *c += a_val * b;
                        }
                    }
                });

            for (row, &id) in block_ids.iter().enumerate() {
                let weight = match (shape.apply_weights, ops.topk_weights) {
                    (true, Some(weights)) => weights[id],
                    _ => 1.0,
                };
                let c_row = &c_block[row * size_n..(row + 1) * size_n];
                let out = &mut slots[id * size_n..(id + 1) * size_n];
                for (o, &c) in out.iter_mut().zip(c_row) {
                    *o = c * weight;
                }
            }
        }
    }

    slots
}

/// Expand one expert's packed weights to a row-major `[size_k, size_n]` tile.
fn dequantize_expert(
    packed: &[u32],
    scales: &[f32],
    perm: &[usize],
    size_n: usize,
    group_len: usize,
    scalar_type: MarlinScalarType,
    out: &mut [f32],
) {
    let bias = scalar_type.bias();
    for_each_packed_value(packed, perm, size_n, scalar_type, |k, n, q| {
        let scale = scales[(k / group_len) * size_n + n];
        out[k * size_n + n] = (q as i32 - bias) as f32 * scale;
    });
}

/// Sum the `topk` slot rows of every token: `[size_m, size_n]`.
pub(crate) fn reduce_slots(slots: &[f32], size_m: usize, topk: usize, size_n: usize) -> Vec<f32> {
    let mut out = vec![0f32; size_m * size_n];
    out.par_chunks_mut(size_n)
        .zip(slots.par_chunks(topk * size_n))
        .for_each(|(row, token_slots)| {
            for slot in token_slots.chunks(size_n) {
                for (o, &s) in row.iter_mut().zip(slot) {
                    *o += s;
                }
            }
        });
    out
}
