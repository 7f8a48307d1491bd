//! Shared test utilities for marlin-moe-core.
//!
//! Deterministic synthetic MoE problems (activations, packed experts and
//! routing) plus dense references computed with candle matmuls over the
//! dequantized weights. Values come from a seeded [`StdRng`], so a given
//! [`MoeProblemSpec`] always produces the same tensors.

use candle_core::{DType, Device, IndexOp, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{unsupported_bail, Result};
use crate::moe::{marlin_gemm_moe, AlignedTokens, MarlinMoeWorkspace, MoETokenGrouper};
use crate::quantization::{marlin_quantize_experts, MarlinExperts, MarlinScalarType};

/// Dimensions and packing of a synthetic problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoeProblemSpec {
    pub size_m: usize,
    pub size_n: usize,
    pub size_k: usize,
    pub num_experts: usize,
    pub topk: usize,
    pub moe_block_size: usize,
    pub scalar_type: MarlinScalarType,
    pub group_size: i32,
    pub seed: u64,
}

impl Default for MoeProblemSpec {
    fn default() -> Self {
        Self {
            size_m: 8,
            size_n: 64,
            size_k: 128,
            num_experts: 4,
            topk: 2,
            moe_block_size: 16,
            scalar_type: MarlinScalarType::Uint4b8,
            group_size: 64,
            seed: 0,
        }
    }
}

/// A routed problem ready for [`marlin_gemm_moe`].
pub struct MoeProblem {
    pub spec: MoeProblemSpec,
    /// F32 `[size_m, size_k]`.
    pub a: Tensor,
    pub experts: MarlinExperts,
    /// U32 `[size_m, topk]`, distinct experts per token.
    pub topk_ids: Tensor,
    /// F32 `[size_m, topk]`, positive and summing to 1 per token.
    pub topk_weights: Tensor,
    pub aligned: AlignedTokens,
}

/// `len` values drawn uniformly from `[-scale, scale)` with a seeded [`StdRng`].
pub fn seeded_uniform(seed: u64, len: usize, scale: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0) * scale).collect()
}

/// F32 CPU tensor of `shape` filled by [`seeded_uniform`].
pub fn seeded_tensor<S: Into<Shape>>(seed: u64, shape: S, scale: f32) -> Result<Tensor> {
    let shape = shape.into();
    let data = seeded_uniform(seed, shape.elem_count(), scale);
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

impl MoeProblem {
    /// Build the problem described by `spec` on the CPU.
    pub fn generate(spec: MoeProblemSpec) -> Result<Self> {
        if spec.topk == 0 || spec.topk > spec.num_experts {
            unsupported_bail!(
                "topk {} must be in 1..={} (num_experts)",
                spec.topk,
                spec.num_experts
            );
        }
        let device = Device::Cpu;
        let MoeProblemSpec {
            size_m,
            size_n,
            size_k,
            num_experts,
            topk,
            ..
        } = spec;

        let a = seeded_tensor(spec.seed, (size_m, size_k), 1.0)?;
        let w = seeded_tensor(spec.seed ^ 0xA5A5, (num_experts, size_k, size_n), 0.25)?;
        let experts = marlin_quantize_experts(&w, spec.scalar_type, spec.group_size)?;

        let mut rng = StdRng::seed_from_u64(spec.seed ^ 0x5A5A);
        let mut ids = Vec::with_capacity(size_m * topk);
        let mut weights = Vec::with_capacity(size_m * topk);
        for _ in 0..size_m {
            let start = rng.gen_range(0..num_experts);
            let raw: Vec<f32> = (0..topk).map(|_| rng.gen_range(0.5f32..2.5)).collect();
            let total: f32 = raw.iter().sum();
            for (j, r) in raw.iter().enumerate() {
                ids.push(((start + j) % num_experts) as u32);
                weights.push(r / total);
            }
        }
        let topk_ids = Tensor::from_vec(ids, (size_m, topk), &device)?;
        let topk_weights = Tensor::from_vec(weights, (size_m, topk), &device)?;
        let aligned =
            MoETokenGrouper::new(spec.moe_block_size, num_experts).align_block_size(&topk_ids)?;

        Ok(Self {
            spec,
            a,
            experts,
            topk_ids,
            topk_weights,
            aligned,
        })
    }

    /// Workspace large enough for this problem.
    pub fn workspace(&self) -> MarlinMoeWorkspace {
        let s = &self.spec;
        MarlinMoeWorkspace::new(s.size_n, s.size_k, s.moe_block_size)
    }

    /// Run the grouped GEMM with `replicate_input` on this problem's routing.
    pub fn run(&self, workspace: &mut MarlinMoeWorkspace, apply_weights: bool) -> Result<Tensor> {
        let s = &self.spec;
        marlin_gemm_moe(
            &self.a,
            &self.experts.qweight,
            &self.aligned.sorted_token_ids,
            Some(&self.topk_weights),
            &self.experts.scales,
            &self.aligned.expert_offsets,
            workspace,
            s.size_m,
            s.size_n,
            s.size_k,
            self.aligned.num_tokens_post_padded,
            s.num_experts,
            s.topk,
            s.moe_block_size,
            true,
            apply_weights,
        )
    }

    /// Dense `[size_m, size_n]` result from the dequantized weights.
    pub fn reference(&self, apply_weights: bool) -> Result<Vec<f32>> {
        let weights = apply_weights.then_some(&self.topk_weights);
        let out = dense_reference(&self.a, &self.experts.w_ref, &self.topk_ids, weights)?;
        Ok(out.flatten_all()?.to_vec1()?)
    }
}

/// Token rows routed to each expert with their combination weights.
///
/// Yields `(expert, rows U32 [r], weights F32 [r, 1])` for every expert that
/// received at least one slot; weights are 1 when `topk_weights` is `None`.
fn routed_rows(
    topk_ids: &Tensor,
    topk_weights: Option<&Tensor>,
    num_experts: usize,
) -> Result<Vec<(usize, Tensor, Tensor)>> {
    let ids: Vec<Vec<u32>> = topk_ids.to_dtype(DType::U32)?.to_vec2()?;
    let weights: Option<Vec<Vec<f32>>> = topk_weights
        .map(|w| w.to_dtype(DType::F32)?.to_vec2::<f32>())
        .transpose()?;

    let mut routed = Vec::new();
    for expert in 0..num_experts {
        let mut rows = Vec::new();
        let mut scale = Vec::new();
        for (m, token_ids) in ids.iter().enumerate() {
            for (j, &id) in token_ids.iter().enumerate() {
                if id as usize == expert {
                    rows.push(m as u32);
                    scale.push(weights.as_ref().map_or(1.0, |w| w[m][j]));
                }
            }
        }
        if rows.is_empty() {
            continue;
        }
        let r = rows.len();
        routed.push((
            expert,
            Tensor::from_vec(rows, r, &Device::Cpu)?,
            Tensor::from_vec(scale, (r, 1), &Device::Cpu)?,
        ));
    }
    Ok(routed)
}

/// `out[m] = sum_j w[m, j] * a[m] @ w_ref[ids[m, j]]`, weights 1 when `None`.
///
/// `a` is `[size_m, size_k]`, `w_ref` is `[num_experts, size_k, size_n]` and
/// `topk_ids` is `[size_m, topk]`. Returns F32 `[size_m, size_n]`.
pub fn dense_reference(
    a: &Tensor,
    w_ref: &Tensor,
    topk_ids: &Tensor,
    topk_weights: Option<&Tensor>,
) -> Result<Tensor> {
    let a = a.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
    let w_ref = w_ref.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
    let (num_experts, _, size_n) = w_ref.dims3()?;
    let size_m = a.dim(0)?;

    let mut out = Tensor::zeros((size_m, size_n), DType::F32, &Device::Cpu)?;
    for (expert, rows, scale) in routed_rows(topk_ids, topk_weights, num_experts)? {
        let contrib = a
            .index_select(&rows, 0)?
            .matmul(&w_ref.i(expert)?)?
            .broadcast_mul(&scale)?;
        out = out.index_add(&rows, &contrib, 0)?;
    }
    Ok(out)
}

/// Dense two-projection MoE: `sum_j w[m, j] * (silu(g) * u) @ w2[e]` where
/// `[g | u] = x[m] @ w13[e]` and `e = ids[m, j]`.
///
/// `x` is `[num_tokens, hidden]`, `w13_ref` is `[num_experts, hidden,
/// 2 * intermediate]` and `w2_ref` is `[num_experts, intermediate, hidden]`.
pub fn swiglu_reference(
    x: &Tensor,
    w13_ref: &Tensor,
    w2_ref: &Tensor,
    topk_ids: &Tensor,
    topk_weights: &Tensor,
) -> Result<Tensor> {
    let x = x.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
    let w13_ref = w13_ref.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
    let w2_ref = w2_ref.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
    let (num_experts, inter, hidden) = w2_ref.dims3()?;
    let num_tokens = x.dim(0)?;

    let mut out = Tensor::zeros((num_tokens, hidden), DType::F32, &Device::Cpu)?;
    for (expert, rows, scale) in routed_rows(topk_ids, Some(topk_weights), num_experts)? {
        let gate_up = x.index_select(&rows, 0)?.matmul(&w13_ref.i(expert)?)?;
        let gate = gate_up.narrow(1, 0, inter)?;
        let up = gate_up.narrow(1, inter, inter)?;
        let silu = (&gate / (gate.neg()?.exp()? + 1.0)?)?;
        let down = (silu * up)?
            .matmul(&w2_ref.i(expert)?)?
            .broadcast_mul(&scale)?;
        out = out.index_add(&rows, &down, 0)?;
    }
    Ok(out)
}

/// Largest `|actual - expected| / max(|expected|, 1)`.
pub fn max_rel_error(actual: &[f32], expected: &[f32]) -> f32 {
    actual
        .iter()
        .zip(expected)
        .map(|(a, e)| (a - e).abs() / e.abs().max(1.0))
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_uniform_is_reproducible() {
        let a = seeded_uniform(7, 256, 0.5);
        assert_eq!(a, seeded_uniform(7, 256, 0.5));
        assert_ne!(a, seeded_uniform(8, 256, 0.5));
        assert!(a.iter().all(|v| (-0.5..0.5).contains(v)));
    }

    #[test]
    fn generated_routing_is_valid() {
        let problem = MoeProblem::generate(MoeProblemSpec::default()).unwrap();
        let ids: Vec<Vec<u32>> = problem.topk_ids.to_vec2().unwrap();
        for row in &ids {
            assert_ne!(row[0], row[1]);
            assert!(row.iter().all(|&e| e < 4));
        }
        let weights: Vec<Vec<f32>> = problem.topk_weights.to_vec2().unwrap();
        for row in &weights {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&w| w > 0.0));
        }
    }

    #[test]
    fn dense_reference_single_slot() {
        // size_m = 1, size_k = 2, size_n = 2, two experts
        let a = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let w_ref = Tensor::new(
            &[[[1.0f32, 0.0], [0.0, 1.0]], [[2.0, 2.0], [2.0, 2.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let ids = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        let weights = Tensor::new(&[[0.5f32]], &Device::Cpu).unwrap();

        let out = dense_reference(&a, &w_ref, &ids, Some(&weights)).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![3.0, 3.0]]);

        let ids = Tensor::new(&[[0u32]], &Device::Cpu).unwrap();
        let unweighted = dense_reference(&a, &w_ref, &ids, None).unwrap();
        assert_eq!(unweighted.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn swiglu_reference_single_token() {
        // hidden = 1, intermediate = 1, one expert: gate = 2x, up = 3x, down = 4
        let x = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();
        let w13 = Tensor::new(&[[[2.0f32, 3.0]]], &Device::Cpu).unwrap();
        let w2 = Tensor::new(&[[[4.0f32]]], &Device::Cpu).unwrap();
        let ids = Tensor::new(&[[0u32]], &Device::Cpu).unwrap();
        let weights = Tensor::new(&[[0.5f32]], &Device::Cpu).unwrap();

        let out = swiglu_reference(&x, &w13, &w2, &ids, &weights).unwrap();
        let silu_2 = 2.0 / (1.0 + (-2.0f32).exp());
        let expected = 0.5 * silu_2 * 3.0 * 4.0;
        let got = out.to_vec2::<f32>().unwrap()[0][0];
        assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
    }

    #[test]
    fn generate_rejects_topk_above_experts() {
        let spec = MoeProblemSpec {
            topk: 5,
            ..Default::default()
        };
        assert!(MoeProblem::generate(spec).is_err());
    }
}
