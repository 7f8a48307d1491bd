//! Entry points of the grouped Marlin MoE GEMM.
//!
//! [`marlin_gemm_moe`] multiplies every routed token slot by the Marlin-packed
//! weights of its expert and sums the slots of each token into a
//! `[size_m, size_n]` result. [`marlin_gemm_moe_slots`] returns the same
//! products before the slot reduction, `[size_m, topk, size_n]`, which is what
//! a two-projection MoE needs between its GEMMs.
//!
//! # Argument conventions
//!
//! - `a`: `[size_m, size_k]` when `replicate_input` (every slot of a token
//!   reads the token's row), `[size_m * topk, size_k]` otherwise (one row per
//!   slot, e.g. the activated output of a previous grouped GEMM)
//! - `b_q_weights`: U32 `[num_experts, size_k / 16, size_n * 16 / pack_factor]`
//! - `b_scales`: `[num_experts, num_groups, size_n]`, Marlin-permuted
//! - `sorted_ids`: `[num_tokens_post_padded]`; ids `>= size_m * topk` are padding
//! - `expert_offsets`: `[num_experts + 1]` segment boundaries into `sorted_ids`
//! - `topk_weights`: `[size_m, topk]`, required when `apply_weights`
//!
//! # Devices
//!
//! CPU tensors run on the host engine. CUDA tensors are staged through host
//! memory and the result is moved back to the activation's device. Other
//! devices are rejected.

use candle_core::{DType, Device, Tensor};

use super::config::validate_moe_block_size;
use super::grouped_gemm::{grouped_gemm, reduce_slots, HostOperands, MoeGemmShape};
use super::workspace::MarlinMoeWorkspace;
use crate::error::{shape_bail, unsupported_bail, Result};
use crate::quantization::marlin::{
    check_marlin_supported, check_marlin_supports_shape, group_size_from_num_groups,
    marlin_unpermute_scales, GPTQ_MARLIN_TILE, MARLIN_SUPPORTED_GROUP_SIZES,
};
use crate::quantization::MarlinScalarType;

/// Tensors of one grouped GEMM call.
struct MoeGemmTensors<'a> {
    a: &'a Tensor,
    b_q_weights: &'a Tensor,
    sorted_ids: &'a Tensor,
    topk_weights: Option<&'a Tensor>,
    b_scales: &'a Tensor,
    expert_offsets: &'a Tensor,
}

/// Routing metadata copied to the host and checked.
#[derive(Debug, PartialEq, Eq)]
struct RoutingMetadata {
    /// Padding positions are normalized to `size_m * topk`.
    sorted_ids: Vec<usize>,
    expert_offsets: Vec<usize>,
}

/// Grouped Marlin MoE GEMM reduced over each token's slots.
///
/// Returns `[size_m, size_n]` in the dtype and on the device of `a`. Token
/// slots absent from `sorted_ids` contribute zero.
#[allow(clippy::too_many_arguments)]
pub fn marlin_gemm_moe(
    a: &Tensor,
    b_q_weights: &Tensor,
    sorted_ids: &Tensor,
    topk_weights: Option<&Tensor>,
    b_scales: &Tensor,
    expert_offsets: &Tensor,
    workspace: &mut MarlinMoeWorkspace,
    size_m: usize,
    size_n: usize,
    size_k: usize,
    num_tokens_post_padded: usize,
    num_experts: usize,
    topk: usize,
    moe_block_size: usize,
    replicate_input: bool,
    apply_weights: bool,
) -> Result<Tensor> {
    let shape = MoeGemmShape {
        size_m,
        size_n,
        size_k,
        num_tokens_post_padded,
        num_experts,
        topk,
        moe_block_size,
        replicate_input,
        apply_weights,
    };
    let tensors = MoeGemmTensors {
        a,
        b_q_weights,
        sorted_ids,
        topk_weights,
        b_scales,
        expert_offsets,
    };
    let slots = execute(&tensors, workspace, &shape)?;
    let reduced = reduce_slots(&slots, size_m, topk, size_n);
    to_output(reduced, (size_m, size_n), a)
}

/// Grouped Marlin MoE GEMM without the slot reduction.
///
/// Returns `[size_m, topk, size_n]`; slot `j` of token `m` holds the product
/// for sorted id `m * topk + j`, or zeros if that id is not routed.
#[allow(clippy::too_many_arguments)]
pub fn marlin_gemm_moe_slots(
    a: &Tensor,
    b_q_weights: &Tensor,
    sorted_ids: &Tensor,
    topk_weights: Option<&Tensor>,
    b_scales: &Tensor,
    expert_offsets: &Tensor,
    workspace: &mut MarlinMoeWorkspace,
    size_m: usize,
    size_n: usize,
    size_k: usize,
    num_tokens_post_padded: usize,
    num_experts: usize,
    topk: usize,
    moe_block_size: usize,
    replicate_input: bool,
    apply_weights: bool,
) -> Result<Tensor> {
    let shape = MoeGemmShape {
        size_m,
        size_n,
        size_k,
        num_tokens_post_padded,
        num_experts,
        topk,
        moe_block_size,
        replicate_input,
        apply_weights,
    };
    let tensors = MoeGemmTensors {
        a,
        b_q_weights,
        sorted_ids,
        topk_weights,
        b_scales,
        expert_offsets,
    };
    let slots = execute(&tensors, workspace, &shape)?;
    to_output(slots, (size_m, topk, size_n), a)
}

fn to_output<S: Into<candle_core::Shape>>(
    data: Vec<f32>,
    shape: S,
    a: &Tensor,
) -> Result<Tensor> {
    let out = Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_dtype(a.dtype())?
        .to_device(a.device())?;
    Ok(out)
}

fn execute(
    tensors: &MoeGemmTensors<'_>,
    workspace: &mut MarlinMoeWorkspace,
    shape: &MoeGemmShape,
) -> Result<Vec<f32>> {
    tracing::debug!(
        size_m = shape.size_m,
        size_n = shape.size_n,
        size_k = shape.size_k,
        num_experts = shape.num_experts,
        topk = shape.topk,
        moe_block_size = shape.moe_block_size,
        num_tokens_post_padded = shape.num_tokens_post_padded,
        replicate_input = shape.replicate_input,
        apply_weights = shape.apply_weights,
        "marlin_gemm_moe"
    );

    validate_dims(shape)?;
    validate_activations(tensors.a, shape)?;
    let scalar_type = infer_scalar_type(tensors.b_q_weights, shape)?;
    let (num_groups, group_size) = validate_scales(tensors.b_scales, scalar_type, shape)?;
    let routing = load_routing(tensors.sorted_ids, tensors.expert_offsets, shape)?;

    let topk_weights = if shape.apply_weights {
        let Some(weights) = tensors.topk_weights else {
            shape_bail!("apply_weights is set but no topk_weights were given");
        };
        if weights.dims() != [shape.size_m, shape.topk] {
            shape_bail!(
                "topk_weights has shape {:?}, expected [{}, {}]",
                weights.dims(),
                shape.size_m,
                shape.topk
            );
        }
        Some(weights.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
    } else {
        None
    };

    let scratch = workspace.views(shape.size_n, shape.size_k, shape.moe_block_size)?;

    let a: Vec<f32> = tensors.a.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let b_q: Vec<u32> = tensors.b_q_weights.flatten_all()?.to_vec1()?;
    let scales: Vec<f32> =
        marlin_unpermute_scales(tensors.b_scales, shape.size_k, shape.size_n, group_size)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;

    let ops = HostOperands {
        a: &a,
        b_q: &b_q,
        scales: &scales,
        topk_weights: topk_weights.as_deref(),
        sorted_ids: &routing.sorted_ids,
        expert_offsets: &routing.expert_offsets,
        scalar_type,
        num_groups,
    };
    Ok(grouped_gemm(shape, &ops, scratch))
}

fn validate_dims(shape: &MoeGemmShape) -> Result<()> {
    if shape.size_m == 0 || shape.size_n == 0 || shape.size_k == 0 {
        shape_bail!(
            "size_m, size_n and size_k must be positive (got {}, {}, {})",
            shape.size_m,
            shape.size_n,
            shape.size_k
        );
    }
    if shape.num_experts == 0 {
        shape_bail!("num_experts must be at least 1");
    }
    if shape.topk == 0 {
        shape_bail!("topk must be at least 1");
    }
    validate_moe_block_size(shape.moe_block_size)?;
    check_marlin_supports_shape(shape.size_n, shape.size_k, -1)
}

fn validate_activations(a: &Tensor, shape: &MoeGemmShape) -> Result<()> {
    match a.device() {
        Device::Cpu | Device::Cuda(_) => {}
        other => unsupported_bail!("no grouped Marlin MoE backend for {:?}", other.location()),
    }
    if !matches!(a.dtype(), DType::F16 | DType::BF16 | DType::F32) {
        unsupported_bail!("activation dtype {:?} is not supported", a.dtype());
    }
    if a.dims() != [shape.a_rows(), shape.size_k] {
        shape_bail!(
            "a has shape {:?}, expected [{}, {}] (replicate_input={})",
            a.dims(),
            shape.a_rows(),
            shape.size_k,
            shape.replicate_input
        );
    }
    Ok(())
}

fn infer_scalar_type(b_q_weights: &Tensor, shape: &MoeGemmShape) -> Result<MarlinScalarType> {
    if b_q_weights.dtype() != DType::U32 {
        unsupported_bail!(
            "b_q_weights must hold packed U32 words, got {:?}",
            b_q_weights.dtype()
        );
    }
    let (experts, k_tiles, packed_n) = match b_q_weights.dims() {
        &[e, k, n] => (e, k, n),
        dims => shape_bail!("b_q_weights must be 3D, got {:?}", dims),
    };
    if experts != shape.num_experts {
        shape_bail!(
            "b_q_weights holds {} experts, num_experts is {}",
            experts,
            shape.num_experts
        );
    }
    if k_tiles * GPTQ_MARLIN_TILE != shape.size_k {
        shape_bail!(
            "b_q_weights has {} K tiles, size_k {} needs {}",
            k_tiles,
            shape.size_k,
            shape.size_k / GPTQ_MARLIN_TILE
        );
    }
    let tile_row = shape.size_n * GPTQ_MARLIN_TILE;
    if packed_n == 0 || tile_row % packed_n != 0 {
        shape_bail!(
            "b_q_weights row of {} words does not pack size_n {}",
            packed_n,
            shape.size_n
        );
    }
    let pack_factor = tile_row / packed_n;
    match MarlinScalarType::symmetric((32 / pack_factor.max(1)) as u32) {
        Some(scalar_type) if scalar_type.pack_factor() == pack_factor => Ok(scalar_type),
        _ => unsupported_bail!(
            "pack factor {} (b_q_weights row of {} words) is not a Marlin format",
            pack_factor,
            packed_n
        ),
    }
}

fn validate_scales(
    b_scales: &Tensor,
    scalar_type: MarlinScalarType,
    shape: &MoeGemmShape,
) -> Result<(usize, i32)> {
    let (experts, num_groups, size_n) = match b_scales.dims() {
        &[e, g, n] => (e, g, n),
        dims => shape_bail!("b_scales must be 3D, got {:?}", dims),
    };
    if experts != shape.num_experts || size_n != shape.size_n {
        shape_bail!(
            "b_scales has shape {:?}, expected [{}, num_groups, {}]",
            b_scales.dims(),
            shape.num_experts,
            shape.size_n
        );
    }
    if !b_scales.dtype().is_float() {
        unsupported_bail!("b_scales dtype {:?} is not a float type", b_scales.dtype());
    }
    let group_size = group_size_from_num_groups(shape.size_k, num_groups)?;
    if !check_marlin_supported(scalar_type, group_size, false, None) {
        unsupported_bail!(
            "group_size {} is not supported for {}. Supported: {:?}",
            group_size,
            scalar_type,
            MARLIN_SUPPORTED_GROUP_SIZES
        );
    }
    check_marlin_supports_shape(shape.size_n, shape.size_k, group_size)?;
    Ok((num_groups, group_size))
}

fn load_index_vector(t: &Tensor, name: &str) -> Result<Vec<i64>> {
    if t.rank() != 1 {
        shape_bail!("{} must be 1D, got {:?}", name, t.dims());
    }
    if !matches!(t.dtype(), DType::U8 | DType::U32 | DType::I64) {
        unsupported_bail!("{} must be an integer tensor, got {:?}", name, t.dtype());
    }
    Ok(t.to_dtype(DType::I64)?.to_vec1()?)
}

fn load_routing(
    sorted_ids: &Tensor,
    expert_offsets: &Tensor,
    shape: &MoeGemmShape,
) -> Result<RoutingMetadata> {
    let ids = load_index_vector(sorted_ids, "sorted_ids")?;
    if ids.len() != shape.num_tokens_post_padded {
        shape_bail!(
            "sorted_ids has {} entries, num_tokens_post_padded is {}",
            ids.len(),
            shape.num_tokens_post_padded
        );
    }

    let offsets = load_index_vector(expert_offsets, "expert_offsets")?;
    if offsets.len() != shape.num_experts + 1 {
        shape_bail!(
            "expert_offsets has {} entries, expected num_experts + 1 = {}",
            offsets.len(),
            shape.num_experts + 1
        );
    }
    if offsets[0] != 0 {
        shape_bail!("expert_offsets must start at 0, got {}", offsets[0]);
    }
    if offsets[shape.num_experts] != shape.num_tokens_post_padded as i64 {
        shape_bail!(
            "expert_offsets must end at num_tokens_post_padded {}, got {}",
            shape.num_tokens_post_padded,
            offsets[shape.num_experts]
        );
    }
    for (expert, bounds) in offsets.windows(2).enumerate() {
        if bounds[1] < bounds[0] {
            shape_bail!(
                "expert_offsets decrease at expert {}: {} > {}",
                expert,
                bounds[0],
                bounds[1]
            );
        }
    }
    if let Some(off) = offsets
        .iter()
        .find(|&&o| o as usize % shape.moe_block_size != 0)
    {
        shape_bail!(
            "expert offset {} is not a multiple of moe_block_size {}",
            off,
            shape.moe_block_size
        );
    }

    let num_slots = shape.num_slots();
    let mut seen = vec![false; num_slots];
    let mut normalized = Vec::with_capacity(ids.len());
    for id in ids {
        match usize::try_from(id).ok().filter(|&id| id < num_slots) {
            Some(slot) => {
                if std::mem::replace(&mut seen[slot], true) {
                    shape_bail!("token slot {} appears more than once in sorted_ids", slot);
                }
                normalized.push(slot);
            }
            None => normalized.push(num_slots),
        }
    }

    Ok(RoutingMetadata {
        sorted_ids: normalized,
        expert_offsets: offsets.into_iter().map(|o| o as usize).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MoeGemmError;

    fn shape(size_m: usize, topk: usize, num_experts: usize, padded: usize) -> MoeGemmShape {
        MoeGemmShape {
            size_m,
            size_n: 64,
            size_k: 64,
            num_tokens_post_padded: padded,
            num_experts,
            topk,
            moe_block_size: 16,
            replicate_input: true,
            apply_weights: false,
        }
    }

    #[test]
    fn test_load_routing_normalizes_padding() {
        let device = Device::Cpu;
        let mut ids = vec![100u32; 32];
        ids[0] = 3;
        ids[1] = 0;
        ids[16] = 2;
        let sorted_ids = Tensor::from_vec(ids, 32, &device).unwrap();
        let offsets = Tensor::new(&[0u32, 16, 32], &device).unwrap();

        let routing = load_routing(&sorted_ids, &offsets, &shape(2, 2, 2, 32)).unwrap();
        assert_eq!(routing.expert_offsets, vec![0, 16, 32]);
        assert_eq!(routing.sorted_ids[..2], [3, 0]);
        assert_eq!(routing.sorted_ids[16], 2);
        assert_eq!(routing.sorted_ids.iter().filter(|&&id| id == 4).count(), 29);
    }

    #[test]
    fn test_load_routing_rejects_bad_offsets() {
        let device = Device::Cpu;
        let sorted_ids = Tensor::from_vec(vec![4u32; 32], 32, &device).unwrap();
        let s = shape(2, 2, 2, 32);

        for offsets in [
            vec![0u32, 16],         // wrong length
            vec![16, 16, 32],       // does not start at 0
            vec![0, 16, 16],        // does not span the padded length
            vec![0, 20, 32],        // not block aligned
        ] {
            let offsets = Tensor::from_vec(offsets.clone(), offsets.len(), &device).unwrap();
            let err = load_routing(&sorted_ids, &offsets, &s).unwrap_err();
            assert!(matches!(err, MoeGemmError::ShapeMismatch(_)), "{err}");
        }

        let decreasing = Tensor::from_vec(vec![0i64, 32, 16, 32], 4, &device).unwrap();
        let err = load_routing(&sorted_ids, &decreasing, &shape(2, 2, 3, 32)).unwrap_err();
        assert!(err.to_string().contains("decrease"));
    }

    #[test]
    fn test_load_routing_rejects_length_and_duplicates() {
        let device = Device::Cpu;
        let offsets = Tensor::new(&[0u32, 16], &device).unwrap();

        let short = Tensor::from_vec(vec![4u32; 8], 8, &device).unwrap();
        assert!(load_routing(&short, &offsets, &shape(2, 2, 1, 16)).is_err());

        let mut ids = vec![4u32; 16];
        ids[0] = 1;
        ids[5] = 1;
        let dup = Tensor::from_vec(ids, 16, &device).unwrap();
        let err = load_routing(&dup, &offsets, &shape(2, 2, 1, 16)).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_load_routing_rejects_float_ids() {
        let device = Device::Cpu;
        let ids = Tensor::zeros(16, DType::F32, &device).unwrap();
        let offsets = Tensor::new(&[0u32, 16], &device).unwrap();
        let err = load_routing(&ids, &offsets, &shape(2, 2, 1, 16)).unwrap_err();
        assert!(matches!(err, MoeGemmError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_validate_dims() {
        assert!(validate_dims(&shape(1, 1, 1, 16)).is_ok());
        assert!(validate_dims(&shape(0, 1, 1, 16)).is_err());
        assert!(validate_dims(&shape(1, 0, 1, 16)).is_err());
        assert!(validate_dims(&shape(1, 1, 0, 16)).is_err());

        let mut odd_block = shape(1, 1, 1, 16);
        odd_block.moe_block_size = 8;
        assert!(matches!(
            validate_dims(&odd_block).unwrap_err(),
            MoeGemmError::UnsupportedConfiguration(_)
        ));

        let mut odd_n = shape(1, 1, 1, 16);
        odd_n.size_n = 96;
        assert!(matches!(
            validate_dims(&odd_n).unwrap_err(),
            MoeGemmError::ShapeMismatch(_)
        ));
    }

    #[test]
    fn test_infer_scalar_type() {
        let device = Device::Cpu;
        let s = shape(1, 1, 2, 16);

        let int4 = Tensor::zeros((2, 4, 64 * 16 / 8), DType::U32, &device).unwrap();
        assert_eq!(infer_scalar_type(&int4, &s).unwrap(), MarlinScalarType::Uint4b8);

        let int8 = Tensor::zeros((2, 4, 64 * 16 / 4), DType::U32, &device).unwrap();
        assert_eq!(infer_scalar_type(&int8, &s).unwrap(), MarlinScalarType::Uint8b128);

        // 2-bit packing
        let int2 = Tensor::zeros((2, 4, 64 * 16 / 16), DType::U32, &device).unwrap();
        assert!(matches!(
            infer_scalar_type(&int2, &s).unwrap_err(),
            MoeGemmError::UnsupportedConfiguration(_)
        ));

        // Wrong expert count
        let wrong = Tensor::zeros((3, 4, 128), DType::U32, &device).unwrap();
        assert!(matches!(
            infer_scalar_type(&wrong, &s).unwrap_err(),
            MoeGemmError::ShapeMismatch(_)
        ));

        let wrong_dtype = Tensor::zeros((2, 4, 128), DType::I64, &device).unwrap();
        assert!(matches!(
            infer_scalar_type(&wrong_dtype, &s).unwrap_err(),
            MoeGemmError::UnsupportedConfiguration(_)
        ));
    }

    #[test]
    fn test_validate_scales_group_sizes() {
        let device = Device::Cpu;
        let mut s = shape(1, 1, 1, 16);
        s.size_k = 128;

        let per_channel = Tensor::zeros((1, 1, 64), DType::F16, &device).unwrap();
        assert_eq!(
            validate_scales(&per_channel, MarlinScalarType::Uint4b8, &s).unwrap(),
            (1, -1)
        );

        let grouped = Tensor::zeros((1, 4, 64), DType::F16, &device).unwrap();
        assert_eq!(
            validate_scales(&grouped, MarlinScalarType::Uint4b8, &s).unwrap(),
            (4, 32)
        );

        // group size 16 is not a Marlin group size
        let too_fine = Tensor::zeros((1, 8, 64), DType::F16, &device).unwrap();
        assert!(matches!(
            validate_scales(&too_fine, MarlinScalarType::Uint4b8, &s).unwrap_err(),
            MoeGemmError::UnsupportedConfiguration(_)
        ));

        let wrong_n = Tensor::zeros((1, 1, 128), DType::F16, &device).unwrap();
        assert!(matches!(
            validate_scales(&wrong_n, MarlinScalarType::Uint4b8, &s).unwrap_err(),
            MoeGemmError::ShapeMismatch(_)
        ));
    }
}
