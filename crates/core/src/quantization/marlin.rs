//! Marlin packed weight format for grouped expert GEMMs.
//!
//! Marlin stores each expert's `[K, N]` weight matrix in a layout tuned for
//! tensor core MMA fragments:
//! - Weights are split into 16x16 tiles (GPTQ_MARLIN_TILE = 16) and every
//!   tile row of `N * 16` values is reordered by a fixed 1024-entry
//!   permutation before `32 / bits` values are packed into one `u32`
//! - Scales are permuted so that one warp reads them with coalesced loads
//! - Supports group sizes: -1 (per-channel), 32, 64, 128
//!
//! # Supported Types
//!
//! - INT4 symmetric (uint4b8): GPTQ-style with 8-offset bias
//! - INT8 symmetric (uint8b128): 128-offset bias
//!
//! # Requirements
//!
//! - N dimension divisible by 64 (MARLIN_MOE_MIN_THREAD_N)
//! - K dimension divisible by 64 (MARLIN_MOE_MIN_THREAD_K)

use candle_core::{DType, Tensor};
use half::f16;

use super::scalar_type::MarlinScalarType;
use crate::error::{shape_bail, unsupported_bail, Result};

/// Tile size for Marlin kernel operations
pub const GPTQ_MARLIN_TILE: usize = 16;
/// Minimum thread tile size in N dimension
pub const MARLIN_MOE_MIN_THREAD_N: usize = 64;
/// Minimum thread tile size in K dimension
pub const MARLIN_MOE_MIN_THREAD_K: usize = 64;
/// Number of values reordered by one application of the weight permutation.
pub const MARLIN_PERM_LEN: usize = 1024;
/// Minimum device compute capability (Ampere).
pub const MARLIN_MIN_CAPABILITY: u32 = 80;

/// Supported group sizes for Marlin kernel
pub const MARLIN_SUPPORTED_GROUP_SIZES: &[i32] = &[-1, 32, 64, 128];

/// Check if Marlin is supported for the given configuration.
pub fn check_marlin_supported(
    scalar_type: MarlinScalarType,
    group_size: i32,
    has_zp: bool,
    device_capability: Option<u32>,
) -> bool {
    let capability = device_capability.unwrap_or(0);

    if capability > 0 && capability < MARLIN_MIN_CAPABILITY {
        return false;
    }

    let supported_types: &[MarlinScalarType] = if has_zp {
        &[MarlinScalarType::Uint4]
    } else {
        &[MarlinScalarType::Uint4b8, MarlinScalarType::Uint8b128]
    };

    if !supported_types.contains(&scalar_type) {
        return false;
    }

    MARLIN_SUPPORTED_GROUP_SIZES.contains(&group_size)
}

/// Check if Marlin supports the given shape.
pub fn check_marlin_supports_shape(size_n: usize, size_k: usize, group_size: i32) -> Result<()> {
    if size_n % MARLIN_MOE_MIN_THREAD_N != 0 {
        shape_bail!(
            "Marlin requires size_n ({}) to be divisible by {} (MARLIN_MOE_MIN_THREAD_N)",
            size_n,
            MARLIN_MOE_MIN_THREAD_N
        );
    }

    if size_k % MARLIN_MOE_MIN_THREAD_K != 0 {
        shape_bail!(
            "Marlin requires size_k ({}) to be divisible by {} (MARLIN_MOE_MIN_THREAD_K)",
            size_k,
            MARLIN_MOE_MIN_THREAD_K
        );
    }

    if group_size > 0 && size_k % group_size as usize != 0 {
        shape_bail!(
            "Marlin requires size_k ({}) to be divisible by group_size ({})",
            size_k,
            group_size
        );
    }

    Ok(())
}

/// Group size implied by the number of scale groups along K.
///
/// A single group means per-channel scales, reported as `-1`.
pub fn group_size_from_num_groups(size_k: usize, num_groups: usize) -> Result<i32> {
    if num_groups == 0 || size_k % num_groups != 0 {
        shape_bail!(
            "size_k ({}) cannot be split into {} scale groups",
            size_k,
            num_groups
        );
    }
    if num_groups == 1 {
        Ok(-1)
    } else {
        Ok((size_k / num_groups) as i32)
    }
}

/// Weight permutation applied to every 1024 consecutive tile values.
///
/// `permuted[j] = tiled[perm[j]]` within each chunk.
pub fn marlin_weight_perm(bits: u32) -> Vec<usize> {
    let mut perm = Vec::with_capacity(MARLIN_PERM_LEN);
    for i in 0..32 {
        let col = i / 4;
        let mut perm1 = Vec::with_capacity(8);
        for block in 0..2 {
            for row in [
                2 * (i % 4),
                2 * (i % 4) + 1,
                2 * (i % 4 + 4),
                2 * (i % 4 + 4) + 1,
            ] {
                perm1.push(16 * row + col + 8 * block);
            }
        }
        for j in 0..4 {
            perm.extend(perm1.iter().map(|p| p + 256 * j));
        }
    }

    let interleave: &[usize] = if bits == 4 {
        &[0, 2, 4, 6, 1, 3, 5, 7]
    } else {
        &[0, 2, 1, 3]
    };
    perm.chunks_exact(interleave.len())
        .flat_map(|chunk| interleave.iter().map(move |&i| chunk[i]))
        .collect()
}

/// Permutation indices for scale reordering.
fn get_scale_perms() -> (Vec<usize>, Vec<usize>) {
    // Full permutation for grouped scales
    let mut scale_perm = Vec::with_capacity(64);
    for i in 0..8 {
        for j in 0..8 {
            scale_perm.push(i + 8 * j);
        }
    }

    // Single permutation for per-channel scales
    let mut scale_perm_single = Vec::with_capacity(32);
    for i in 0..4 {
        scale_perm_single.extend([
            2 * i,
            2 * i + 1,
            2 * i + 8,
            2 * i + 9,
            2 * i + 16,
            2 * i + 17,
            2 * i + 24,
            2 * i + 25,
        ]);
    }

    (scale_perm, scale_perm_single)
}

fn scale_perm_for(size_k: usize, group_size: i32) -> Vec<usize> {
    let (scale_perm, scale_perm_single) = get_scale_perms();
    if group_size > 0 && (group_size as usize) < size_k {
        scale_perm
    } else {
        scale_perm_single
    }
}

fn invert_perm(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (j, &p) in perm.iter().enumerate() {
        inv[p] = j;
    }
    inv
}

fn apply_scale_perm(scales: &Tensor, size_n: usize, perm: &[usize]) -> Result<Tensor> {
    let shape = scales.shape().clone();
    if scales.elem_count() % perm.len() != 0 || size_n % perm.len() != 0 {
        shape_bail!(
            "scales of shape {:?} cannot be permuted in chunks of {}",
            shape,
            perm.len()
        );
    }
    let perm_tensor = Tensor::new(
        perm.iter().map(|&x| x as u32).collect::<Vec<_>>(),
        scales.device(),
    )?;
    let permuted = scales
        .reshape(((), perm.len()))?
        .index_select(&perm_tensor, 1)?
        .reshape(shape)?
        .contiguous()?;
    Ok(permuted)
}

/// Permute scales for Marlin format.
///
/// Works on `[num_groups, N]` and on stacked `[E, num_groups, N]` scales; the
/// shape is preserved.
pub fn marlin_permute_scales(
    scales: &Tensor,
    size_k: usize,
    size_n: usize,
    group_size: i32,
) -> Result<Tensor> {
    apply_scale_perm(scales, size_n, &scale_perm_for(size_k, group_size))
}

/// Undo [`marlin_permute_scales`].
pub fn marlin_unpermute_scales(
    scales: &Tensor,
    size_k: usize,
    size_n: usize,
    group_size: i32,
) -> Result<Tensor> {
    let inv = invert_perm(&scale_perm_for(size_k, group_size));
    apply_scale_perm(scales, size_n, &inv)
}

fn check_tile_shape(size_k: usize, size_n: usize) -> Result<()> {
    if size_k % GPTQ_MARLIN_TILE != 0 {
        shape_bail!("size_k ({}) must be a multiple of {}", size_k, GPTQ_MARLIN_TILE);
    }
    if size_n % MARLIN_MOE_MIN_THREAD_N != 0 {
        shape_bail!(
            "size_n ({}) must be a multiple of {}",
            size_n,
            MARLIN_MOE_MIN_THREAD_N
        );
    }
    Ok(())
}

/// Map a position in the tiled `[K / 16, N * 16]` layout back to `(k, n)`.
#[inline]
fn tiled_to_kn(pos: usize, size_n: usize) -> (usize, usize) {
    let row_len = size_n * GPTQ_MARLIN_TILE;
    let k_tile = pos / row_len;
    let rem = pos % row_len;
    let n_tile = rem / (GPTQ_MARLIN_TILE * GPTQ_MARLIN_TILE);
    let in_tile = rem % (GPTQ_MARLIN_TILE * GPTQ_MARLIN_TILE);
    (
        k_tile * GPTQ_MARLIN_TILE + in_tile / GPTQ_MARLIN_TILE,
        n_tile * GPTQ_MARLIN_TILE + in_tile % GPTQ_MARLIN_TILE,
    )
}

/// Number of `u32` words in one expert's packed weights.
pub fn packed_len(size_k: usize, size_n: usize, scalar_type: MarlinScalarType) -> usize {
    size_k * size_n / scalar_type.pack_factor()
}

/// Pack row-major `[K, N]` quantized values into Marlin layout.
///
/// Input values are stored integers (bias already added). Output shape is
/// `[K / 16, N * 16 / pack_factor]`, flattened.
pub fn marlin_pack_weights(
    q_w: &[u32],
    size_k: usize,
    size_n: usize,
    scalar_type: MarlinScalarType,
) -> Result<Vec<u32>> {
    check_tile_shape(size_k, size_n)?;
    if q_w.len() != size_k * size_n {
        shape_bail!(
            "expected {} quantized values for [{}, {}], got {}",
            size_k * size_n,
            size_k,
            size_n,
            q_w.len()
        );
    }

    let perm = marlin_weight_perm(scalar_type.bits());
    let bits = scalar_type.bits();
    let pack_factor = scalar_type.pack_factor();
    let mask = scalar_type.mask();

    let mut packed = vec![0u32; packed_len(size_k, size_n, scalar_type)];
    for (flat, word_slot) in (0..size_k * size_n).map(|f| (f, f / pack_factor)) {
        let chunk_base = flat - flat % MARLIN_PERM_LEN;
        let src = chunk_base + perm[flat % MARLIN_PERM_LEN];
        let (k, n) = tiled_to_kn(src, size_n);
        let value = q_w[k * size_n + n] & mask;
        packed[word_slot] |= value << (bits * (flat % pack_factor) as u32);
    }
    Ok(packed)
}

/// Unpack Marlin-layout words back to row-major `[K, N]` stored values.
pub fn marlin_unpack_weights(
    packed: &[u32],
    size_k: usize,
    size_n: usize,
    scalar_type: MarlinScalarType,
) -> Result<Vec<u32>> {
    check_tile_shape(size_k, size_n)?;
    if packed.len() != packed_len(size_k, size_n, scalar_type) {
        shape_bail!(
            "expected {} packed words for [{}, {}], got {}",
            packed_len(size_k, size_n, scalar_type),
            size_k,
            size_n,
            packed.len()
        );
    }

    let perm = marlin_weight_perm(scalar_type.bits());
    let mut q_w = vec![0u32; size_k * size_n];
    for_each_packed_value(packed, &perm, size_n, scalar_type, |k, n, q| {
        q_w[k * size_n + n] = q;
    });
    Ok(q_w)
}

/// Visit every packed value with its `(k, n)` coordinate.
pub(crate) fn for_each_packed_value(
    packed: &[u32],
    perm: &[usize],
    size_n: usize,
    scalar_type: MarlinScalarType,
    mut f: impl FnMut(usize, usize, u32),
) {
    let bits = scalar_type.bits();
    let pack_factor = scalar_type.pack_factor();
    let mask = scalar_type.mask();

    for (word_idx, &word) in packed.iter().enumerate() {
        for t in 0..pack_factor {
            let flat = word_idx * pack_factor + t;
            let chunk_base = flat - flat % MARLIN_PERM_LEN;
            let src = chunk_base + perm[flat % MARLIN_PERM_LEN];
            let (k, n) = tiled_to_kn(src, size_n);
            f(k, n, (word >> (bits * t as u32)) & mask);
        }
    }
}

/// Output of symmetric group quantization.
#[derive(Debug, Clone)]
pub struct QuantizedWeights {
    /// Stored integers (bias included), row-major `[K, N]`.
    pub q_w: Vec<u32>,
    /// Scales `[num_groups, N]`, already rounded to f16 precision.
    pub scales: Vec<f32>,
    /// Dequantized reference `[K, N]`.
    pub w_ref: Vec<f32>,
    /// Number of scale groups along K.
    pub num_groups: usize,
}

/// Symmetric per-group quantization of a row-major `[K, N]` matrix.
pub fn quantize_weights(
    w: &[f32],
    size_k: usize,
    size_n: usize,
    scalar_type: MarlinScalarType,
    group_size: i32,
) -> Result<QuantizedWeights> {
    if scalar_type.has_zero_point() {
        unsupported_bail!("zero-point quantization ({}) is not supported", scalar_type);
    }
    if w.len() != size_k * size_n {
        shape_bail!(
            "expected {} weights for [{}, {}], got {}",
            size_k * size_n,
            size_k,
            size_n,
            w.len()
        );
    }
    let group_len = if group_size <= 0 {
        size_k
    } else {
        group_size as usize
    };
    if group_len > size_k || size_k % group_len != 0 {
        shape_bail!("group_size {} does not divide size_k {}", group_size, size_k);
    }

    let num_groups = size_k / group_len;
    let max_q = scalar_type.max() as f32;
    let min_q = scalar_type.min() as f32;
    let bias = scalar_type.bias();

    let mut q_w = vec![0u32; size_k * size_n];
    let mut w_ref = vec![0f32; size_k * size_n];
    let mut scales = vec![0f32; num_groups * size_n];

    for g in 0..num_groups {
        let rows = g * group_len..(g + 1) * group_len;
        for n in 0..size_n {
            let (lo, hi) = rows.clone().fold((f32::MAX, f32::MIN), |(lo, hi), k| {
                let v = w[k * size_n + n];
                (lo.min(v), hi.max(v))
            });
            let scale = (hi.abs() / max_q).max(lo.abs() / min_q.abs());
            let scale = f16::from_f32(scale).to_f32();
            // All-zero column: any positive scale reproduces it exactly.
            let scale = if scale > 0.0 { scale } else { 1.0 };
            scales[g * size_n + n] = scale;

            for k in rows.clone() {
                let idx = k * size_n + n;
                let q = (w[idx] / scale).round_ties_even().clamp(min_q, max_q);
                w_ref[idx] = q * scale;
                q_w[idx] = (q as i32 + bias) as u32;
            }
        }
    }

    Ok(QuantizedWeights {
        q_w,
        scales,
        w_ref,
        num_groups,
    })
}

/// Stacked Marlin expert weights ready for the grouped GEMM.
#[derive(Debug, Clone)]
pub struct MarlinExperts {
    /// Packed weights `[E, K / 16, N * 16 / pack_factor]`, U32.
    pub qweight: Tensor,
    /// Permuted scales `[E, num_groups, N]`, F16.
    pub scales: Tensor,
    /// Dequantized reference weights `[E, K, N]`, F32.
    pub w_ref: Tensor,
    pub scalar_type: MarlinScalarType,
    pub group_size: i32,
}

/// Quantize and pack a stack of dense expert weights `[E, K, N]`.
pub fn marlin_quantize_experts(
    w: &Tensor,
    scalar_type: MarlinScalarType,
    group_size: i32,
) -> Result<MarlinExperts> {
    let (num_experts, size_k, size_n) = w.dims3()?;
    if !check_marlin_supported(scalar_type, group_size, false, None) {
        unsupported_bail!(
            "Marlin does not support {} with group_size {}. Supported group sizes: {:?}",
            scalar_type,
            group_size,
            MARLIN_SUPPORTED_GROUP_SIZES
        );
    }
    check_marlin_supports_shape(size_n, size_k, group_size)?;

    let device = w.device();
    let data: Vec<f32> = w.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let per_expert = size_k * size_n;

    let mut packed_all = Vec::with_capacity(num_experts * packed_len(size_k, size_n, scalar_type));
    let mut scales_all = Vec::new();
    let mut ref_all = Vec::with_capacity(num_experts * per_expert);
    let mut num_groups = 1;

    for expert in data.chunks_exact(per_expert) {
        let quantized = quantize_weights(expert, size_k, size_n, scalar_type, group_size)?;
        packed_all.extend(marlin_pack_weights(
            &quantized.q_w,
            size_k,
            size_n,
            scalar_type,
        )?);
        scales_all.extend(quantized.scales);
        ref_all.extend(quantized.w_ref);
        num_groups = quantized.num_groups;
    }

    let qweight = Tensor::from_vec(
        packed_all,
        (
            num_experts,
            size_k / GPTQ_MARLIN_TILE,
            size_n * GPTQ_MARLIN_TILE / scalar_type.pack_factor(),
        ),
        device,
    )?;
    let scales = Tensor::from_vec(scales_all, (num_experts, num_groups, size_n), device)?;
    let scales = marlin_permute_scales(&scales, size_k, size_n, group_size)?.to_dtype(DType::F16)?;
    let w_ref = Tensor::from_vec(ref_all, (num_experts, size_k, size_n), device)?;

    Ok(MarlinExperts {
        qweight,
        scales,
        w_ref,
        scalar_type,
        group_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i as f32) * 0.37).sin()).collect()
    }

    #[test]
    fn test_check_marlin_supported() {
        assert!(check_marlin_supported(
            MarlinScalarType::Uint4b8,
            128,
            false,
            Some(80)
        ));
        assert!(check_marlin_supported(
            MarlinScalarType::Uint8b128,
            -1,
            false,
            None
        ));

        // Invalid group size
        assert!(!check_marlin_supported(
            MarlinScalarType::Uint4b8,
            100,
            false,
            Some(80)
        ));

        // Wrong device capability
        assert!(!check_marlin_supported(
            MarlinScalarType::Uint4b8,
            128,
            false,
            Some(75)
        ));

        // Biased types never carry zero points
        assert!(!check_marlin_supported(
            MarlinScalarType::Uint4b8,
            128,
            true,
            Some(80)
        ));
    }

    #[test]
    fn test_check_marlin_supports_shape() {
        assert!(check_marlin_supports_shape(4096, 4096, 128).is_ok());
        assert!(check_marlin_supports_shape(64, 64, -1).is_ok());

        // Invalid N dimension
        assert!(check_marlin_supports_shape(100, 4096, 128).is_err());
        // Invalid K dimension
        assert!(check_marlin_supports_shape(4096, 100, 128).is_err());
        // Group does not divide K
        assert!(check_marlin_supports_shape(128, 192, 128).is_err());
    }

    #[test]
    fn test_group_size_from_num_groups() {
        assert_eq!(group_size_from_num_groups(256, 1).unwrap(), -1);
        assert_eq!(group_size_from_num_groups(256, 2).unwrap(), 128);
        assert!(group_size_from_num_groups(256, 3).is_err());
        assert!(group_size_from_num_groups(256, 0).is_err());
    }

    #[test]
    fn test_weight_perm_is_bijection() {
        for bits in [4, 8] {
            let perm = marlin_weight_perm(bits);
            assert_eq!(perm.len(), MARLIN_PERM_LEN);
            let mut seen = vec![false; MARLIN_PERM_LEN];
            for &p in &perm {
                assert!(!seen[p], "index {p} repeated for {bits}-bit perm");
                seen[p] = true;
            }
        }
    }

    #[test]
    fn test_weight_perm_leading_entries() {
        // First fragment walks rows 0, 1, 8, 9 of column 0, then the +8 block.
        let perm = marlin_weight_perm(4);
        assert_eq!(&perm[..8], &[0, 128, 8, 136, 16, 144, 24, 152]);
    }

    #[test]
    fn test_scale_permutations() {
        let (scale_perm, scale_perm_single) = get_scale_perms();

        assert_eq!(scale_perm.len(), 64);
        assert_eq!(scale_perm_single.len(), 32);

        assert_eq!(scale_perm[0], 0);
        assert_eq!(scale_perm[1], 8);
        assert_eq!(scale_perm[8], 1);
    }

    #[test]
    fn test_permute_scales_roundtrip_grouped_and_single() {
        let device = Device::Cpu;
        let size_n = 128;
        for (size_k, group_size, num_groups) in [(256, 64, 4), (256, -1, 1)] {
            let data = ramp(2 * num_groups * size_n);
            let scales = Tensor::from_vec(data.clone(), (2, num_groups, size_n), &device).unwrap();
            let permuted = marlin_permute_scales(&scales, size_k, size_n, group_size).unwrap();
            assert_eq!(permuted.dims(), &[2, num_groups, size_n]);
            let permuted_vec: Vec<f32> = permuted.flatten_all().unwrap().to_vec1().unwrap();
            assert_ne!(permuted_vec, data);

            let restored = marlin_unpermute_scales(&permuted, size_k, size_n, group_size).unwrap();
            let restored: Vec<f32> = restored.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn test_pack_unpack_inverse() {
        for scalar_type in [MarlinScalarType::Uint4b8, MarlinScalarType::Uint8b128] {
            let (size_k, size_n) = (64, 128);
            let modulus = 1u32 << scalar_type.bits();
            let q_w: Vec<u32> = (0..size_k * size_n)
                .map(|i| ((i * 7 + i / 13) as u32) % modulus)
                .collect();

            let packed = marlin_pack_weights(&q_w, size_k, size_n, scalar_type).unwrap();
            assert_eq!(packed.len(), packed_len(size_k, size_n, scalar_type));

            let unpacked = marlin_unpack_weights(&packed, size_k, size_n, scalar_type).unwrap();
            assert_eq!(unpacked, q_w);
        }
    }

    #[test]
    fn test_pack_rejects_bad_shapes() {
        let q_w = vec![0u32; 16 * 32];
        assert!(marlin_pack_weights(&q_w, 16, 32, MarlinScalarType::Uint4b8).is_err());

        let q_w = vec![0u32; 10];
        assert!(marlin_pack_weights(&q_w, 16, 64, MarlinScalarType::Uint4b8).is_err());
    }

    #[test]
    fn test_quantize_weights_error_bounded_by_half_scale() {
        let (size_k, size_n) = (128, 64);
        let w = ramp(size_k * size_n);
        let q = quantize_weights(&w, size_k, size_n, MarlinScalarType::Uint4b8, 64).unwrap();
        assert_eq!(q.num_groups, 2);
        assert_eq!(q.scales.len(), 2 * size_n);

        for k in 0..size_k {
            for n in 0..size_n {
                let idx = k * size_n + n;
                let scale = q.scales[(k / 64) * size_n + n];
                assert!(q.q_w[idx] <= 15);
                assert!((w[idx] - q.w_ref[idx]).abs() <= scale * 0.5 + 1e-6);
                let signed = q.q_w[idx] as i32 - 8;
                assert_eq!(q.w_ref[idx], signed as f32 * scale);
            }
        }
    }

    #[test]
    fn test_quantize_weights_all_zero_column() {
        let w = vec![0f32; 64 * 64];
        let q = quantize_weights(&w, 64, 64, MarlinScalarType::Uint8b128, -1).unwrap();
        assert!(q.w_ref.iter().all(|&v| v == 0.0));
        assert!(q.q_w.iter().all(|&v| v == 128));
    }

    #[test]
    fn test_quantize_rejects_zero_point_types() {
        let w = vec![0f32; 64 * 64];
        let err = quantize_weights(&w, 64, 64, MarlinScalarType::Uint4, 64).unwrap_err();
        assert!(matches!(
            err,
            crate::error::MoeGemmError::UnsupportedConfiguration(_)
        ));
    }

    #[test]
    fn test_marlin_quantize_experts_shapes() {
        let device = Device::Cpu;
        let (e, k, n) = (3, 128, 64);
        let w = Tensor::from_vec(ramp(e * k * n), (e, k, n), &device).unwrap();

        let experts = marlin_quantize_experts(&w, MarlinScalarType::Uint4b8, 64).unwrap();
        assert_eq!(experts.qweight.dims(), &[e, k / 16, n * 16 / 8]);
        assert_eq!(experts.qweight.dtype(), DType::U32);
        assert_eq!(experts.scales.dims(), &[e, 2, n]);
        assert_eq!(experts.scales.dtype(), DType::F16);
        assert_eq!(experts.w_ref.dims(), &[e, k, n]);
    }

    #[test]
    fn test_marlin_quantize_experts_rejects_group_size() {
        let device = Device::Cpu;
        let w = Tensor::zeros((1, 128, 64), DType::F32, &device).unwrap();
        let err = marlin_quantize_experts(&w, MarlinScalarType::Uint4b8, 16).unwrap_err();
        assert!(matches!(
            err,
            crate::error::MoeGemmError::UnsupportedConfiguration(_)
        ));
    }
}
