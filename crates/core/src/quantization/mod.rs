//! Quantized weight formats consumed by the grouped MoE GEMM.
//!
//! - [`scalar_type`]: integer storage types (`uint4b8`, `uint8b128`, ...)
//! - [`marlin`]: Marlin tile layout, packing, scale permutation and
//!   symmetric group quantization
//! - [`config`]: checkpoint-level quantization settings
//!
//! # Example
//!
//! ```ignore
//! use marlin_moe_core::quantization::{marlin_quantize_experts, MarlinScalarType};
//!
//! // w: [num_experts, size_k, size_n]
//! let experts = marlin_quantize_experts(&w, MarlinScalarType::Uint4b8, 128)?;
//! ```

mod config;
pub mod marlin;
mod scalar_type;

pub use config::MarlinMoeQuantConfig;
pub use marlin::{
    check_marlin_supported, check_marlin_supports_shape, group_size_from_num_groups,
    marlin_pack_weights, marlin_permute_scales, marlin_quantize_experts, marlin_unpack_weights,
    marlin_unpermute_scales, quantize_weights, MarlinExperts, QuantizedWeights, GPTQ_MARLIN_TILE,
    MARLIN_MOE_MIN_THREAD_K, MARLIN_MOE_MIN_THREAD_N, MARLIN_SUPPORTED_GROUP_SIZES,
};
pub use scalar_type::MarlinScalarType;
