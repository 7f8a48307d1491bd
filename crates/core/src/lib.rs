//! Grouped Marlin-quantized GEMM for Mixture-of-Experts layers.
//!
//! The core entry point is [`marlin_gemm_moe`]: every (token, expert) slot of
//! an expert-sorted routing table is multiplied by its expert's packed weight
//! matrix and the slots of each token are combined into one output row.
//!
//! - [`quantization`]: Marlin weight layout, packing and symmetric quantization
//! - [`moe`]: routing, token alignment, the grouped GEMM and the fused layer
//! - [`error`]: error kinds shared by every operation

pub mod error;
pub mod moe;
pub mod quantization;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{MoeGemmError, Result};
pub use moe::{
    fused_marlin_moe, marlin_gemm_moe, marlin_gemm_moe_slots, single_marlin_moe,
    MarlinMoELayer, MarlinMoeWorkspace,
};
