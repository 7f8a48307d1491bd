//! Mixture of Experts (MoE) execution over Marlin-quantized experts.
//!
//! ## Submodules
//!
//! - [`fused`]: grouped quantized GEMM, token alignment and the fused layer
//! - [`topk_softmax`]: top-k softmax routing

pub mod fused;
pub mod topk_softmax;

pub use fused::{
    fused_marlin_moe, marlin_gemm_moe, marlin_gemm_moe_slots, single_marlin_moe, AlignedTokens,
    FusedMarlinMoEConfig, MarlinMoELayer, MarlinMoeBlockConfig, MarlinMoeWorkspace,
    MoETokenGrouper,
};
pub use topk_softmax::{topk_softmax, TopKSoftmaxConfig};
