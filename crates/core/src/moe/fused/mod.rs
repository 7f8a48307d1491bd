//! Grouped Marlin MoE execution.
//!
//! Implements the permute-compute-unpermute pattern over quantized experts:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       MarlinMoELayer                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌────────────────┐   ┌───────────────────┐  │
//! │  │ topk_softmax│──▶│  Align + Pad   │──▶│ Grouped Marlin    │  │
//! │  │             │   │  (by expert)   │   │ GEMM (w13, w2)    │  │
//! │  └─────────────┘   └────────────────┘   └─────────┬─────────┘  │
//! │                                                    │            │
//! │  ┌─────────────────────────────────────────────────▼──────────┐ │
//! │  │           Routing weights + sum over top-k slots           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`config`]: block sizes and layer configuration
//! - [`token_grouper`]: token alignment by expert
//! - [`kernel_wrapper`]: the grouped GEMM entry points and argument checks
//! - [`grouped_gemm`]: host execution over expert segments
//! - [`workspace`]: caller-owned scratch memory
//! - [`fused_marlin_moe`]: routed one- and two-projection forward passes
//! - [`layer`]: layer owning packed experts and a workspace

mod config;
mod fused_marlin_moe;
mod grouped_gemm;
mod kernel_wrapper;
mod layer;
mod token_grouper;
mod workspace;

pub use config::{
    validate_moe_block_size, FusedMarlinMoEConfig, MarlinMoeBlockConfig,
    SUPPORTED_MOE_BLOCK_SIZES,
};
pub use fused_marlin_moe::{fused_marlin_moe, silu_and_mul, single_marlin_moe};
pub use kernel_wrapper::{marlin_gemm_moe, marlin_gemm_moe_slots};
pub use layer::MarlinMoELayer;
pub use token_grouper::{AlignedTokens, MoETokenGrouper};
pub use workspace::MarlinMoeWorkspace;
