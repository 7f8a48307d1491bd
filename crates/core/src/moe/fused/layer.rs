//! MoE layer with Marlin-packed experts.

use std::sync::Mutex;

use candle_core::Tensor;

use super::config::FusedMarlinMoEConfig;
use super::fused_marlin_moe::fused_marlin_moe_with_block;
use super::workspace::MarlinMoeWorkspace;
use crate::error::{shape_bail, unsupported_bail, MoeGemmError, Result};
use crate::quantization::{marlin_quantize_experts, MarlinExperts, GPTQ_MARLIN_TILE};

/// Quantized SwiGLU MoE layer backed by the grouped Marlin GEMM.
///
/// The layer owns one workspace sized for both projections. Concurrent
/// `forward` calls serialize on it.
pub struct MarlinMoELayer {
    config: FusedMarlinMoEConfig,
    /// Gate+up weights, `N = 2 * intermediate_size`, `K = hidden_size`.
    w13: MarlinExperts,
    /// Down weights, `N = hidden_size`, `K = intermediate_size`.
    w2: MarlinExperts,
    workspace: Mutex<MarlinMoeWorkspace>,
}

impl MarlinMoELayer {
    /// Create from already packed expert weights.
    pub fn new(
        config: FusedMarlinMoEConfig,
        w13: MarlinExperts,
        w2: MarlinExperts,
    ) -> Result<Self> {
        let scalar_type = config.quant.validate(None)?;
        for (name, experts, k, n) in [
            ("w13", &w13, config.hidden_size, config.w13_n_dim()),
            ("w2", &w2, config.intermediate_size, config.hidden_size),
        ] {
            if experts.scalar_type != scalar_type {
                unsupported_bail!(
                    "{} is packed as {}, config expects {}",
                    name,
                    experts.scalar_type,
                    scalar_type
                );
            }
            let expected = [
                config.num_experts,
                k / GPTQ_MARLIN_TILE,
                n * GPTQ_MARLIN_TILE / scalar_type.pack_factor(),
            ];
            if experts.qweight.dims() != expected {
                shape_bail!(
                    "{} qweight has shape {:?}, expected {:?}",
                    name,
                    experts.qweight.dims(),
                    expected
                );
            }
        }

        let workspace = MarlinMoeWorkspace::for_shapes(&[
            (config.w13_n_dim(), config.hidden_size),
            (config.hidden_size, config.intermediate_size),
        ]);
        tracing::debug!(
            num_experts = config.num_experts,
            top_k = config.top_k,
            hidden_size = config.hidden_size,
            intermediate_size = config.intermediate_size,
            scalar_type = %scalar_type,
            workspace_len = workspace.len(),
            "created Marlin MoE layer"
        );

        Ok(Self {
            config,
            w13,
            w2,
            workspace: Mutex::new(workspace),
        })
    }

    /// Quantize dense expert weights and build the layer.
    ///
    /// * `w13` - `[num_experts, hidden_size, 2 * intermediate_size]`, gate columns first
    /// * `w2` - `[num_experts, intermediate_size, hidden_size]`
    pub fn from_dense(config: FusedMarlinMoEConfig, w13: &Tensor, w2: &Tensor) -> Result<Self> {
        let scalar_type = config.quant.validate(None)?;
        let group_size = config.quant.group_size;
        let w13 = marlin_quantize_experts(w13, scalar_type, group_size)?;
        let w2 = marlin_quantize_experts(w2, scalar_type, group_size)?;
        Self::new(config, w13, w2)
    }

    pub fn config(&self) -> &FusedMarlinMoEConfig {
        &self.config
    }

    pub fn w13(&self) -> &MarlinExperts {
        &self.w13
    }

    pub fn w2(&self) -> &MarlinExperts {
        &self.w2
    }

    /// Forward pass.
    ///
    /// `hidden_states` is `[..., hidden_size]`; `router_logits` is
    /// `[num_tokens, num_experts]` with `num_tokens` the product of the leading
    /// dimensions. The output has the shape of `hidden_states`.
    pub fn forward(&self, hidden_states: &Tensor, router_logits: &Tensor) -> Result<Tensor> {
        let orig_shape = hidden_states.dims().to_vec();
        let Some((&hidden_size, leading)) = orig_shape.split_last() else {
            shape_bail!("hidden states must have at least 1 dimension");
        };
        if hidden_size != self.config.hidden_size {
            shape_bail!(
                "hidden states have {} features, layer expects {}",
                hidden_size,
                self.config.hidden_size
            );
        }
        let num_tokens: usize = leading.iter().product();
        let flat = hidden_states.reshape((num_tokens, hidden_size))?;

        let mut workspace = self.workspace.lock().map_err(|_| {
            MoeGemmError::DeviceExecutionFailure(candle_core::Error::Msg(
                "Marlin MoE workspace lock poisoned".to_string(),
            ))
        })?;

        let out = fused_marlin_moe_with_block(
            &flat,
            &self.w13.qweight,
            &self.w2.qweight,
            router_logits,
            &self.w13.scales,
            &self.w2.scales,
            self.config.top_k,
            self.config.renormalize,
            self.config.block_config,
            &mut workspace,
        )?;
        Ok(out.reshape(orig_shape)?)
    }
}
