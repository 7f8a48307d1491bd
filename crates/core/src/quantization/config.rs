//! Quantization settings for Marlin-packed MoE experts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::marlin::{check_marlin_supported, MARLIN_SUPPORTED_GROUP_SIZES};
use super::scalar_type::MarlinScalarType;
use crate::error::{unsupported_bail, Result};

/// Marlin configuration for INT4/INT8 MoE expert weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarlinMoeQuantConfig {
    /// Quantization bits (4 or 8)
    pub bits: u32,
    /// Group size for quantization (-1 for per-channel)
    pub group_size: i32,
    /// Whether to use descending activation order
    #[serde(default)]
    pub desc_act: bool,
    /// Whether quantization is symmetric
    #[serde(default = "default_true")]
    pub is_sym: bool,
}

fn default_true() -> bool {
    true
}

impl MarlinMoeQuantConfig {
    /// Create a new Marlin config for 4-bit GPTQ.
    pub fn gptq_int4(group_size: i32) -> Self {
        Self {
            bits: 4,
            group_size,
            desc_act: false,
            is_sym: true,
        }
    }

    /// Create a new Marlin config for 8-bit GPTQ.
    pub fn gptq_int8(group_size: i32) -> Self {
        Self {
            bits: 8,
            group_size,
            desc_act: false,
            is_sym: true,
        }
    }

    /// Create from a checkpoint's raw `quantization_config` entries.
    pub fn from_detected(raw_config: &HashMap<String, serde_json::Value>) -> Self {
        let bits = raw_config
            .get("bits")
            .or_else(|| raw_config.get("weight_bits"))
            .and_then(|v| v.as_u64())
            .map(|b| b as u32)
            .unwrap_or(4);

        let group_size = raw_config
            .get("group_size")
            .and_then(|v| v.as_i64())
            .map(|g| g as i32)
            .unwrap_or(128);

        let desc_act = raw_config
            .get("desc_act")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let is_sym = raw_config
            .get("sym")
            .or_else(|| raw_config.get("is_sym"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        Self {
            bits,
            group_size,
            desc_act,
            is_sym,
        }
    }

    /// Scalar type of the packed weights.
    pub fn scalar_type(&self) -> Option<MarlinScalarType> {
        match (self.bits, self.is_sym) {
            (4, true) => Some(MarlinScalarType::Uint4b8),
            (8, true) => Some(MarlinScalarType::Uint8b128),
            (4, false) => Some(MarlinScalarType::Uint4),
            (8, false) => Some(MarlinScalarType::Uint8),
            _ => None,
        }
    }

    /// Calculate number of groups for a given input size.
    pub fn num_groups(&self, in_features: usize) -> usize {
        if self.group_size <= 0 {
            1
        } else {
            in_features.div_ceil(self.group_size as usize)
        }
    }

    /// Reject settings the grouped MoE GEMM cannot execute.
    pub fn validate(&self, device_capability: Option<u32>) -> Result<MarlinScalarType> {
        let Some(scalar_type) = self.scalar_type() else {
            unsupported_bail!("{}-bit Marlin weights are not supported", self.bits);
        };
        if self.desc_act {
            unsupported_bail!("act-order (desc_act) is not supported for MoE experts");
        }
        if scalar_type.has_zero_point() {
            unsupported_bail!("asymmetric ({}) MoE experts are not supported", scalar_type);
        }
        if !check_marlin_supported(scalar_type, self.group_size, false, device_capability) {
            unsupported_bail!(
                "Marlin does not support {} with group_size {} on capability {:?}. Supported group sizes: {:?}",
                scalar_type,
                self.group_size,
                device_capability,
                MARLIN_SUPPORTED_GROUP_SIZES
            );
        }
        Ok(scalar_type)
    }
}

impl Default for MarlinMoeQuantConfig {
    fn default() -> Self {
        Self::gptq_int4(128)
    }
}
