//! Integer scalar types used by Marlin packed weights.
//!
//! Naming follows `[u]int<bits>[b<bias>]`: a stored value `q` of a biased
//! type represents the signed integer `q - bias`.

use serde::{Deserialize, Serialize};

/// Scalar types understood by the Marlin weight format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarlinScalarType {
    /// 4-bit unsigned with 8-offset symmetric bias (GPTQ style)
    Uint4b8,
    /// 8-bit unsigned with 128-offset symmetric bias
    Uint8b128,
    /// 4-bit unsigned with runtime zero point (AWQ style)
    Uint4,
    /// 8-bit unsigned with runtime zero point
    Uint8,
}

impl MarlinScalarType {
    /// Symmetric (biased) type for a bit width.
    pub fn symmetric(bits: u32) -> Option<Self> {
        match bits {
            4 => Some(Self::Uint4b8),
            8 => Some(Self::Uint8b128),
            _ => None,
        }
    }

    /// Get the number of bits for this type
    pub fn bits(&self) -> u32 {
        match self {
            Self::Uint4b8 | Self::Uint4 => 4,
            Self::Uint8b128 | Self::Uint8 => 8,
        }
    }

    /// Check if this type has a zero point
    pub fn has_zero_point(&self) -> bool {
        matches!(self, Self::Uint4 | Self::Uint8)
    }

    /// Get pack factor (elements per u32)
    pub fn pack_factor(&self) -> usize {
        32 / self.bits() as usize
    }

    /// Bias subtracted from stored values; zero for zero-point types.
    pub fn bias(&self) -> i32 {
        match self {
            Self::Uint4b8 => 8,
            Self::Uint8b128 => 128,
            Self::Uint4 | Self::Uint8 => 0,
        }
    }

    /// Largest representable value after removing the bias.
    pub fn max(&self) -> i32 {
        (1i32 << self.bits()) - 1 - self.bias()
    }

    /// Smallest representable value after removing the bias.
    pub fn min(&self) -> i32 {
        -self.bias()
    }

    /// Mask selecting one packed element.
    pub fn mask(&self) -> u32 {
        (1u32 << self.bits()) - 1
    }
}

impl std::fmt::Display for MarlinScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uint4b8 => write!(f, "uint4b8"),
            Self::Uint8b128 => write!(f, "uint8b128"),
            Self::Uint4 => write!(f, "uint4"),
            Self::Uint8 => write!(f, "uint8"),
        }
    }
}
