//! Caller-owned scratch memory for the grouped Marlin MoE GEMM.
//!
//! The engine never allocates its tiling buffers itself: the caller creates a
//! workspace once (sized for the largest problem it will run) and lends it
//! mutably to every call. The `&mut` borrow keeps one writer per call.

use crate::error::{shape_bail, Result};

use super::config::SUPPORTED_MOE_BLOCK_SIZES;

/// Scratch buffer reused across grouped GEMM calls.
#[derive(Debug, Clone, Default)]
pub struct MarlinMoeWorkspace {
    buffer: Vec<f32>,
}

/// Disjoint views into a workspace for one call.
pub(crate) struct ScratchViews<'a> {
    /// Dequantized weights of the current expert, `[size_k, size_n]`.
    pub dequant: &'a mut [f32],
    /// Gathered activation rows of the current block, `[moe_block_size, size_k]`.
    pub a_block: &'a mut [f32],
    /// Product rows of the current block, `[moe_block_size, size_n]`.
    pub c_block: &'a mut [f32],
}

impl MarlinMoeWorkspace {
    /// Number of f32 elements one call with these dimensions needs.
    pub fn required_len(size_n: usize, size_k: usize, moe_block_size: usize) -> usize {
        size_k * size_n + moe_block_size * (size_k + size_n)
    }

    /// Workspace sized for one problem shape.
    pub fn new(size_n: usize, size_k: usize, moe_block_size: usize) -> Self {
        Self::with_len(Self::required_len(size_n, size_k, moe_block_size))
    }

    /// Workspace that fits every `(size_n, size_k)` pair at any supported block size.
    pub fn for_shapes(shapes: &[(usize, usize)]) -> Self {
        let max_block = SUPPORTED_MOE_BLOCK_SIZES.iter().copied().max().unwrap_or(64);
        let len = shapes
            .iter()
            .map(|&(n, k)| Self::required_len(n, k, max_block))
            .max()
            .unwrap_or(0);
        Self::with_len(len)
    }

    /// Workspace with an explicit element count.
    pub fn with_len(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len],
        }
    }

    /// Capacity in f32 elements.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a call with these dimensions fits.
    pub fn fits(&self, size_n: usize, size_k: usize, moe_block_size: usize) -> bool {
        self.len() >= Self::required_len(size_n, size_k, moe_block_size)
    }

    pub(crate) fn views(
        &mut self,
        size_n: usize,
        size_k: usize,
        moe_block_size: usize,
    ) -> Result<ScratchViews<'_>> {
        let required = Self::required_len(size_n, size_k, moe_block_size);
        if self.len() < required {
            shape_bail!(
                "workspace holds {} elements, size_n={} size_k={} moe_block_size={} need {}",
                self.len(),
                size_n,
                size_k,
                moe_block_size,
                required
            );
        }
        let (dequant, rest) = self.buffer.split_at_mut(size_k * size_n);
        let (a_block, rest) = rest.split_at_mut(moe_block_size * size_k);
        let (c_block, _) = rest.split_at_mut(moe_block_size * size_n);
        Ok(ScratchViews {
            dequant,
            a_block,
            c_block,
        })
    }
}
