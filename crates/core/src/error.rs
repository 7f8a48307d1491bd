use thiserror::Error;

/// Errors surfaced by the grouped Marlin MoE GEMM.
///
/// Every failure is reported synchronously to the caller; nothing is retried.
#[derive(Error, Debug)]
pub enum MoeGemmError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("device execution failure: {0}")]
    DeviceExecutionFailure(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MoeGemmError>;

/// Return early with [`MoeGemmError::ShapeMismatch`].
macro_rules! shape_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::MoeGemmError::ShapeMismatch(format!($($arg)*)))
    };
}

/// Return early with [`MoeGemmError::UnsupportedConfiguration`].
macro_rules! unsupported_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::MoeGemmError::UnsupportedConfiguration(format!($($arg)*)))
    };
}

pub(crate) use shape_bail;
pub(crate) use unsupported_bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_shape_mismatch() {
        let e = MoeGemmError::ShapeMismatch("sorted_ids has 12 entries, expected 16".into());
        assert_eq!(
            e.to_string(),
            "shape mismatch: sorted_ids has 12 entries, expected 16"
        );
    }

    #[test]
    fn error_display_unsupported() {
        let e = MoeGemmError::UnsupportedConfiguration("moe_block_size 24".into());
        assert_eq!(e.to_string(), "unsupported configuration: moe_block_size 24");
    }

    #[test]
    fn candle_errors_become_device_failures() {
        let candle_err = candle_core::Error::Msg("kernel launch failed".into());
        let e: MoeGemmError = candle_err.into();
        assert!(matches!(e, MoeGemmError::DeviceExecutionFailure(_)));
        assert!(e.to_string().starts_with("device execution failure"));
    }

    fn bails_on_shape() -> Result<()> {
        shape_bail!("size_k {} is not a multiple of {}", 100, 16);
    }

    #[test]
    fn shape_bail_formats_message() {
        let err = bails_on_shape().unwrap_err();
        assert_eq!(
            err.to_string(),
            "shape mismatch: size_k 100 is not a multiple of 16"
        );
    }
}
