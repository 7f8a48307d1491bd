//! Configuration persistence for the Marlin MoE runner.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/marlin-moe/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Workload: "gemm" (one grouped GEMM) or "fused" (two-projection MoE).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Number of tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_tokens: Option<usize>,

    /// Output features of the GEMM (hidden size in fused mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_n: Option<usize>,

    /// Input features of the GEMM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_k: Option<usize>,

    /// Expert FFN width in fused mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate_size: Option<usize>,

    /// Number of experts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_experts: Option<usize>,

    /// Experts per token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topk: Option<usize>,

    /// Weight bits (4 or 8).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<u32>,

    /// Quantization group size (-1 for per-channel).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_size: Option<i32>,

    /// Token block size; chosen from the batch when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moe_block_size: Option<usize>,

    /// Timed iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<usize>,

    /// Untimed warmup iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup: Option<usize>,

    /// Random seed for the synthetic workload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Maximum tolerated relative error against the dense reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f32>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl BenchConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("marlin-moe").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &BenchConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            };
        }
        take!(
            mode,
            num_tokens,
            size_n,
            size_k,
            intermediate_size,
            num_experts,
            topk,
            bits,
            group_size,
            moe_block_size,
            iterations,
            warmup,
            seed,
            tolerance,
            log_level,
        );
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("No config directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = BenchConfig {
            mode: Some("fused".to_string()),
            num_tokens: Some(64),
            group_size: Some(-1),
            tolerance: Some(1e-3),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = BenchConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("marlin").join("config.toml");
        BenchConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
        assert_eq!(BenchConfig::load_from(&path).unwrap(), BenchConfig::default());
    }

    #[test]
    fn test_merge() {
        let mut base = BenchConfig {
            num_experts: Some(8),
            topk: Some(2),
            ..Default::default()
        };

        let override_config = BenchConfig {
            topk: Some(4),
            bits: Some(8),
            ..Default::default()
        };

        base.merge(&override_config);

        assert_eq!(base.num_experts, Some(8)); // Unchanged
        assert_eq!(base.topk, Some(4)); // Overridden
        assert_eq!(base.bits, Some(8)); // Added
    }

    #[test]
    fn test_load_from_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "num_tokens = \"many\"").unwrap();
        assert!(matches!(
            BenchConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            BenchConfig::load_from(&dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
