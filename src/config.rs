//! Configuration types.
//!
//! Everything can be set from a `copa.toml`; missing fields fall back to the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the configuration file looked up by [`Config::load`].
pub const CONFIG_FILE_NAME: &str = "copa.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("cold_threshold must be in (0, 1], got {0}")]
    InvalidColdThreshold(f64),
}

/// Settings for the stencil lowering pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoweringConfig {
    /// Blocks below this fraction of the entry frequency are cold
    pub cold_threshold: f64,
    /// Symbol standing for "dispatch to the next bytecode"
    pub fallthrough_placeholder: Option<String>,
    pub function_end_label_prefix: String,
    pub slow_path_section: String,
    pub fast_path_section: String,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            cold_threshold: 0.02,
            fallthrough_placeholder: None,
            function_end_label_prefix: ".Lfunc_end".to_string(),
            slow_path_section: ".text.copa_slow".to_string(),
            fast_path_section: ".text".to_string(),
        }
    }
}

/// Settings for the baseline JIT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Cross-check emitter cursors against the size pass in release builds too
    pub verify_codegen: bool,
    pub trace: bool,
    /// Granularity of executable memory requests to the OS
    pub chunk_size: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            verify_codegen: cfg!(debug_assertions),
            trace: false,
            chunk_size: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lowering: LoweringConfig,
    pub jit: JitConfig,
}

impl Config {
    /// Load `copa.toml` from a directory.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        Self::from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Load a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.lowering.cold_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::InvalidColdThreshold(t));
        }
        Ok(())
    }
}
