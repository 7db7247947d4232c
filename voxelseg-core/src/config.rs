//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Session engine configuration.
///
/// Immutable once the engine is constructed; every field has a documented
/// default so the server runs with zero configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quantization cell size used to build the voxel map (scene units).
    pub voxel_size: f64,
    /// Default half-width of the selection cube around a click.
    pub default_cube_size: f64,
    /// Directory where per-round artifacts are written.
    pub output_dir: PathBuf,
    /// Upper bound on concurrent recognition tasks (further capped by
    /// available cores and task count).
    pub max_recognition_workers: usize,
    /// Seconds a packaged download survives after streaming is scheduled.
    pub artifact_grace_secs: u64,
    /// Chunk size for streamed downloads, in bytes.
    pub stream_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.05,
            default_cube_size: 0.02,
            output_dir: PathBuf::from("./outputs"),
            max_recognition_workers: 8,
            artifact_grace_secs: 300,
            stream_chunk_size: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.voxel_size > 0.0) {
            return Err(Error::Config("voxel_size must be positive".into()));
        }
        if !(self.default_cube_size > 0.0) {
            return Err(Error::Config("default_cube_size must be positive".into()));
        }
        if self.max_recognition_workers == 0 {
            return Err(Error::Config(
                "max_recognition_workers must be at least 1".into(),
            ));
        }
        if self.stream_chunk_size == 0 {
            return Err(Error::Config("stream_chunk_size must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_voxel_size() {
        let mut config = EngineConfig::default();
        config.voxel_size = 0.0;
        assert!(config.validate().is_err());
        config.voxel_size = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = EngineConfig::default();
        config.max_recognition_workers = 0;
        assert!(config.validate().is_err());
    }
}
