use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::OcmeError;

/// Tuning knobs of an OCME store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcmeConfig {
    /// Multiplier applied to feature lengths before taking the level.
    pub side_factor: f32,
    /// Target payload size of one chunk.
    pub block_size_bytes: usize,
    /// Memory allowed for resident chunks.
    pub cache_budget_bytes: usize,
    /// Hierarchy nodes below this occupancy become roots.
    pub impostor_min_occupancy: f32,
    /// Largest working set an edit may pin.
    pub edit_memory_ceiling: usize,
}

impl Default for OcmeConfig {
    fn default() -> Self {
        Self {
            side_factor: 50.0,
            block_size_bytes: 64 * 1024,
            cache_budget_bytes: 256 * 1024 * 1024,
            impostor_min_occupancy: 0.001,
            edit_memory_ceiling: 512 * 1024 * 1024,
        }
    }
}

impl OcmeConfig {
    /// Load from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OcmeError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<(), OcmeError> {
        serde_json::to_writer_pretty(std::fs::File::create(path)?, self)?;
        Ok(())
    }

    pub(crate) fn env_params(&self) -> ocme_stream::EnvParams {
        ocme_stream::EnvParams {
            block_size_bytes: self.block_size_bytes,
            cache_budget_bytes: self.cache_budget_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: OcmeConfig = serde_json::from_str(r#"{ "side_factor": 1.0 }"#).unwrap();
        assert_eq!(cfg.side_factor, 1.0);
        assert_eq!(cfg.block_size_bytes, OcmeConfig::default().block_size_bytes);
    }

    #[test]
    fn json_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ocme.json");
        let cfg = OcmeConfig {
            cache_budget_bytes: 4096,
            ..OcmeConfig::default()
        };
        cfg.to_json_file(&path).unwrap();
        assert_eq!(OcmeConfig::from_json_file(&path).unwrap(), cfg);
    }
}
