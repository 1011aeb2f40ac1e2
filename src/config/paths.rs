use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Directory of .jsonl dataset shards.
    pub dataset_dir: String,
    pub output_dir: String,
    /// JSONL training metrics export; None disables it.
    pub metrics_file: Option<String>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            dataset_dir: "data".to_string(),
            output_dir: "tmp".to_string(),
            metrics_file: None,
        }
    }
}

impl PathConfig {
    pub fn adapters_file(&self) -> PathBuf {
        PathBuf::from(&self.output_dir).join("adapters.safetensors")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir).join("checkpoints")
    }

    pub fn logs_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir).join("logs")
    }

    pub fn trace_file(&self) -> PathBuf {
        self.logs_dir().join("trace.jsonl")
    }
}
