pub mod model;
pub mod objective;
pub mod paths;
pub mod performance;
pub mod training;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use model::ModelConfig;
pub use objective::ObjectiveConfig;
pub use paths::PathConfig;
pub use performance::PerformanceConfig;
pub use training::TrainingConfig;

/// Main configuration for dual-objective fine-tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub objective: ObjectiveConfig,
    pub paths: PathConfig,
    pub performance: PerformanceConfig,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            objective: ObjectiveConfig::default(),
            paths: PathConfig::default(),
            performance: PerformanceConfig::default(),
            seed: 42,
        }
    }
}

impl Config {
    pub fn for_model(model_preset: &str) -> anyhow::Result<Self> {
        let model_config = ModelConfig::from_preset(model_preset)?;
        Ok(Self {
            model: model_config,
            ..Default::default()
        })
    }

    /// Validate cross-field constraints once after CLI overrides land.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::loss::validate_alpha(self.objective.alpha)?;
        if self.model.lora_rank == 0 {
            anyhow::bail!("lora_rank must be > 0");
        }
        if self.training.batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        if self.training.gradient_accumulation_steps == 0 {
            anyhow::bail!("gradient_accumulation_steps must be > 0");
        }
        // Both drive `step % interval` checks in the trainer
        if self.training.logging_steps == 0 {
            anyhow::bail!("logging_steps must be > 0");
        }
        if self.performance.checkpoint_interval == 0 {
            anyhow::bail!("checkpoint_interval must be > 0");
        }
        Ok(())
    }

    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        serde_json::from_str(&serde_json::to_string(self).unwrap()).unwrap()
    }

    pub fn from_dict(data: HashMap<String, serde_json::Value>) -> anyhow::Result<Self> {
        let json = serde_json::to_string(&data)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_round_trip() {
        let mut config = Config::default();
        config.objective.alpha = 0.7;
        config.training.batch_size = 4;
        config.paths.output_dir = "run-3".to_string();

        let restored = Config::from_dict(config.to_dict()).unwrap();
        assert!((restored.objective.alpha - 0.7).abs() < 1e-6);
        assert_eq!(restored.training.batch_size, 4);
        assert_eq!(restored.paths.output_dir, "run-3");
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut config = Config::default();
        config.objective.alpha = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.model.lora_rank = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.gradient_accumulation_steps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.logging_steps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.performance.checkpoint_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_model_preset() {
        let config = Config::for_model("codellama-7b").unwrap();
        assert_eq!(config.model.model_id, "codellama/CodeLlama-7b-hf");
        assert!(Config::for_model("not-a-preset").is_err());
    }
}
