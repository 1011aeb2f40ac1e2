use serde::{Deserialize, Serialize};

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub num_train_epochs: usize,
    /// Hard cap on optimizer steps; 0 means run the configured epochs out.
    pub max_steps: usize,
    pub logging_steps: usize,
    pub learning_rate: f32,
    pub lr_scheduler_type: String,
    pub warmup_steps: usize,
    pub weight_decay: f32,
    pub adam_beta1: f32,
    pub adam_beta2: f32,
    pub adam_epsilon: f32,
    pub max_seq_length: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            gradient_accumulation_steps: 2,
            num_train_epochs: 1,
            max_steps: 0,
            logging_steps: 10,
            learning_rate: 1e-4,
            lr_scheduler_type: "linear".to_string(),
            warmup_steps: 0,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_seq_length: 512,
        }
    }
}
