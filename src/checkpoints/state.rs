//! Checkpoint state container

use std::collections::HashMap;

use mlx_rs::Array;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Training state snapshot: adapter weights plus AdamW moments and run
/// metadata. Base model weights are never checkpointed.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub adapters: HashMap<String, Array>,
    pub exp_avg: HashMap<String, Array>,
    pub exp_avg_sq: HashMap<String, Array>,
    pub meta: CheckpointMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub epoch: usize,
    pub loss_history: Vec<f32>,
    pub config: Config,
    pub timestamp: String,
}

impl Checkpoint {
    pub fn new(
        step: usize,
        epoch: usize,
        adapters: HashMap<String, Array>,
        exp_avg: HashMap<String, Array>,
        exp_avg_sq: HashMap<String, Array>,
        loss_history: Vec<f32>,
        config: Config,
    ) -> Self {
        Self {
            adapters,
            exp_avg,
            exp_avg_sq,
            meta: CheckpointMeta {
                step,
                epoch,
                loss_history,
                config,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        }
    }

    pub fn step(&self) -> usize {
        self.meta.step
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.adapters.is_empty() {
            anyhow::bail!("Checkpoint has no adapter tensors");
        }
        for name in self.exp_avg.keys() {
            if !self.adapters.contains_key(name) {
                anyhow::bail!("Optimizer moment {} has no matching adapter tensor", name);
            }
        }
        self.meta.config.validate()?;
        Ok(())
    }
}
