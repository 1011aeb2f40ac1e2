use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::LoraConfig;

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// HuggingFace model id or local checkpoint directory.
    pub model_id: String,
    pub load_in_8bit: bool,
    pub lora_rank: usize,
    pub lora_alpha: usize,
    pub lora_dropout: f32,
    pub lora_target_modules: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "codellama/CodeLlama-7b-hf".to_string(),
            load_in_8bit: false,
            lora_rank: 8,
            lora_alpha: 32,
            lora_dropout: 0.05,
            lora_target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
        }
    }
}

impl ModelConfig {
    pub fn lora(&self) -> LoraConfig {
        LoraConfig {
            rank: self.lora_rank,
            lora_alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.lora_target_modules.clone(),
        }
    }

    pub fn from_preset(preset: &str) -> anyhow::Result<Self> {
        let entry = AVAILABLE_MODELS.get(preset).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown preset: {}. Available: {:?}",
                preset,
                AVAILABLE_MODELS.keys().collect::<Vec<_>>()
            )
        })?;

        Ok(Self {
            model_id: entry
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            ..Default::default()
        })
    }
}

/// Known base models by size tier
pub static AVAILABLE_MODELS: Lazy<HashMap<String, serde_json::Map<String, serde_json::Value>>> =
    Lazy::new(|| {
        use serde_json::json;
        let mut models = HashMap::new();

        models.insert(
            "codellama-7b".to_string(),
            json!({
                "name": "codellama/CodeLlama-7b-hf",
                "description": "Code Llama 7B base - default for code fine-tuning",
                "params": "7B",
                "tier": "entry",
                "recommended": true,
            })
            .as_object()
            .unwrap()
            .clone(),
        );

        models.insert(
            "codellama-13b".to_string(),
            json!({
                "name": "codellama/CodeLlama-13b-hf",
                "description": "Code Llama 13B base",
                "params": "13B",
                "tier": "medium",
                "recommended": false,
            })
            .as_object()
            .unwrap()
            .clone(),
        );

        models.insert(
            "llama2-7b".to_string(),
            json!({
                "name": "meta-llama/Llama-2-7b-hf",
                "description": "Llama 2 7B base for general text",
                "params": "7B",
                "tier": "entry",
                "recommended": false,
            })
            .as_object()
            .unwrap()
            .clone(),
        );

        models.insert(
            "tinyllama-1.1b".to_string(),
            json!({
                "name": "TinyLlama/TinyLlama-1.1B-intermediate-step-1431k-3T",
                "description": "TinyLlama 1.1B - smoke tests and laptops",
                "params": "1.1B",
                "tier": "entry",
                "recommended": false,
            })
            .as_object()
            .unwrap()
            .clone(),
        );

        models
    });
