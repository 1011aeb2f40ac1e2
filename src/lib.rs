//! Dual-objective LoRA fine-tuning for causal language models
//!
//! Fine-tunes a pretrained Llama-family model on paired supervision: each
//! training example carries a `target` and a `rationale`, and the step loss
//! is `alpha * target_loss + (1 - alpha) * rationale_loss`. Only LoRA
//! adapter matrices receive gradients; base weights stay frozen, optionally
//! loaded through 8-bit quantization. Built on MLX for Apple Silicon.
//!
//! ## Main Components
//!
//! - `loss`: masked causal loss and the dual-objective blend
//! - `model`: Llama architecture, LoRA adapters, weight loading, tokenizer
//! - `data`: streaming JSONL dataset and the dual-view collator
//! - `training`: training loop, LR schedules, step profiler
//! - `checkpoints`: checkpoint save/load with keep-last-N cleanup
//! - `config`: configuration management

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod loss;
pub mod model;
pub mod training;
pub mod utils;

pub use config::Config;
pub use loss::{dual_objective_loss, masked_causal_loss, IGNORE_INDEX};

/// Library errors
pub use anyhow::{Error, Result};
