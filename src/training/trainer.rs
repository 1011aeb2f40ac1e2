//! Dual-objective LoRA training loop.
//!
//! Every optimizer step draws `gradient_accumulation_steps` micro batches,
//! runs two forward passes per micro batch (target view and rationale view),
//! blends the masked losses with the configured alpha, and applies the
//! summed adapter gradients with AdamW. Base weights never receive updates
//! because only the adapter tensors are exposed as trainable parameters.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use mlx_rs::error::Exception;
use mlx_rs::module::{FlattenedModuleParam, ModuleParameters};
use mlx_rs::nn;
use mlx_rs::optimizers::{AdamW, Optimizer};
use mlx_rs::Array;
use tracing::{info, warn};

use crate::checkpoints::{Checkpoint, CheckpointManager};
use crate::config::Config;
use crate::data::{prepare, DualBatch, DualObjectiveCollator, StreamingDataset};
use crate::loss;
use crate::model::{LlamaForCausalLM, ModelLoader};
use crate::training::profiler::StepProfiler;
use crate::training::scheduler::build_scheduler;
use crate::utils::memory::MemoryMonitor;

/// Window of recent losses used for the running average shown in logs.
const LOSS_WINDOW: usize = 100;

pub struct DualObjectiveTrainer {
    config: Config,
    model: LlamaForCausalLM,
    collator: DualObjectiveCollator,
    optimizer: AdamW,
    checkpoint_manager: Option<CheckpointManager>,
    profiler: Option<StepProfiler>,
    metrics_file: Option<PathBuf>,
    memory_monitor: MemoryMonitor,
    global_step: usize,
    start_epoch: usize,
    loss_history: Vec<f32>,
    best_loss: f32,
    best_loss_step: usize,
    training_start_time: Option<Instant>,
}

/// Format duration in seconds to human-readable string
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Format parameter count with K/M/B suffixes
fn format_param_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.1}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Running accumulator for gradient accumulation. Gradients arrive already
/// scaled by 1/accum so the sum matches a single large-batch step.
fn accumulate_gradients(
    acc: &mut Option<FlattenedModuleParam>,
    grads: FlattenedModuleParam,
    accum_steps: usize,
) -> Result<()> {
    let scale = Array::from_f32(1.0 / accum_steps as f32);

    match acc {
        None => {
            let mut scaled = FlattenedModuleParam::new();
            for (key, grad) in grads {
                scaled.insert(key, grad.multiply(&scale)?);
            }
            *acc = Some(scaled);
        }
        Some(existing) => {
            for (key, grad) in grads {
                let scaled = grad.multiply(&scale)?;
                match existing.get_mut(&key) {
                    Some(slot) => *slot = slot.add(&scaled)?,
                    None => {
                        existing.insert(key, scaled);
                    }
                }
            }
        }
    }

    Ok(())
}

impl DualObjectiveTrainer {
    pub fn new(
        model: LlamaForCausalLM,
        collator: DualObjectiveCollator,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;

        let training = &config.training;
        let mut optimizer = AdamW::new(training.learning_rate);
        optimizer.betas = (training.adam_beta1.into(), training.adam_beta2.into());
        optimizer.eps = training.adam_epsilon.into();
        optimizer.weight_decay = training.weight_decay.into();

        Ok(Self {
            config,
            model,
            collator,
            optimizer,
            checkpoint_manager: None,
            profiler: None,
            metrics_file: None,
            memory_monitor: MemoryMonitor::new(),
            global_step: 0,
            start_epoch: 0,
            loss_history: Vec::new(),
            best_loss: f32::INFINITY,
            best_loss_step: 0,
            training_start_time: None,
        })
    }

    pub fn with_checkpoint_manager(mut self, manager: CheckpointManager) -> Self {
        self.checkpoint_manager = Some(manager);
        self
    }

    pub fn with_profiler(mut self, profiler: StepProfiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn with_metrics_file(mut self, path: PathBuf) -> Self {
        self.metrics_file = Some(path);
        self
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Restore adapters, optimizer moments, and counters from the newest
    /// checkpoint. Returns the resumed step, or None when no checkpoint
    /// exists.
    pub fn resume(&mut self) -> Result<Option<usize>> {
        let Some(manager) = &self.checkpoint_manager else {
            anyhow::bail!("Cannot resume: checkpointing is disabled");
        };

        let Some(checkpoint) = manager.load_latest()? else {
            return Ok(None);
        };
        checkpoint.validate()?;

        let restored = self.model.set_adapter_parameters(&checkpoint.adapters);
        if restored != checkpoint.adapters.len() {
            anyhow::bail!(
                "Checkpoint mismatch: {} of {} adapter tensors restored. \
                 Was the checkpoint written with different LoRA settings?",
                restored,
                checkpoint.adapters.len()
            );
        }

        for (key, m) in &checkpoint.exp_avg {
            if let Some(v) = checkpoint.exp_avg_sq.get(key) {
                self.optimizer
                    .state
                    .insert(Rc::from(key.as_str()), (m.clone(), v.clone()));
            }
        }

        self.global_step = checkpoint.meta.step;
        self.start_epoch = checkpoint.meta.epoch;
        self.loss_history = checkpoint.meta.loss_history.clone();
        if let Some(&last) = self.loss_history.last() {
            self.best_loss = self
                .loss_history
                .iter()
                .copied()
                .fold(last, f32::min);
        }

        info!(
            step = checkpoint.meta.step,
            epoch = checkpoint.meta.epoch,
            "resumed from checkpoint"
        );
        Ok(Some(checkpoint.meta.step))
    }

    pub fn train(&mut self) -> Result<()> {
        let dataset_dir = PathBuf::from(&self.config.paths.dataset_dir);
        let report = prepare::inspect_dataset(&dataset_dir)?;
        if report.examples == 0 {
            anyhow::bail!(
                "No usable examples in {} ({} malformed lines skipped)",
                dataset_dir.display(),
                report.skipped
            );
        }
        if report.skipped > 0 {
            warn!(
                skipped = report.skipped,
                "dataset contains malformed lines"
            );
        }

        let training = self.config.training.clone();
        let total_steps = self.total_optimizer_steps(report.examples);
        anyhow::ensure!(
            self.global_step < total_steps,
            "Nothing to do: resumed step {} is past the scheduled {} steps",
            self.global_step,
            total_steps
        );

        let scheduler = build_scheduler(
            &training.lr_scheduler_type,
            training.learning_rate,
            training.warmup_steps,
            total_steps,
        )?;

        info!(
            examples = report.examples,
            files = report.files,
            total_steps,
            batch_size = training.batch_size,
            grad_accum = training.gradient_accumulation_steps,
            adapter_params = %format_param_count(self.model.num_adapter_params()),
            alpha = self.config.objective.alpha,
            "starting training"
        );

        self.training_start_time = Some(Instant::now());
        let start_time = Instant::now();

        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ETA:{eta} {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );
        pb.set_position(self.global_step as u64);

        let mut last_loss_for_trend: Option<f32> = None;
        let files = prepare::dataset_files(&dataset_dir)?;

        // Adapter dropout is live only inside the loop
        self.model.set_training(true);

        'epochs: for epoch in self.start_epoch..training.num_train_epochs {
            let mut dataset = StreamingDataset::new(
                files.clone(),
                training.batch_size,
                self.config.performance.streaming_buffer_size,
                true,
                Some(self.config.seed + epoch as u64),
                false,
            )?;

            loop {
                if self.global_step >= total_steps {
                    break 'epochs;
                }

                let scheduled_lr = scheduler.get_lr(self.global_step);

                if let Some(profiler) = self.profiler.as_mut() {
                    profiler.step_begin();
                }

                let Some(step_loss) = self.run_optimizer_step(&mut dataset, scheduled_lr)?
                else {
                    break;
                };

                self.global_step += 1;
                pb.set_position(self.global_step as u64);

                if let Some(profiler) = self.profiler.as_mut() {
                    profiler.step_end(self.global_step, step_loss)?;
                }

                if !step_loss.is_finite() {
                    pb.abandon();
                    anyhow::bail!(
                        "Training diverged: loss is {} at step {}",
                        step_loss,
                        self.global_step
                    );
                }

                self.loss_history.push(step_loss);
                if step_loss < self.best_loss {
                    self.best_loss = step_loss;
                    self.best_loss_step = self.global_step;
                }

                if self.global_step % training.logging_steps == 0 {
                    self.log_progress(
                        &pb,
                        step_loss,
                        scheduled_lr,
                        start_time,
                        &mut last_loss_for_trend,
                    )?;
                }

                if self.config.performance.checkpoint_enabled
                    && self.checkpoint_manager.is_some()
                    && self.global_step % self.config.performance.checkpoint_interval == 0
                {
                    self.save_checkpoint(epoch)?;
                }
            }
        }

        pb.finish_with_message("Training complete");
        self.model.set_training(false);

        self.save_adapters()?;
        self.print_training_summary(start_time);
        Ok(())
    }

    /// Scheduled optimizer steps: micro batches per epoch divided by the
    /// accumulation factor, times epochs, capped by `max_steps` when set.
    fn total_optimizer_steps(&self, examples: usize) -> usize {
        let training = &self.config.training;
        let batches_per_epoch = examples.div_ceil(training.batch_size);
        let steps_per_epoch = batches_per_epoch
            .div_ceil(training.gradient_accumulation_steps)
            .max(1);
        let total = steps_per_epoch * training.num_train_epochs;
        if training.max_steps > 0 {
            total.min(training.max_steps)
        } else {
            total
        }
    }

    /// Pull up to `gradient_accumulation_steps` micro batches, compute the
    /// blended loss and adapter gradients for each, then apply the summed
    /// gradients in one AdamW update. Returns None when the epoch is out of
    /// data before the first micro batch.
    fn run_optimizer_step(
        &mut self,
        dataset: &mut StreamingDataset,
        scheduled_lr: f32,
    ) -> Result<Option<f32>> {
        let accum_steps = self.config.training.gradient_accumulation_steps;
        let mut accumulated: Option<FlattenedModuleParam> = None;
        let mut micro_losses = Vec::with_capacity(accum_steps);

        for _ in 0..accum_steps {
            let Some(examples) = dataset.next_batch() else {
                break;
            };
            let batch = self.collator.collate(&examples)?;
            let (loss_val, grads) = self.loss_and_grads(&batch)?;
            accumulate_gradients(&mut accumulated, grads, accum_steps)?;
            micro_losses.push(loss_val);
        }

        let Some(grads) = accumulated else {
            return Ok(None);
        };

        self.optimizer.lr = scheduled_lr.into();
        self.optimizer
            .update(&mut self.model, grads)
            .map_err(|e| anyhow::anyhow!("Optimizer update failed: {}", e))?;

        // Evaluate the updated adapters now; deferring grows the lazy graph
        // across steps without bound
        mlx_rs::transforms::eval_params(self.model.parameters())?;

        let mean_loss = micro_losses.iter().sum::<f32>() / micro_losses.len() as f32;
        Ok(Some(mean_loss))
    }

    /// Two forward passes through the same adapted model, one per objective
    /// view, blended into a single scalar that autodiff differentiates with
    /// respect to the adapter tensors only.
    fn loss_and_grads(&mut self, batch: &DualBatch) -> Result<(f32, FlattenedModuleParam)> {
        let alpha = self.config.objective.alpha;

        let loss_fn = |model: &mut LlamaForCausalLM,
                       (predict_ids, predict_labels, explain_ids, explain_labels): (
            &Array,
            &Array,
            &Array,
            &Array,
        )|
         -> std::result::Result<Array, Exception> {
            let predict_logits = model.forward(predict_ids)?;
            let target_loss = loss::masked_causal_loss(&predict_logits, predict_labels)
                .map_err(|e| Exception::custom(e.to_string()))?;

            let explain_logits = model.forward(explain_ids)?;
            let rationale_loss = loss::masked_causal_loss(&explain_logits, explain_labels)
                .map_err(|e| Exception::custom(e.to_string()))?;

            loss::dual_objective_loss(&target_loss, &rationale_loss, alpha)
                .map_err(|e| Exception::custom(e.to_string()))
        };

        let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
        let (loss, grads) = loss_and_grad_fn(
            &mut self.model,
            (
                &batch.predict.input_ids,
                &batch.predict.labels,
                &batch.explain.input_ids,
                &batch.explain.labels,
            ),
        )?;

        loss.eval()?;
        Ok((loss.item::<f32>(), grads))
    }

    fn log_progress(
        &mut self,
        pb: &ProgressBar,
        step_loss: f32,
        lr: f32,
        start_time: Instant,
        last_loss_for_trend: &mut Option<f32>,
    ) -> Result<()> {
        let window_start = self.loss_history.len().saturating_sub(LOSS_WINDOW);
        let window = &self.loss_history[window_start..];
        let avg_loss = window.iter().sum::<f32>() / window.len() as f32;

        let trend = match *last_loss_for_trend {
            Some(prev) if step_loss < prev * 0.995 => " ↓",
            Some(prev) if step_loss > prev * 1.005 => " ↑",
            Some(_) => " ~",
            None => "",
        };
        *last_loss_for_trend = Some(step_loss);

        let elapsed = start_time.elapsed().as_secs_f64();
        let steps_per_sec = self.global_step as f64 / elapsed.max(0.001);

        let mem_gb = self
            .memory_monitor
            .check()
            .map(|info| info.rss_bytes as f64 / 1024.0 / 1024.0 / 1024.0)
            .unwrap_or(0.0);
        let mem = if mem_gb > 0.0 {
            format!(" | mem: {:.1}GB", mem_gb)
        } else {
            String::new()
        };

        pb.set_message(format!(
            "loss: {:.4} (avg: {:.2}){} | lr: {:.2e} | {:.1} steps/s{}",
            step_loss, avg_loss, trend, lr, steps_per_sec, mem
        ));

        self.export_metrics(step_loss, avg_loss, lr, mem_gb)?;
        Ok(())
    }

    fn export_metrics(&self, loss: f32, avg_loss: f32, lr: f32, mem_gb: f64) -> Result<()> {
        let Some(path) = &self.metrics_file else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let elapsed_secs = self
            .training_start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        let record = serde_json::json!({
            "step": self.global_step,
            "loss": loss,
            "avg_loss": avg_loss,
            "lr": lr,
            "elapsed_secs": elapsed_secs,
            "memory_gb": mem_gb,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics file {}", path.display()))?;
        writeln!(file, "{}", record)?;
        Ok(())
    }

    fn save_checkpoint(&mut self, epoch: usize) -> Result<()> {
        let Some(manager) = &self.checkpoint_manager else {
            return Ok(());
        };

        let adapters = self.model.adapter_parameters();
        let mut exp_avg = HashMap::new();
        let mut exp_avg_sq = HashMap::new();
        for (key, (m, v)) in self.optimizer.state.iter() {
            exp_avg.insert(key.to_string(), m.clone());
            exp_avg_sq.insert(key.to_string(), v.clone());
        }

        // Keep the embedded loss history bounded
        let history_start = self.loss_history.len().saturating_sub(LOSS_WINDOW);
        let checkpoint = Checkpoint::new(
            self.global_step,
            epoch,
            adapters,
            exp_avg,
            exp_avg_sq,
            self.loss_history[history_start..].to_vec(),
            self.config.clone(),
        );

        manager.save(&checkpoint)?;
        Ok(())
    }

    /// Write the trained adapters to `<output_dir>/adapters.safetensors`.
    pub fn save_adapters(&self) -> Result<PathBuf> {
        let path = self.config.paths.adapters_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let adapters = self.model.adapter_parameters();
        anyhow::ensure!(!adapters.is_empty(), "Model has no adapter tensors to save");

        ModelLoader::save_safetensors(&adapters, &path)?;
        info!(
            tensors = adapters.len(),
            path = %path.display(),
            "saved adapter weights"
        );
        Ok(path)
    }

    fn print_training_summary(&self, start_time: Instant) {
        let elapsed = start_time.elapsed().as_secs();
        let final_loss = self.loss_history.last().copied().unwrap_or(f32::NAN);

        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("Training Summary");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("  Steps:        {}", self.global_step);
        println!("  Final loss:   {:.4}", final_loss);
        println!(
            "  Best loss:    {:.4} (step {})",
            self.best_loss, self.best_loss_step
        );
        println!("  Duration:     {}", format_duration(elapsed));
        println!("  Peak RSS:     {}", self.memory_monitor.max_rss_formatted());
        println!("  Adapters:     {}", self.config.paths.adapters_file().display());
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m5s");
        assert_eq!(format_duration(7260), "2h1m");
    }

    #[test]
    fn test_format_param_count() {
        assert_eq!(format_param_count(512), "512");
        assert_eq!(format_param_count(4_200_000), "4.2M");
        assert_eq!(format_param_count(7_000_000_000), "7.0B");
    }

    #[test]
    fn test_accumulate_gradients_averages() {
        let key: Rc<str> = Rc::from("model.layers.0.self_attn.q_proj.lora_a");

        let mut acc = None;
        for value in [2.0f32, 4.0] {
            let mut grads = FlattenedModuleParam::new();
            grads.insert(key.clone(), Array::from_slice(&[value, value], &[2]));
            accumulate_gradients(&mut acc, grads, 2).unwrap();
        }

        let acc = acc.unwrap();
        let summed = &acc[&key];
        summed.eval().unwrap();
        // (2 + 4) / 2
        assert_eq!(summed.as_slice::<f32>(), &[3.0, 3.0]);
    }

    #[test]
    fn test_accumulate_gradients_first_batch_scaled() {
        let key: Rc<str> = Rc::from("g");
        let mut grads = FlattenedModuleParam::new();
        grads.insert(key.clone(), Array::from_f32(8.0));

        let mut acc = None;
        accumulate_gradients(&mut acc, grads, 4).unwrap();

        let acc = acc.unwrap();
        let g = &acc[&key];
        g.eval().unwrap();
        assert_eq!(g.item::<f32>(), 2.0);
    }
}
