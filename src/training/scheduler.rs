//! Learning rate schedulers

use std::f32::consts::PI;

pub trait LearningRateScheduler {
    fn get_lr(&self, step: usize) -> f32;
}

/// Linear warmup followed by linear decay to zero at `max_steps`.
pub struct WarmupLinearSchedule {
    base_lr: f32,
    warmup_steps: usize,
    max_steps: usize,
}

impl WarmupLinearSchedule {
    pub fn new(base_lr: f32, warmup_steps: usize, max_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            max_steps,
        }
    }
}

impl LearningRateScheduler for WarmupLinearSchedule {
    fn get_lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            // Linear warmup
            let warmup_factor = step as f32 / self.warmup_steps as f32;
            1e-7 + (self.base_lr - 1e-7) * warmup_factor
        } else if self.max_steps > self.warmup_steps {
            let remaining = self.max_steps.saturating_sub(step) as f32;
            let decay_span = (self.max_steps - self.warmup_steps) as f32;
            self.base_lr * (remaining / decay_span).max(0.0)
        } else {
            self.base_lr
        }
    }
}

pub struct WarmupCosineSchedule {
    base_lr: f32,
    warmup_steps: usize,
    max_steps: usize,
}

impl WarmupCosineSchedule {
    pub fn new(base_lr: f32, warmup_steps: usize, max_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            max_steps,
        }
    }
}

impl LearningRateScheduler for WarmupCosineSchedule {
    fn get_lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            // Linear warmup
            let warmup_factor = step as f32 / self.warmup_steps as f32;
            1e-7 + (self.base_lr - 1e-7) * warmup_factor
        } else {
            // Cosine decay
            let progress =
                (step - self.warmup_steps) as f32 / (self.max_steps - self.warmup_steps) as f32;
            self.base_lr * 0.5 * (1.0 + (progress.min(1.0) * PI).cos())
        }
    }
}

/// Constant learning rate, no warmup or decay.
pub struct ConstantSchedule {
    base_lr: f32,
}

impl ConstantSchedule {
    pub fn new(base_lr: f32) -> Self {
        Self { base_lr }
    }
}

impl LearningRateScheduler for ConstantSchedule {
    fn get_lr(&self, _step: usize) -> f32 {
        self.base_lr
    }
}

/// Build a scheduler from its config name.
pub fn build_scheduler(
    kind: &str,
    base_lr: f32,
    warmup_steps: usize,
    max_steps: usize,
) -> anyhow::Result<Box<dyn LearningRateScheduler>> {
    match kind {
        "linear" => Ok(Box::new(WarmupLinearSchedule::new(
            base_lr,
            warmup_steps,
            max_steps,
        ))),
        "cosine" => Ok(Box::new(WarmupCosineSchedule::new(
            base_lr,
            warmup_steps,
            max_steps,
        ))),
        "constant" => Ok(Box::new(ConstantSchedule::new(base_lr))),
        other => anyhow::bail!(
            "Unknown lr_scheduler_type: {} (expected linear, cosine, or constant)",
            other
        ),
    }
}
