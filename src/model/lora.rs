//! Low-rank adaptation layers.
//!
//! A [`LoraLinear`] wraps a frozen projection weight with a trainable
//! low-rank residual:
//!
//! ```text
//! y = x @ W.T + (x @ A.T @ B.T) * (lora_alpha / rank)
//! ```
//!
//! `A` starts uniform in ±1/sqrt(rank) and `B` starts at zero, so a freshly
//! adapted layer computes exactly what the base layer did.

use mlx_rs::error::Exception;
use mlx_rs::Array;

/// Adapter hyperparameters.
#[derive(Debug, Clone)]
pub struct LoraConfig {
    pub rank: usize,
    pub lora_alpha: usize,
    pub dropout: f32,
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            lora_alpha: 32,
            dropout: 0.05,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
        }
    }
}

impl LoraConfig {
    pub fn scale(&self) -> f32 {
        self.lora_alpha as f32 / self.rank as f32
    }

    /// Whether a weight key (e.g. `model.layers.0.self_attn.q_proj.weight`)
    /// belongs to an adapted projection.
    pub fn targets(&self, key: &str) -> bool {
        self.target_modules.iter().any(|t| key.contains(t.as_str()))
    }
}

/// Linear projection with a frozen base weight and trainable adapter matrices.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    /// Frozen base weight, shape [out_features, in_features].
    pub weight: Array,
    /// Adapter down-projection, shape [rank, in_features].
    pub lora_a: Array,
    /// Adapter up-projection, shape [out_features, rank].
    pub lora_b: Array,
    pub scale: f32,
    /// Dropout probability on the adapter input. Applied only while
    /// `training` is set; the base path never sees it.
    pub dropout: f32,
    pub training: bool,
}

impl LoraLinear {
    /// Fresh layer with a randomly initialized base weight. Used by model
    /// construction before pretrained weights are loaded over it.
    pub fn new(
        in_features: i32,
        out_features: i32,
        rank: usize,
        lora_alpha: usize,
        dropout: f32,
    ) -> Result<Self, Exception> {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight =
            mlx_rs::random::uniform::<_, f32>(-bound, bound, &[out_features, in_features], None)?;
        Self::from_weight(weight, rank, lora_alpha, dropout)
    }

    /// Wrap an existing base weight with zero-impact adapters.
    pub fn from_weight(
        weight: Array,
        rank: usize,
        lora_alpha: usize,
        dropout: f32,
    ) -> Result<Self, Exception> {
        let shape = weight.shape();
        if shape.len() != 2 {
            return Err(Exception::custom(format!(
                "LoRA target weight must be 2-d, got shape {:?}",
                shape
            )));
        }
        let out_features = shape[0];
        let in_features = shape[1];

        let k = 1.0 / (rank as f32).sqrt();
        let lora_a =
            mlx_rs::random::uniform::<_, f32>(-k, k, &[rank as i32, in_features], None)?;
        let lora_b = mlx_rs::ops::zeros::<f32>(&[out_features, rank as i32])?;

        Ok(Self {
            weight,
            lora_a,
            lora_b,
            scale: lora_alpha as f32 / rank as f32,
            dropout,
            training: false,
        })
    }

    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        let base = x.matmul(&self.weight.transpose_axes(&[1, 0])?)?;

        // Inverted dropout on the adapter input while training; eval keeps
        // the path deterministic
        let adapter_in = if self.training && self.dropout > 0.0 {
            let keep = mlx_rs::random::uniform::<_, f32>(0.0, 1.0, x.shape(), None)?
                .ge(&Array::from_f32(self.dropout))?
                .as_type::<f32>()?;
            x.multiply(&keep)?
                .divide(&Array::from_f32(1.0 - self.dropout))?
        } else {
            x.clone()
        };

        let down = adapter_in.matmul(&self.lora_a.transpose_axes(&[1, 0])?)?;
        let up = down.matmul(&self.lora_b.transpose_axes(&[1, 0])?)?;
        let adapter = up.multiply(&Array::from_f32(self.scale))?;

        base.add(&adapter)
    }

    /// Number of trainable adapter values in this layer.
    pub fn num_adapter_params(&self) -> usize {
        (self.lora_a.size() + self.lora_b.size()) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_is_alpha_over_rank() {
        let config = LoraConfig::default();
        assert!((config.scale() - 4.0).abs() < 1e-6, "32 / 8 should be 4");
    }

    #[test]
    fn test_default_targets_q_and_v() {
        let config = LoraConfig::default();
        assert!(config.targets("model.layers.3.self_attn.q_proj.weight"));
        assert!(config.targets("model.layers.3.self_attn.v_proj.weight"));
        assert!(!config.targets("model.layers.3.self_attn.k_proj.weight"));
        assert!(!config.targets("model.layers.3.mlp.gate_proj.weight"));
    }

    #[test]
    fn test_fresh_adapter_is_identity_residual() {
        // lora_b starts at zero, so the adapted layer must reproduce the base
        // projection exactly.
        let layer = LoraLinear::new(8, 6, 4, 16, 0.05).unwrap();
        let x = mlx_rs::ops::ones::<f32>(&[2, 3, 8]).unwrap();

        let base = x
            .matmul(&layer.weight.transpose_axes(&[1, 0]).unwrap())
            .unwrap();
        let adapted = layer.forward(&x).unwrap();

        let diff: f32 = base
            .subtract(&adapted)
            .unwrap()
            .abs()
            .unwrap()
            .sum(None)
            .unwrap()
            .item();
        assert!(diff < 1e-6, "fresh adapters changed the output by {}", diff);
    }

    #[test]
    fn test_adapter_shapes() {
        let layer = LoraLinear::new(16, 12, 4, 8, 0.0).unwrap();
        assert_eq!(layer.lora_a.shape(), &[4, 16]);
        assert_eq!(layer.lora_b.shape(), &[12, 4]);
        assert_eq!(layer.num_adapter_params(), 4 * 16 + 12 * 4);
    }

    #[test]
    fn test_rejects_non_matrix_weight() {
        let weight = mlx_rs::ops::zeros::<f32>(&[4, 4, 4]).unwrap();
        assert!(LoraLinear::from_weight(weight, 2, 4, 0.0).is_err());
    }

    fn abs_diff(a: &Array, b: &Array) -> f32 {
        a.subtract(b)
            .unwrap()
            .abs()
            .unwrap()
            .sum(None)
            .unwrap()
            .item()
    }

    #[test]
    fn test_dropout_perturbs_adapter_path_only_in_training_mode() {
        let mut layer = LoraLinear::new(8, 6, 4, 16, 0.5).unwrap();
        // Zero lora_b would hide the adapter path entirely
        layer.lora_b = mlx_rs::ops::ones::<f32>(&[6, 4]).unwrap();
        let x = mlx_rs::ops::ones::<f32>(&[2, 3, 8]).unwrap();

        let eval_out = layer.forward(&x).unwrap();
        let eval_repeat = layer.forward(&x).unwrap();
        assert!(
            abs_diff(&eval_out, &eval_repeat) < 1e-6,
            "eval-mode forward must be deterministic"
        );

        layer.training = true;
        let train_out = layer.forward(&x).unwrap();
        // Kept inputs are rescaled by 1/(1-p), so a training-mode pass cannot
        // reproduce the eval activations
        assert!(
            abs_diff(&train_out, &eval_out) > 1e-4,
            "training-mode dropout left the adapter path untouched"
        );
    }

    #[test]
    fn test_zero_dropout_training_matches_eval() {
        let mut layer = LoraLinear::new(8, 6, 4, 16, 0.0).unwrap();
        layer.lora_b = mlx_rs::ops::ones::<f32>(&[6, 4]).unwrap();
        let x = mlx_rs::ops::ones::<f32>(&[2, 3, 8]).unwrap();

        let eval_out = layer.forward(&x).unwrap();
        layer.training = true;
        let train_out = layer.forward(&x).unwrap();

        assert!(abs_diff(&train_out, &eval_out) < 1e-6);
    }
}
