//! Dual-objective training loss.
//!
//! Each training example carries two supervision signals: the primary target
//! text and an auxiliary rationale. Both views are scored with a masked
//! next-token cross-entropy and blended into a single scalar:
//!
//! ```text
//! L_total = alpha * L_target + (1 - alpha) * L_rationale
//! ```
//!
//! `alpha` lives in [0.0, 1.0]; 0.5 weighs both objectives equally.

use mlx_rs::losses::{CrossEntropyBuilder, LossReduction};
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;
use thiserror::Error;

/// Label value marking positions excluded from the loss (prompt and padding).
pub const IGNORE_INDEX: i32 = -100;

#[derive(Error, Debug)]
pub enum DualLossError {
    #[error("alpha must be in range [0.0, 1.0], got {0}")]
    InvalidAlpha(f32),

    #[error("logits must have shape [batch, seq, vocab], got {0} dimensions")]
    InvalidLogitsRank(usize),

    #[error("labels must have shape [batch, seq], got {0} dimensions")]
    InvalidLabelsRank(usize),
}

/// Validate the objective weight once at the API seam.
pub fn validate_alpha(alpha: f32) -> Result<(), DualLossError> {
    if !(0.0..=1.0).contains(&alpha) || !alpha.is_finite() {
        return Err(DualLossError::InvalidAlpha(alpha));
    }
    Ok(())
}

/// Masked next-token cross-entropy for a causal LM.
///
/// Logits at position `t` predict the label at position `t + 1`; positions
/// labeled [`IGNORE_INDEX`] are excluded from the average. A batch with no
/// supervised positions yields 0.0 rather than NaN.
pub fn masked_causal_loss(logits: &Array, labels: &Array) -> anyhow::Result<Array> {
    if logits.ndim() != 3 {
        return Err(DualLossError::InvalidLogitsRank(logits.ndim()).into());
    }
    if labels.ndim() != 2 {
        return Err(DualLossError::InvalidLabelsRank(labels.ndim()).into());
    }

    let seq_len = logits.dim(1);
    let vocab_size = logits.dim(2);

    // Shift: logits[:, :-1] predicts labels[:, 1:]
    let shift_logits = logits.index((.., ..seq_len - 1, ..));
    let shift_labels = labels.index((.., 1..));

    let flat_logits = shift_logits.reshape(&[-1, vocab_size])?;
    let flat_labels = shift_labels.reshape(&[-1])?;

    // Per-token losses, masked afterwards; the ignore index is applied here
    // rather than inside the framework loss.
    let ce = CrossEntropyBuilder::new()
        .reduction(LossReduction::None)
        .build()?;
    let per_token = ce.apply(&flat_logits, &flat_labels)?;

    let mask = flat_labels.ne(&Array::from_int(IGNORE_INDEX))?;
    let mask = mask.as_type::<f32>()?;

    let masked = per_token.multiply(&mask)?;
    let valid_count = mask.sum(None)?;

    // Clamp the denominator so an all-masked view contributes 0, not NaN
    let denom = mlx_rs::ops::maximum(&valid_count, &Array::from_f32(1.0))?;
    Ok(masked.sum(None)?.divide(&denom)?)
}

/// Blend the two objective losses on the computation graph.
///
/// Both inputs are scalar arrays so the result stays differentiable through
/// `value_and_grad`.
pub fn dual_objective_loss(
    target_loss: &Array,
    rationale_loss: &Array,
    alpha: f32,
) -> anyhow::Result<Array> {
    validate_alpha(alpha)?;

    let weighted_target = target_loss.multiply(&Array::from_f32(alpha))?;
    let weighted_rationale = rationale_loss.multiply(&Array::from_f32(1.0 - alpha))?;
    Ok(weighted_target.add(&weighted_rationale)?)
}

/// Scalar version of the blend, used for logging and metrics.
pub fn combine_objectives(
    target_loss: f32,
    rationale_loss: f32,
    alpha: f32,
) -> Result<f32, DualLossError> {
    validate_alpha(alpha)?;
    Ok(alpha * target_loss + (1.0 - alpha) * rationale_loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha_one_keeps_only_target() {
        let combined = combine_objectives(2.0, 5.0, 1.0).unwrap();
        assert!((combined - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_alpha_zero_keeps_only_rationale() {
        let combined = combine_objectives(2.0, 5.0, 0.0).unwrap();
        assert!((combined - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_combination_is_convex() {
        let combined = combine_objectives(2.0, 6.0, 0.25).unwrap();
        assert!((combined - 5.0).abs() < 1e-6);

        let lo = 2.0_f32.min(6.0);
        let hi = 2.0_f32.max(6.0);
        assert!(combined >= lo && combined <= hi);
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        assert!(combine_objectives(1.0, 1.0, -0.1).is_err());
        assert!(combine_objectives(1.0, 1.0, 1.5).is_err());
        assert!(combine_objectives(1.0, 1.0, f32::NAN).is_err());
    }

    #[test]
    fn test_dual_objective_loss_matches_scalar() {
        let target = Array::from_f32(3.0);
        let rationale = Array::from_f32(1.0);

        let combined = dual_objective_loss(&target, &rationale, 0.5).unwrap();
        let value: f32 = combined.item();
        assert!((value - 2.0).abs() < 1e-5, "expected 2.0, got {}", value);
    }

    #[test]
    fn test_masked_positions_do_not_contribute() {
        // Two positions supervise, prompt position is ignored. Perturbing the
        // logit row under the ignored label must leave the loss unchanged.
        let vocab = 4;
        let logits_data: Vec<f32> = vec![
            0.1, 0.2, 0.3, 0.4, // predicts labels[1] (ignored)
            1.0, 0.0, 0.0, 0.0, // predicts labels[2]
            0.0, 2.0, 0.0, 0.0, // predicts labels[3] (last position unused)
        ];
        let labels_data: Vec<i32> = vec![1, IGNORE_INDEX, 0, 1];

        // Labels have one more position than supervised logit rows; pad the
        // logits out to full sequence length.
        let mut full_logits = logits_data.clone();
        full_logits.extend_from_slice(&[0.0, 0.0, 0.0, 0.0]);

        let logits = Array::from_slice(&full_logits, &[1, 4, vocab]);
        let labels = Array::from_slice(&labels_data, &[1, 4]);
        let base: f32 = masked_causal_loss(&logits, &labels).unwrap().item();

        let mut perturbed = full_logits.clone();
        perturbed[0] = 9.0;
        perturbed[3] = -9.0;
        let logits2 = Array::from_slice(&perturbed, &[1, 4, vocab]);
        let changed: f32 = masked_causal_loss(&logits2, &labels).unwrap().item();

        assert!(
            (base - changed).abs() < 1e-5,
            "ignored positions leaked into the loss: {} vs {}",
            base,
            changed
        );
    }

    #[test]
    fn test_all_masked_view_is_zero() {
        let logits = Array::from_slice(&[0.5_f32; 2 * 3 * 4], &[2, 3, 4]);
        let labels = Array::from_slice(&[IGNORE_INDEX; 6], &[2, 3]);

        let loss: f32 = masked_causal_loss(&logits, &labels).unwrap().item();
        assert_eq!(loss, 0.0, "unsupervised view must contribute zero loss");
    }

    #[test]
    fn test_rank_validation() {
        let logits = Array::from_slice(&[0.0_f32; 8], &[2, 4]);
        let labels = Array::from_slice(&[0_i32; 2], &[1, 2]);
        assert!(masked_causal_loss(&logits, &labels).is_err());
    }
}
