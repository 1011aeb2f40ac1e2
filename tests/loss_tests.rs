use mlx_rs::Array;

use dualft::loss::{dual_objective_loss, masked_causal_loss, IGNORE_INDEX};

/// Logits strongly peaked at `targets[t]` for position t, [1, seq, vocab].
fn peaked_logits(targets: &[i32], vocab: i32) -> Array {
    let seq = targets.len();
    let mut data = vec![0.0f32; seq * vocab as usize];
    for (t, &tok) in targets.iter().enumerate() {
        data[t * vocab as usize + tok as usize] = 100.0;
    }
    Array::from_slice(&data, &[1, seq as i32, vocab])
}

#[test]
fn test_peaked_logits_give_near_zero_loss() {
    // Position t predicts label t+1, so peak each position at the next token
    let labels = Array::from_slice(&[3_i32, 7, 11, 2], &[1, 4]);
    let logits = peaked_logits(&[0, 7, 11, 2], 16);

    let loss = masked_causal_loss(&logits, &labels).unwrap();
    loss.eval().unwrap();
    assert!(loss.item::<f32>() < 1e-3);
}

#[test]
fn test_uniform_logits_give_log_vocab() {
    let vocab = 16;
    let labels = Array::from_slice(&[1_i32, 2, 3, 4], &[1, 4]);
    let logits = Array::from_slice(&vec![0.0f32; 4 * vocab as usize], &[1, 4, vocab]);

    let loss = masked_causal_loss(&logits, &labels).unwrap();
    loss.eval().unwrap();
    let expected = (vocab as f32).ln();
    assert!((loss.item::<f32>() - expected).abs() < 1e-4);
}

#[test]
fn test_masked_positions_are_excluded() {
    // Identical logits, but the second row masks its supervised tail; only
    // unmasked positions may influence the loss
    let logits = peaked_logits(&[0, 7, 11, 2], 16);

    let labels_full = Array::from_slice(&[IGNORE_INDEX, 7, 11, 2], &[1, 4]);
    let labels_partial = Array::from_slice(&[IGNORE_INDEX, 7, IGNORE_INDEX, IGNORE_INDEX], &[1, 4]);

    let full = masked_causal_loss(&logits, &labels_full).unwrap();
    let partial = masked_causal_loss(&logits, &labels_partial).unwrap();
    full.eval().unwrap();
    partial.eval().unwrap();

    assert!(full.item::<f32>() < 1e-3);
    assert!(partial.item::<f32>() < 1e-3);
}

#[test]
fn test_fully_masked_view_contributes_zero() {
    let logits = Array::from_slice(&vec![1.0f32; 4 * 16], &[1, 4, 16]);
    let labels = Array::from_slice(&[IGNORE_INDEX; 4], &[1, 4]);

    let loss = masked_causal_loss(&logits, &labels).unwrap();
    loss.eval().unwrap();
    let value = loss.item::<f32>();
    assert!(value.is_finite());
    assert_eq!(value, 0.0);
}

#[test]
fn test_dual_objective_blend() {
    let target = Array::from_f32(2.0);
    let rationale = Array::from_f32(4.0);

    let all_target = dual_objective_loss(&target, &rationale, 1.0).unwrap();
    let all_rationale = dual_objective_loss(&target, &rationale, 0.0).unwrap();
    let even = dual_objective_loss(&target, &rationale, 0.5).unwrap();
    all_target.eval().unwrap();
    all_rationale.eval().unwrap();
    even.eval().unwrap();

    assert!((all_target.item::<f32>() - 2.0).abs() < 1e-6);
    assert!((all_rationale.item::<f32>() - 4.0).abs() < 1e-6);
    assert!((even.item::<f32>() - 3.0).abs() < 1e-6);
}

#[test]
fn test_dual_objective_rejects_out_of_range_alpha() {
    let target = Array::from_f32(1.0);
    let rationale = Array::from_f32(1.0);

    assert!(dual_objective_loss(&target, &rationale, -0.1).is_err());
    assert!(dual_objective_loss(&target, &rationale, 1.1).is_err());
    assert!(dual_objective_loss(&target, &rationale, f32::NAN).is_err());
}
