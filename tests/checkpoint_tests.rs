use std::collections::HashMap;

use mlx_rs::Array;

use dualft::checkpoints::{Checkpoint, CheckpointManager};
use dualft::config::Config;

fn checkpoint_at(step: usize, config: Config) -> Checkpoint {
    let key = "model.layers.0.self_attn.v_proj.lora_b".to_string();
    let mut adapters = HashMap::new();
    adapters.insert(
        key.clone(),
        Array::from_slice(&[0.25f32, -0.5, 1.5, 0.0], &[2, 2]),
    );
    let mut exp_avg = HashMap::new();
    exp_avg.insert(key.clone(), Array::from_slice(&[0.01f32; 4], &[2, 2]));
    let mut exp_avg_sq = HashMap::new();
    exp_avg_sq.insert(key, Array::from_slice(&[0.001f32; 4], &[2, 2]));

    Checkpoint::new(step, 0, adapters, exp_avg, exp_avg_sq, vec![3.0, 2.5], config)
}

#[test]
fn test_adapter_tensors_round_trip_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path(), 3).unwrap();

    manager.save(&checkpoint_at(42, Config::default())).unwrap();
    let loaded = manager.load(42).unwrap();

    let tensor = &loaded.adapters["model.layers.0.self_attn.v_proj.lora_b"];
    assert_eq!(tensor.shape(), &[2, 2]);
    assert_eq!(tensor.as_slice::<f32>(), &[0.25, -0.5, 1.5, 0.0]);
}

#[test]
fn test_optimizer_moments_survive_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path(), 3).unwrap();

    manager.save(&checkpoint_at(7, Config::default())).unwrap();
    let loaded = manager.load(7).unwrap();

    let m = &loaded.exp_avg["model.layers.0.self_attn.v_proj.lora_b"];
    let v = &loaded.exp_avg_sq["model.layers.0.self_attn.v_proj.lora_b"];
    assert_eq!(m.as_slice::<f32>(), &[0.01; 4]);
    assert_eq!(v.as_slice::<f32>(), &[0.001; 4]);
}

#[test]
fn test_metadata_carries_run_config() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path(), 3).unwrap();

    let mut config = Config::default();
    config.objective.alpha = 0.8;
    config.training.batch_size = 4;

    manager.save(&checkpoint_at(100, config)).unwrap();
    let loaded = manager.load(100).unwrap();

    assert_eq!(loaded.meta.step, 100);
    assert_eq!(loaded.meta.loss_history, vec![3.0, 2.5]);
    assert!((loaded.meta.config.objective.alpha - 0.8).abs() < 1e-6);
    assert_eq!(loaded.meta.config.training.batch_size, 4);
}

#[test]
fn test_keep_last_n_pruning() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path(), 2).unwrap();

    for step in [100, 200, 300] {
        manager.save(&checkpoint_at(step, Config::default())).unwrap();
    }

    assert_eq!(manager.list_checkpoints().unwrap(), vec![200, 300]);
    assert!(manager.load(100).is_err());

    let latest = manager.load_latest().unwrap().unwrap();
    assert_eq!(latest.step(), 300);
}
