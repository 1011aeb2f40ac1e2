//! CheckpointManager handles saving, loading, and pruning training
//! checkpoints. Each checkpoint is a single .safetensors file holding the
//! LoRA adapter tensors, the flattened AdamW moments, and a `_metadata`
//! blob with the run state.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use mlx_rs::Array;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::info;

use crate::checkpoints::state::{Checkpoint, CheckpointMeta};

const EXP_AVG_PREFIX: &str = "optimizer.exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "optimizer.exp_avg_sq.";

#[derive(Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: &Path, max_checkpoints: usize) -> Result<Self> {
        anyhow::ensure!(max_checkpoints > 0, "max_checkpoints must be at least 1");

        fs::create_dir_all(checkpoint_dir).with_context(|| {
            format!(
                "Failed to create checkpoint directory {}",
                checkpoint_dir.display()
            )
        })?;

        Ok(Self {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            max_checkpoints,
        })
    }

    fn checkpoint_path(&self, step: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("checkpoint-{}.safetensors", step))
    }

    /// Saves a checkpoint and prunes old ones past `max_checkpoints`.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        checkpoint.validate()?;

        let path = self.checkpoint_path(checkpoint.step());
        save_checkpoint_file(&path, checkpoint)
            .with_context(|| format!("Failed to save checkpoint to {}", path.display()))?;

        info!(
            step = checkpoint.step(),
            path = %path.display(),
            "saved checkpoint"
        );

        self.cleanup()?;
        Ok(path)
    }

    pub fn load(&self, step: usize) -> Result<Checkpoint> {
        let path = self.checkpoint_path(step);
        load_checkpoint_file(&path)
            .with_context(|| format!("Failed to load checkpoint from {}", path.display()))
    }

    /// Loads the newest checkpoint, if any exists.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        match self.list_checkpoints()?.last() {
            Some(&step) => Ok(Some(self.load(step)?)),
            None => Ok(None),
        }
    }

    /// Lists checkpoint steps in ascending order.
    pub fn list_checkpoints(&self) -> Result<Vec<usize>> {
        let mut checkpoints = Vec::new();

        let entries = fs::read_dir(&self.checkpoint_dir).with_context(|| {
            format!(
                "Failed to read checkpoint directory {}",
                self.checkpoint_dir.display()
            )
        })?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("checkpoint-") && name.ends_with(".safetensors") {
                    let step_part = name
                        .trim_start_matches("checkpoint-")
                        .trim_end_matches(".safetensors");
                    if let Ok(step) = step_part.parse::<usize>() {
                        checkpoints.push(step);
                    }
                }
            }
        }

        checkpoints.sort();
        Ok(checkpoints)
    }

    fn cleanup(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= self.max_checkpoints {
            return Ok(());
        }

        for &step in &checkpoints[..checkpoints.len() - self.max_checkpoints] {
            let path = self.checkpoint_path(step);
            fs::remove_file(&path).with_context(|| {
                format!("Failed to remove old checkpoint {}", path.display())
            })?;
        }

        Ok(())
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}

fn save_checkpoint_file(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    // Phase 1: evaluate arrays and copy into stable CPU buffers so the
    // TensorViews built below reference memory that outlives them
    let mut storage: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();

    let mut stage = |name: String, array: &Array| -> Result<()> {
        array.eval()?;
        let shape: Vec<usize> = array.shape().iter().map(|&s| s as usize).collect();
        let mut bytes = Vec::with_capacity(array.size() * 4);
        for v in array.as_slice::<f32>() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        storage.push((name, shape, bytes));
        Ok(())
    };

    for (name, array) in &checkpoint.adapters {
        stage(name.clone(), array)?;
    }
    for (name, array) in &checkpoint.exp_avg {
        stage(format!("{}{}", EXP_AVG_PREFIX, name), array)?;
    }
    for (name, array) in &checkpoint.exp_avg_sq {
        stage(format!("{}{}", EXP_AVG_SQ_PREFIX, name), array)?;
    }

    let metadata_bytes = serde_json::to_vec(&checkpoint.meta)?;

    // Phase 2: build views and serialize
    let mut views: Vec<(String, TensorView)> = Vec::new();
    for (name, shape, bytes) in &storage {
        views.push((
            name.clone(),
            TensorView::new(Dtype::F32, shape.clone(), bytes)?,
        ));
    }
    views.push((
        "_metadata".to_string(),
        TensorView::new(Dtype::U8, vec![metadata_bytes.len()], &metadata_bytes)?,
    ));

    safetensors::serialize_to_file(views, &None, path)?;
    Ok(())
}

fn load_checkpoint_file(path: &Path) -> Result<Checkpoint> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mmap = unsafe {
        MmapOptions::new()
            .map(&file)
            .with_context(|| format!("Failed to map {}", path.display()))?
    };
    let tensors = SafeTensors::deserialize(&mmap)
        .with_context(|| format!("Failed to deserialize {}", path.display()))?;

    let mut adapters = HashMap::new();
    let mut exp_avg = HashMap::new();
    let mut exp_avg_sq = HashMap::new();
    let mut meta: Option<CheckpointMeta> = None;

    for (name, tensor) in tensors.tensors() {
        if name == "_metadata" {
            meta = Some(serde_json::from_slice(tensor.data())?);
            continue;
        }

        anyhow::ensure!(
            tensor.dtype() == Dtype::F32,
            "Unexpected dtype {:?} for tensor {}",
            tensor.dtype(),
            name
        );

        let shape: Vec<i32> = tensor.shape().iter().map(|&s| s as i32).collect();
        // Tensor data in the mapped buffer is not alignment guaranteed
        let data: Vec<f32> = tensor
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let array = Array::from_slice(&data, &shape);

        if let Some(key) = name.strip_prefix(EXP_AVG_SQ_PREFIX) {
            exp_avg_sq.insert(key.to_string(), array);
        } else if let Some(key) = name.strip_prefix(EXP_AVG_PREFIX) {
            exp_avg.insert(key.to_string(), array);
        } else {
            adapters.insert(name.to_string(), array);
        }
    }

    let meta = meta.ok_or_else(|| {
        anyhow::anyhow!("Checkpoint {} is missing its _metadata tensor", path.display())
    })?;

    Ok(Checkpoint {
        adapters,
        exp_avg,
        exp_avg_sq,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn toy_checkpoint(step: usize) -> Checkpoint {
        let key = "model.layers.0.self_attn.q_proj.lora_a".to_string();
        let mut adapters = HashMap::new();
        adapters.insert(key.clone(), Array::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]));
        let mut exp_avg = HashMap::new();
        exp_avg.insert(key.clone(), Array::from_slice(&[0.1f32, 0.2, 0.3, 0.4], &[2, 2]));
        let mut exp_avg_sq = HashMap::new();
        exp_avg_sq.insert(key, Array::from_slice(&[0.5f32; 4], &[2, 2]));

        Checkpoint::new(
            step,
            0,
            adapters,
            exp_avg,
            exp_avg_sq,
            vec![2.5, 2.0],
            Config::default(),
        )
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();

        manager.save(&toy_checkpoint(100)).unwrap();
        let loaded = manager.load(100).unwrap();

        assert_eq!(loaded.step(), 100);
        assert_eq!(loaded.meta.loss_history, vec![2.5, 2.0]);
        assert_eq!(loaded.adapters.len(), 1);
        assert_eq!(loaded.exp_avg.len(), 1);
        assert_eq!(loaded.exp_avg_sq.len(), 1);

        let a = &loaded.adapters["model.layers.0.self_attn.q_proj.lora_a"];
        assert_eq!(a.shape(), &[2, 2]);
        assert_eq!(a.as_slice::<f32>(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_cleanup_keeps_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();

        for step in [10, 20, 30, 40] {
            manager.save(&toy_checkpoint(step)).unwrap();
        }

        assert_eq!(manager.list_checkpoints().unwrap(), vec![30, 40]);
    }

    #[test]
    fn test_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();

        assert!(manager.load_latest().unwrap().is_none());

        manager.save(&toy_checkpoint(5)).unwrap();
        manager.save(&toy_checkpoint(15)).unwrap();

        let latest = manager.load_latest().unwrap().unwrap();
        assert_eq!(latest.step(), 15);
    }

    #[test]
    fn test_rejects_zero_max_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointManager::new(dir.path(), 0).is_err());
    }
}
