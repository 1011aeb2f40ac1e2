//! Model loading from safetensors checkpoints.

use half::{bf16, f16};
use mlx_rs::Array;
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::quant::QuantizedTensor;

/// A base weight staged for installation, either at full precision or held
/// as int8 until the owning layer takes it. Keeping the quantized form here
/// is what makes 8-bit loading cheaper: the f32 data only materializes one
/// tensor at a time, inside [`WeightTensor::into_array`].
#[derive(Debug, Clone)]
pub enum WeightTensor {
    Full(Array),
    Quantized(QuantizedTensor),
}

impl WeightTensor {
    /// Materialize the f32 array, dequantizing if needed.
    pub fn into_array(self) -> anyhow::Result<Array> {
        match self {
            Self::Full(array) => Ok(array),
            Self::Quantized(q) => q.to_array(),
        }
    }
}

/// Safely create MLX array from f32 slice with validation
fn safe_array_from_slice_f32(
    data: &[f32],
    shape: &[i32],
    tensor_name: &str,
) -> anyhow::Result<Array> {
    let total_elements: i64 = shape.iter().map(|&s| s as i64).product();
    if total_elements != data.len() as i64 {
        anyhow::bail!(
            "Shape mismatch for tensor '{}': shape {:?} requires {} elements but data has {}",
            tensor_name,
            shape,
            total_elements,
            data.len()
        );
    }

    if shape.iter().any(|&s| s <= 0) {
        anyhow::bail!(
            "Invalid shape for tensor '{}': {:?} contains non-positive dimensions",
            tensor_name,
            shape
        );
    }

    // Validate before handing to MLX; C++ exceptions are not catchable here
    let size_mb = (total_elements * 4) / (1024 * 1024);
    if size_mb > 4096 {
        anyhow::bail!(
            "Tensor '{}' is too large ({} MB) - may cause memory issues",
            tensor_name,
            size_mb
        );
    }

    Ok(Array::from_slice(data, shape))
}

fn safe_array_from_slice_i32(
    data: &[i32],
    shape: &[i32],
    tensor_name: &str,
) -> anyhow::Result<Array> {
    let total_elements: i64 = shape.iter().map(|&s| s as i64).product();
    if total_elements != data.len() as i64 {
        anyhow::bail!(
            "Shape mismatch for tensor '{}': shape {:?} requires {} elements but data has {}",
            tensor_name,
            shape,
            total_elements,
            data.len()
        );
    }

    Ok(Array::from_slice(data, shape))
}

/// Loads pretrained checkpoints by model id or path, optionally passing base
/// weights through int8.
pub struct ModelLoader {
    model_id: String,
    load_in_8bit: bool,
}

impl ModelLoader {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            load_in_8bit: false,
        }
    }

    pub fn with_8bit(mut self, load_in_8bit: bool) -> Self {
        self.load_in_8bit = load_in_8bit;
        self
    }

    /// Resolve the model id to a local directory holding `config.json`,
    /// `tokenizer.json` and the safetensors shard(s).
    ///
    /// A direct path is used as-is; a hub-style id (`org/name`) is looked up
    /// in the HuggingFace cache (`~/.cache/huggingface/hub`).
    pub fn resolve_model_dir(&self) -> anyhow::Result<PathBuf> {
        let path = Path::new(&self.model_id);

        if path.exists() {
            if path.is_dir() {
                return Ok(path.to_path_buf());
            }
            // A direct file path points at its parent directory
            return Ok(path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")));
        }

        if self.model_id.contains('/') {
            let snapshots_dir = PathBuf::from(format!(
                "{}/.cache/huggingface/hub/models--{}/snapshots",
                std::env::var("HOME").unwrap_or_default(),
                self.model_id.replace('/', "--")
            ));

            if snapshots_dir.exists() {
                // Pick the snapshot that actually contains a config.json
                let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&snapshots_dir)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect();
                snapshots.sort();

                for snapshot in snapshots.iter().rev() {
                    if snapshot.join("config.json").exists() {
                        tracing::info!(path = %snapshot.display(), "resolved model from hub cache");
                        return Ok(snapshot.clone());
                    }
                }
            }

            anyhow::bail!(
                "model '{}' not found in the HuggingFace cache; download it first \
                (huggingface-cli download {}) or pass a local directory",
                self.model_id,
                self.model_id
            );
        }

        anyhow::bail!("model path does not exist: {}", self.model_id);
    }

    /// Load all weight tensors. Projection weights stay int8 when 8-bit
    /// loading is enabled; everything else converts to f32. Handles
    /// single-file and sharded checkpoints.
    pub fn load_safetensors(&self) -> anyhow::Result<HashMap<String, WeightTensor>> {
        let dir = self.resolve_model_dir()?;

        let mut shard_files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("safetensors"))
            .collect();
        shard_files.sort();

        if shard_files.is_empty() {
            anyhow::bail!("no .safetensors files found in {}", dir.display());
        }

        let mut weights = HashMap::new();
        for (idx, shard_path) in shard_files.iter().enumerate() {
            tracing::info!(
                shard = idx + 1,
                total = shard_files.len(),
                path = %shard_path.display(),
                "loading shard"
            );
            let shard_weights = self.load_single_safetensors(shard_path)?;
            weights.extend(shard_weights);
        }

        tracing::info!(
            tensors = weights.len(),
            shards = shard_files.len(),
            eight_bit = self.load_in_8bit,
            "loaded checkpoint"
        );

        Ok(weights)
    }

    fn load_single_safetensors(
        &self,
        path: &Path,
    ) -> anyhow::Result<HashMap<String, WeightTensor>> {
        let data = std::fs::read(path)?;
        let tensors = SafeTensors::deserialize(&data)?;

        let mut weights = HashMap::new();

        for (name, tensor) in tensors.tensors() {
            let shape: Vec<usize> = tensor.shape().to_vec();
            let shape_i32: Vec<i32> = shape.iter().map(|&s| s as i32).collect();
            let raw_data = tensor.data();
            let dtype = tensor.dtype();

            // Tensor data inside a safetensors buffer has no alignment
            // guarantee, so every dtype is decoded byte-wise
            let staged = match dtype {
                safetensors::Dtype::F32 => {
                    let float_data: Vec<f32> = raw_data
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    self.materialize(&float_data, &shape_i32, &name)?
                }
                safetensors::Dtype::F16 => {
                    let f32_data: Vec<f32> = raw_data
                        .chunks_exact(2)
                        .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                        .collect();
                    self.materialize(&f32_data, &shape_i32, &name)?
                }
                safetensors::Dtype::BF16 => {
                    let f32_data: Vec<f32> = raw_data
                        .chunks_exact(2)
                        .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                        .collect();
                    self.materialize(&f32_data, &shape_i32, &name)?
                }
                safetensors::Dtype::I64 => {
                    let i32_data: Vec<i32> = raw_data
                        .chunks_exact(8)
                        .map(|c| {
                            i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                                as i32
                        })
                        .collect();
                    WeightTensor::Full(safe_array_from_slice_i32(&i32_data, &shape_i32, &name)?)
                }
                _ => {
                    tracing::warn!(tensor = %name, ?dtype, "unsupported dtype, skipping");
                    continue;
                }
            };

            weights.insert(name.to_string(), staged);
        }

        Ok(weights)
    }

    /// Stage raw f32 data, keeping projection weights in int8 when 8-bit
    /// loading is on. Embeddings and norms keep full precision, matching
    /// weight-only quantization schemes.
    fn materialize(&self, data: &[f32], shape: &[i32], name: &str) -> anyhow::Result<WeightTensor> {
        let quantizable = shape.len() == 2 && name.contains("proj");
        if self.load_in_8bit && quantizable {
            return Ok(WeightTensor::Quantized(QuantizedTensor::from_f32(
                data, shape,
            )?));
        }
        Ok(WeightTensor::Full(safe_array_from_slice_f32(
            data, shape, name,
        )?))
    }

    pub fn save_safetensors(
        weights: &HashMap<String, Array>,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<()> {
        let path = path.as_ref();

        // Phase 1: evaluate arrays and copy data to stable CPU buffers so the
        // TensorViews built below reference memory that outlives them
        let mut data_storage: Vec<(String, Vec<usize>, safetensors::Dtype, Vec<u8>)> = Vec::new();

        for (name, array) in weights {
            array.eval()?;

            let shape: Vec<usize> = array.shape().iter().map(|&s| s as usize).collect();

            let slice = array.as_slice::<f32>();
            let bytes: &[u8] = unsafe {
                std::slice::from_raw_parts(slice.as_ptr() as *const u8, slice.len() * 4)
            };

            data_storage.push((name.clone(), shape, safetensors::Dtype::F32, bytes.to_vec()));
        }

        // Phase 2: build TensorViews over the stable buffers
        let mut headers: HashMap<String, safetensors::tensor::TensorView> = HashMap::new();
        for (name, shape, dtype, bytes) in &data_storage {
            headers.insert(
                name.clone(),
                safetensors::tensor::TensorView::new(*dtype, shape.clone(), bytes)?,
            );
        }

        safetensors::serialize_to_file(&headers, &None, path)?;
        tracing::info!(tensors = weights.len(), path = %path.display(), "saved safetensors");

        Ok(())
    }

    /// Load a flat safetensors file (e.g. saved adapters) as f32 arrays.
    pub fn load_flat_safetensors(path: impl AsRef<Path>) -> anyhow::Result<HashMap<String, Array>> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let tensors = SafeTensors::deserialize(&data)?;

        let mut out = HashMap::new();
        for (name, tensor) in tensors.tensors() {
            let shape_i32: Vec<i32> = tensor.shape().iter().map(|&s| s as i32).collect();
            let raw = tensor.data();
            match tensor.dtype() {
                safetensors::Dtype::F32 => {
                    // Tensor data in a safetensors buffer is not alignment
                    // guaranteed, copy byte-wise
                    let floats: Vec<f32> = raw
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    out.insert(
                        name.to_string(),
                        safe_array_from_slice_f32(&floats, &shape_i32, &name)?,
                    );
                }
                other => anyhow::bail!("unexpected dtype {:?} for tensor '{}'", other, name),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_loader_creation() {
        let loader = ModelLoader::new("models/test-model").with_8bit(true);
        assert_eq!(loader.model_id, "models/test-model");
        assert!(loader.load_in_8bit);
    }

    #[test]
    fn test_resolve_rejects_missing_local_path() {
        let loader = ModelLoader::new("does-not-exist");
        assert!(loader.resolve_model_dir().is_err());
    }

    #[test]
    fn test_eight_bit_projections_stay_quantized_until_installed() {
        let loader = ModelLoader::new("unused").with_8bit(true);
        let data: Vec<f32> = (0..32).map(|i| i as f32 * 0.1 - 1.6).collect();

        let staged = loader
            .materialize(&data, &[4, 8], "model.layers.0.self_attn.q_proj.weight")
            .unwrap();
        let WeightTensor::Quantized(q) = &staged else {
            panic!("projection weight was materialized at full precision");
        };
        assert!(q.storage_bytes() < data.len() * std::mem::size_of::<f32>());

        let array = staged.into_array().unwrap();
        assert_eq!(array.shape(), &[4, 8]);
    }

    #[test]
    fn test_eight_bit_keeps_norms_at_full_precision() {
        let loader = ModelLoader::new("unused").with_8bit(true);
        let data = vec![1.0_f32; 16];

        let staged = loader
            .materialize(&data, &[16], "model.norm.weight")
            .unwrap();
        assert!(matches!(staged, WeightTensor::Full(_)));
    }
}
