//! Weight-only int8 quantization for 8-bit model loading.
//!
//! Each output row of a 2-d weight is scaled by its absolute maximum
//! (`scale = max|w| / 127`) and stored as i8 plus one f32 scale per row.
//! Tensors stay in this form until they are installed into a layer, so the
//! full-precision checkpoint is never resident all at once. Adapter matrices
//! are never quantized.

use mlx_rs::Array;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuantError {
    #[error("only 2-d weights can be quantized, got shape {0:?}")]
    NotAMatrix(Vec<i32>),

    #[error("shape {shape:?} does not match {len} data elements")]
    ShapeMismatch { shape: Vec<i32>, len: usize },
}

/// A weight held in row-quantized int8 form.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub data: Vec<i8>,
    /// One scale per output row.
    pub scales: Vec<f32>,
    pub shape: [i32; 2],
}

impl QuantizedTensor {
    /// Quantize a row-major f32 weight of shape `[rows, cols]`.
    pub fn from_f32(data: &[f32], shape: &[i32]) -> Result<Self, QuantError> {
        if shape.len() != 2 {
            return Err(QuantError::NotAMatrix(shape.to_vec()));
        }
        let rows = shape[0] as usize;
        let cols = shape[1] as usize;
        if rows * cols != data.len() {
            return Err(QuantError::ShapeMismatch {
                shape: shape.to_vec(),
                len: data.len(),
            });
        }

        let mut quantized = vec![0_i8; data.len()];
        let mut scales = vec![0.0_f32; rows];

        for r in 0..rows {
            let row = &data[r * cols..(r + 1) * cols];
            let absmax = row.iter().fold(0.0_f32, |m, &v| m.max(v.abs()));

            // An all-zero row keeps scale 0 and quantizes to zeros
            let scale = if absmax > 0.0 { absmax / 127.0 } else { 0.0 };
            scales[r] = scale;

            if scale > 0.0 {
                for (c, &v) in row.iter().enumerate() {
                    quantized[r * cols + c] = (v / scale).round().clamp(-127.0, 127.0) as i8;
                }
            }
        }

        Ok(Self {
            data: quantized,
            scales,
            shape: [shape[0], shape[1]],
        })
    }

    /// Dequantize into an f32 MLX array.
    pub fn to_array(&self) -> anyhow::Result<Array> {
        let rows = self.shape[0] as usize;
        let cols = self.shape[1] as usize;

        let mut out = vec![0.0_f32; rows * cols];
        for r in 0..rows {
            let scale = self.scales[r];
            for c in 0..cols {
                out[r * cols + c] = self.data[r * cols + c] as f32 * scale;
            }
        }

        Ok(Array::from_slice(&out, &self.shape))
    }

    /// Bytes used by the quantized representation.
    pub fn storage_bytes(&self) -> usize {
        self.data.len() + self.scales.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_error_is_bounded() {
        let data: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) * 0.37).collect();
        let q = QuantizedTensor::from_f32(&data, &[8, 8]).unwrap();

        let restored = q.to_array().unwrap();
        let restored: Vec<f32> = restored.as_slice::<f32>().to_vec();

        for (r, row) in data.chunks(8).enumerate() {
            let absmax = row.iter().fold(0.0_f32, |m, &v| m.max(v.abs()));
            let half_step = absmax / 127.0 / 2.0 + 1e-6;
            for (c, &v) in row.iter().enumerate() {
                let err = (v - restored[r * 8 + c]).abs();
                assert!(
                    err <= half_step,
                    "row {} col {}: error {} exceeds half step {}",
                    r,
                    c,
                    err,
                    half_step
                );
            }
        }
    }

    #[test]
    fn test_zero_rows_are_safe() {
        let data = vec![0.0_f32; 16];
        let q = QuantizedTensor::from_f32(&data, &[4, 4]).unwrap();
        assert!(q.scales.iter().all(|&s| s == 0.0));

        let restored = q.to_array().unwrap();
        let restored: Vec<f32> = restored.as_slice::<f32>().to_vec();
        assert!(restored.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_extremes_map_to_full_range() {
        let data = vec![-1.0_f32, 1.0, 0.5, -0.25];
        let q = QuantizedTensor::from_f32(&data, &[1, 4]).unwrap();
        assert_eq!(q.data[0], -127);
        assert_eq!(q.data[1], 127);
    }

    #[test]
    fn test_storage_is_smaller_than_f32() {
        let data = vec![1.0_f32; 128 * 64];
        let q = QuantizedTensor::from_f32(&data, &[128, 64]).unwrap();
        assert!(q.storage_bytes() < data.len() * 4 / 3);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let data = vec![0.0_f32; 8];
        assert!(QuantizedTensor::from_f32(&data, &[2, 2, 2]).is_err());
        assert!(QuantizedTensor::from_f32(&data, &[3, 3]).is_err());
    }
}
