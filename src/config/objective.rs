use serde::{Deserialize, Serialize};

/// Dual-objective loss configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    /// Weight of the primary target objective; the rationale objective gets
    /// `1 - alpha`. Must lie in [0.0, 1.0].
    pub alpha: f32,
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}
