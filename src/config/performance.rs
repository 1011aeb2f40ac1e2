use serde::{Deserialize, Serialize};

/// Performance and instrumentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    // Streaming data loading
    pub streaming_buffer_size: usize,

    // Checkpoint recovery
    pub checkpoint_enabled: bool,
    pub checkpoint_interval: usize,
    pub checkpoint_keep_last_n: usize,

    // Step profiler (wait -> warmup -> active window, repeated)
    pub profile: bool,
    pub profiler_wait: usize,
    pub profiler_warmup: usize,
    pub profiler_active: usize,
    pub profiler_repeat: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            streaming_buffer_size: 1000,
            checkpoint_enabled: true,
            checkpoint_interval: 500,
            checkpoint_keep_last_n: 3,
            profile: false,
            profiler_wait: 1,
            profiler_warmup: 1,
            profiler_active: 2,
            profiler_repeat: 1,
        }
    }
}
