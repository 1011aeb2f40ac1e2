pub mod profiler;
pub mod scheduler;
pub mod trainer;

pub use profiler::{ProfilerSchedule, StepProfiler};
pub use scheduler::{build_scheduler, LearningRateScheduler};
pub use trainer::DualObjectiveTrainer;
