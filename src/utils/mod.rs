pub mod memory;

pub use memory::{MemoryInfo, MemoryMonitor};
