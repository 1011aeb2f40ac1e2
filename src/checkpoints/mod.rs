pub mod manager;
pub mod state;

pub use manager::CheckpointManager;
pub use state::{Checkpoint, CheckpointMeta};
