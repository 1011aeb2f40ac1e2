pub mod collator;
pub mod prepare;
pub mod streaming;

pub use collator::{DualBatch, DualObjectiveCollator, EncodedBatch};
pub use streaming::{StreamingDataset, TrainExample};
