pub mod checkpoint;

pub use checkpoint::{find_weights, inspect, load_model, CheckpointIndex, CheckpointReport};
