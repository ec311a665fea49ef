pub mod attention;
pub mod positional;

pub use attention::{causal_mask, AttentionConfig, CausalSelfAttention};
pub use positional::{PositionEmbedding, RotaryTables};
