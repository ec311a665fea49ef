pub mod core;
pub mod infra;
pub mod envconfig;

pub mod model {
    pub use crate::core::model::*;
}

pub use crate::core::{
    Forward, Gpt2Config, Gpt2ForCausalLM, Gpt2Model, Gpt2Names, ModelMeta, ModelSize,
    PositionEncoding, TensorRole,
    CacheHandle, CacheSet, ResettableCache,
    Gpt2Error, Result,
};

pub use crate::infra::{find_weights, inspect, load_model, CheckpointIndex, CheckpointReport};

pub use crate::envconfig::{DeviceSpec, EnvConfig};
