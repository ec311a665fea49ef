pub mod traits;
pub mod config;
pub mod names;
pub mod layers;
pub mod architectures;

pub use traits::Forward;
pub use config::{Gpt2Config, Gpt2ConfigBuilder, ModelSize, PositionEncoding};
pub use names::{Gpt2Names, TensorRole, TensorSpec};
pub use architectures::{Gpt2Block, Gpt2ForCausalLM, Gpt2Mlp, Gpt2Model};

pub type LayerId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
    pub name: String,
    pub architecture: String,
    pub parameter_count: u64,
    pub context_length: usize,
    pub vocab_size: usize,
}

impl ModelMeta {
    pub fn from_config(name: impl Into<String>, config: &Gpt2Config) -> Self {
        Self {
            name: name.into(),
            architecture: config.arch.clone(),
            parameter_count: config.parameter_count(),
            context_length: config.max_position_embeddings,
            vocab_size: config.vocab_size,
        }
    }
}

impl Default for ModelMeta {
    fn default() -> Self {
        Self::from_config("gpt2", &Gpt2Config::default())
    }
}
