pub mod error;
pub mod model;
pub mod cache;

pub use error::Gpt2Error;
pub use model::{
    Forward, Gpt2Config, Gpt2ForCausalLM, Gpt2Model, Gpt2Names, ModelMeta, ModelSize,
    PositionEncoding, TensorRole,
};
pub use cache::{CacheHandle, CacheSet, ResettableCache};

pub type Result<T> = std::result::Result<T, Gpt2Error>;
