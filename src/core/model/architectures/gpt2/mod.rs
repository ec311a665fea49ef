pub mod block;
pub mod mlp;
pub mod model;

pub use block::{BlockTrace, Gpt2Block};
pub use mlp::Gpt2Mlp;
pub use model::{Gpt2ForCausalLM, Gpt2Model};
