pub mod gpt2;

pub use gpt2::{Gpt2Block, Gpt2ForCausalLM, Gpt2Mlp, Gpt2Model};
