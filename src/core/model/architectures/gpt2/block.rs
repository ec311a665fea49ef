use super::mlp::Gpt2Mlp;
use crate::core::model::config::Gpt2Config;
use crate::core::model::layers::{AttentionConfig, CausalSelfAttention};
use crate::core::model::{Forward, LayerId};
use crate::core::Result;
use candle_core::Tensor;
use candle_nn::{layer_norm, LayerNorm, Module, VarBuilder};

/// Every intermediate of one block's forward pass.
#[derive(Debug, Clone)]
pub struct BlockTrace {
    pub attn_input: Tensor,
    pub attn_output: Tensor,
    pub residual: Tensor,
    pub mlp_input: Tensor,
    pub mlp_output: Tensor,
    pub output: Tensor,
}

impl BlockTrace {
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        [
            &self.attn_input,
            &self.attn_output,
            &self.residual,
            &self.mlp_input,
            &self.mlp_output,
            &self.output,
        ]
        .iter()
        .map(|t| t.dims().to_vec())
        .collect()
    }
}

/// Pre-norm decoder layer: `ln_1 → attn → +x → ln_2 → mlp → +residual`.
pub struct Gpt2Block {
    index: LayerId,
    attention: CausalSelfAttention,
    mlp: Gpt2Mlp,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl Gpt2Block {
    /// `vb` must point at the block prefix (`h.<index>`).
    pub fn new(index: LayerId, config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let names = &config.names;
        let hidden = config.hidden_size;
        let label = format!("{}.{}", names.block_prefix(index), names.attn_base_name);
        tracing::debug!(layer = index, "building transformer block");

        Ok(Self {
            index,
            attention: CausalSelfAttention::new(
                &AttentionConfig::from_model(config),
                names,
                vb.pp(&names.attn_base_name),
                &label,
            )?,
            mlp: Gpt2Mlp::new(
                hidden,
                config.intermediate_size,
                config.activation,
                names,
                vb.pp(&names.ffn_base_name),
            )?,
            norm1: layer_norm(hidden, config.layer_norm_eps, vb.pp(&names.attn_norm_name))?,
            norm2: layer_norm(hidden, config.layer_norm_eps, vb.pp(&names.ffn_norm_name))?,
        })
    }

    pub fn index(&self) -> LayerId {
        self.index
    }

    pub fn attention(&self) -> &CausalSelfAttention {
        &self.attention
    }

    pub fn forward_traced(&self, xs: &Tensor) -> Result<BlockTrace> {
        let attn_input = self.norm1.forward(xs)?;
        let attn_output = self.attention.forward(&attn_input, &attn_input, &attn_input)?;
        let residual = (&attn_output + xs)?;
        let mlp_input = self.norm2.forward(&residual)?;
        let mlp_output = self.mlp.forward(&mlp_input)?;
        let output = (&mlp_output + &residual)?;

        Ok(BlockTrace {
            attn_input,
            attn_output,
            residual,
            mlp_input,
            mlp_output,
            output,
        })
    }
}

impl Forward for Gpt2Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.forward_traced(xs)?.output)
    }
}
