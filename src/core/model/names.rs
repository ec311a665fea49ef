//! Tensor naming scheme of GPT-2 checkpoints.
//!
//! Every parameter is addressed as `<prefix>.<fragment>.{weight,bias}`, where
//! the per-block prefix is `h.<index>`. The fragments below are the ones
//! checkpoints are exported with; loaders resolve names through
//! [`Gpt2Names`] instead of hard-coding strings.

use super::config::Gpt2Config;
use crate::core::{Gpt2Error, Result};

/// Abstract parameter roles of the architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    TokenEmbedding,
    PositionEmbedding,
    Blocks,
    Attention,
    Mlp,
    QueryProj,
    KeyProj,
    ValueProj,
    AttnOutProj,
    UpProj,
    DownProj,
    AttnNorm,
    MlpNorm,
    FinalNorm,
    LmHead,
}

impl TensorRole {
    pub const ALL: [TensorRole; 15] = [
        TensorRole::TokenEmbedding,
        TensorRole::PositionEmbedding,
        TensorRole::Blocks,
        TensorRole::Attention,
        TensorRole::Mlp,
        TensorRole::QueryProj,
        TensorRole::KeyProj,
        TensorRole::ValueProj,
        TensorRole::AttnOutProj,
        TensorRole::UpProj,
        TensorRole::DownProj,
        TensorRole::AttnNorm,
        TensorRole::MlpNorm,
        TensorRole::FinalNorm,
        TensorRole::LmHead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TensorRole::TokenEmbedding => "token_embedding",
            TensorRole::PositionEmbedding => "position_embedding",
            TensorRole::Blocks => "blocks",
            TensorRole::Attention => "attention",
            TensorRole::Mlp => "mlp",
            TensorRole::QueryProj => "q_proj",
            TensorRole::KeyProj => "k_proj",
            TensorRole::ValueProj => "v_proj",
            TensorRole::AttnOutProj => "o_proj",
            TensorRole::UpProj => "up_proj",
            TensorRole::DownProj => "down_proj",
            TensorRole::AttnNorm => "attn_norm",
            TensorRole::MlpNorm => "mlp_norm",
            TensorRole::FinalNorm => "final_norm",
            TensorRole::LmHead => "lm_head",
        }
    }
}

/// A fully qualified checkpoint tensor and the shape the model expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    fn new(name: String, shape: &[usize]) -> Self {
        Self {
            name,
            shape: shape.to_vec(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt2Names {
    pub blk_name: String,
    pub attn_base_name: String,
    pub ffn_base_name: String,
    pub q_proj_name: String,
    pub k_proj_name: String,
    pub v_proj_name: String,
    pub o_proj_name: String,
    pub up_proj_name: String,
    pub down_proj_name: String,
    pub attn_norm_name: String,
    pub ffn_norm_name: String,
    pub token_embd_name: String,
    pub pos_embd_name: String,
    pub post_norm_name: String,
    pub lm_head_name: String,
}

impl Default for Gpt2Names {
    fn default() -> Self {
        Self {
            blk_name: "h".to_string(),
            attn_base_name: "attn".to_string(),
            ffn_base_name: "mlp".to_string(),
            q_proj_name: "c_attn.q_proj".to_string(),
            k_proj_name: "c_attn.k_proj".to_string(),
            v_proj_name: "c_attn.v_proj".to_string(),
            o_proj_name: "c_proj".to_string(),
            up_proj_name: "c_fc".to_string(),
            down_proj_name: "c_proj".to_string(),
            attn_norm_name: "ln_1".to_string(),
            ffn_norm_name: "ln_2".to_string(),
            token_embd_name: "wte".to_string(),
            pos_embd_name: "wpe".to_string(),
            post_norm_name: "ln_f".to_string(),
            lm_head_name: "lm_head".to_string(),
        }
    }
}

impl Gpt2Names {
    pub fn get(&self, role: TensorRole) -> &str {
        match role {
            TensorRole::TokenEmbedding => &self.token_embd_name,
            TensorRole::PositionEmbedding => &self.pos_embd_name,
            TensorRole::Blocks => &self.blk_name,
            TensorRole::Attention => &self.attn_base_name,
            TensorRole::Mlp => &self.ffn_base_name,
            TensorRole::QueryProj => &self.q_proj_name,
            TensorRole::KeyProj => &self.k_proj_name,
            TensorRole::ValueProj => &self.v_proj_name,
            TensorRole::AttnOutProj => &self.o_proj_name,
            TensorRole::UpProj => &self.up_proj_name,
            TensorRole::DownProj => &self.down_proj_name,
            TensorRole::AttnNorm => &self.attn_norm_name,
            TensorRole::MlpNorm => &self.ffn_norm_name,
            TensorRole::FinalNorm => &self.post_norm_name,
            TensorRole::LmHead => &self.lm_head_name,
        }
    }

    /// Every role must be bound to a non-blank fragment.
    pub fn validate(&self) -> Result<()> {
        for role in TensorRole::ALL {
            if self.get(role).trim().is_empty() {
                return Err(Gpt2Error::MissingName(role.as_str()));
            }
        }
        Ok(())
    }

    pub fn block_prefix(&self, index: usize) -> String {
        format!("{}.{}", self.blk_name, index)
    }

    /// Every tensor a checkpoint must provide for `config`, in load order.
    pub fn tensor_specs(&self, config: &Gpt2Config) -> Vec<TensorSpec> {
        let h = config.hidden_size;
        let i = config.intermediate_size;
        let mut specs = vec![
            TensorSpec::new(format!("{}.weight", self.token_embd_name), &[config.vocab_size, h]),
            TensorSpec::new(
                format!("{}.weight", self.pos_embd_name),
                &[config.max_position_embeddings, h],
            ),
        ];

        for layer in 0..config.num_hidden_layers {
            let blk = self.block_prefix(layer);
            let attn = format!("{}.{}", blk, self.attn_base_name);
            let mlp = format!("{}.{}", blk, self.ffn_base_name);

            push_affine(&mut specs, &format!("{}.{}", blk, self.attn_norm_name), &[h], &[h]);
            for proj in [&self.q_proj_name, &self.k_proj_name, &self.v_proj_name, &self.o_proj_name] {
                push_affine(&mut specs, &format!("{}.{}", attn, proj), &[h, h], &[h]);
            }
            push_affine(&mut specs, &format!("{}.{}", blk, self.ffn_norm_name), &[h], &[h]);
            push_affine(&mut specs, &format!("{}.{}", mlp, self.up_proj_name), &[i, h], &[i]);
            push_affine(&mut specs, &format!("{}.{}", mlp, self.down_proj_name), &[h, i], &[h]);
        }

        push_affine(&mut specs, &self.post_norm_name, &[h], &[h]);
        if !config.tie_word_embeddings {
            specs.push(TensorSpec::new(
                format!("{}.weight", self.lm_head_name),
                &[config.vocab_size, h],
            ));
        }
        specs
    }

    pub fn tensor_names(&self, config: &Gpt2Config) -> Vec<String> {
        self.tensor_specs(config).into_iter().map(|s| s.name).collect()
    }
}

fn push_affine(specs: &mut Vec<TensorSpec>, prefix: &str, weight: &[usize], bias: &[usize]) {
    specs.push(TensorSpec::new(format!("{}.weight", prefix), weight));
    specs.push(TensorSpec::new(format!("{}.bias", prefix), bias));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::config::ModelSize;

    #[test]
    fn test_default_table() {
        let names = Gpt2Names::default();
        assert_eq!(names.get(TensorRole::TokenEmbedding), "wte");
        assert_eq!(names.get(TensorRole::PositionEmbedding), "wpe");
        assert_eq!(names.get(TensorRole::QueryProj), "c_attn.q_proj");
        assert_eq!(names.get(TensorRole::AttnOutProj), "c_proj");
        assert_eq!(names.get(TensorRole::DownProj), "c_proj");
        assert_eq!(names.get(TensorRole::UpProj), "c_fc");
        assert_eq!(names.get(TensorRole::FinalNorm), "ln_f");
        assert_eq!(names.block_prefix(7), "h.7");
        assert!(names.validate().is_ok());
    }

    #[test]
    fn test_blank_role_rejected() {
        let names = Gpt2Names {
            ffn_norm_name: "  ".to_string(),
            ..Gpt2Names::default()
        };
        assert!(matches!(names.validate(), Err(Gpt2Error::MissingName("mlp_norm"))));
    }

    #[test]
    fn test_tensor_names_small() {
        let config = Gpt2Config::new(1024, ModelSize::Small);
        let names = config.names.tensor_names(&config);

        assert_eq!(names.len(), 2 + 12 * 16 + 2 + 1);
        assert_eq!(names[0], "wte.weight");
        assert_eq!(names[1], "wpe.weight");
        assert!(names.contains(&"h.0.ln_1.weight".to_string()));
        assert!(names.contains(&"h.0.attn.c_attn.q_proj.bias".to_string()));
        assert!(names.contains(&"h.11.attn.c_proj.weight".to_string()));
        assert!(names.contains(&"h.11.mlp.c_proj.bias".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("lm_head.weight"));
    }
}
