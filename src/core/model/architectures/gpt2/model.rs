use super::block::Gpt2Block;
use crate::core::cache::{CacheSet, PositionCursor};
use crate::core::model::config::Gpt2Config;
use crate::core::model::layers::PositionEmbedding;
use crate::core::model::{Forward, ModelMeta};
use crate::core::{Gpt2Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, layer_norm, linear_no_bias, Embedding, LayerNorm, Linear, Module, VarBuilder};
use candle_transformers::generation::LogitsProcessor;
use std::sync::Arc;

/// GPT-2 decoder stack from token ids to vocabulary logits.
///
/// Attention layers keep key/value history between `forward` calls, so one
/// instance serves one generation session at a time. Call
/// [`Gpt2Model::clear_kv_cache`] before starting an unrelated sequence;
/// sharing an instance between concurrent sessions is not supported.
pub struct Gpt2Model {
    config: Gpt2Config,
    meta: ModelMeta,
    device: Device,
    token_embedding: Embedding,
    pos_embedding: PositionEmbedding,
    blocks: Vec<Gpt2Block>,
    norm: LayerNorm,
    lm_head: Linear,
    position: Arc<PositionCursor>,
    caches: CacheSet,
}

impl Gpt2Model {
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let names = &config.names;
        let hidden = config.hidden_size;
        let device = vb.device().clone();

        let token_embedding = embedding(config.vocab_size, hidden, vb.pp(&names.token_embd_name))?;
        let pos_embedding = PositionEmbedding::new(
            config.max_position_embeddings,
            hidden,
            vb.pp(&names.pos_embd_name),
        )?;

        let vb_blocks = vb.pp(&names.blk_name);
        let blocks = (0..config.num_hidden_layers)
            .map(|i| Gpt2Block::new(i, config, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let norm = layer_norm(hidden, config.layer_norm_eps, vb.pp(&names.post_norm_name))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(token_embedding.embeddings().clone(), None)
        } else {
            linear_no_bias(hidden, config.vocab_size, vb.pp(&names.lm_head_name))?
        };

        let position = Arc::new(PositionCursor::new("position", config.max_position_embeddings));
        let mut caches = CacheSet::new();
        for block in &blocks {
            caches.extend(block.attention().cache_handles());
        }
        if config.use_cache {
            caches.push(position.clone());
        }

        let meta = ModelMeta::from_config("gpt2", config);
        tracing::debug!(
            layers = blocks.len(),
            hidden,
            parameters = meta.parameter_count,
            cache_handles = caches.len(),
            "built GPT-2 model"
        );

        Ok(Self {
            config: config.clone(),
            meta,
            device,
            token_embedding,
            pos_embedding,
            blocks,
            norm,
            lm_head,
            position,
            caches,
        })
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn blocks(&self) -> &[Gpt2Block] {
        &self.blocks
    }

    pub fn position_embedding(&self) -> &PositionEmbedding {
        &self.pos_embedding
    }

    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    /// Positions consumed by the current session; 0 when caching is off.
    pub fn seqlen_offset(&self) -> Result<usize> {
        self.caches.consumed_positions()
    }

    /// Drops every key/value cache, rotary table and the position cursor.
    /// Weights and hyperparameters are untouched.
    pub fn clear_kv_cache(&self) {
        self.caches.clear_all();
        tracing::trace!(handles = self.caches.len(), "cleared model caches");
    }

    /// Token plus positional embeddings for `input_ids` of shape `(batch, seq)`.
    fn embed(&self, input_ids: &Tensor) -> Result<(Tensor, usize)> {
        let seq_len = match *input_ids.dims() {
            [_, seq_len] if seq_len > 0 => seq_len,
            _ => {
                return Err(Gpt2Error::ShapeMismatch {
                    what: "input ids".to_string(),
                    expected: "(batch, seq) with seq > 0".to_string(),
                    actual: input_ids.dims().to_vec(),
                })
            }
        };
        let offset = self.seqlen_offset()?;
        let positions = self.pos_embedding.clip(offset, seq_len)?;
        let tokens = self.token_embedding.forward(input_ids)?;
        tracing::trace!(offset, seq_len, "embedding input");
        Ok((tokens.broadcast_add(&positions)?, seq_len))
    }

    fn commit(&self, seq_len: usize) {
        if self.config.use_cache {
            self.position.advance(seq_len);
        }
    }

    /// The embedding sum followed by every block's output, in block order.
    /// Advances the caches like [`Forward::forward`].
    pub fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<Vec<Tensor>> {
        let (mut xs, seq_len) = self.embed(input_ids)?;
        let mut states = Vec::with_capacity(self.blocks.len() + 1);
        states.push(xs.clone());
        for block in &self.blocks {
            xs = block.forward(&xs)?;
            states.push(xs.clone());
        }
        self.commit(seq_len);
        Ok(states)
    }
}

impl Forward for Gpt2Model {
    /// `(batch, seq)` token ids to `(batch, seq, vocab)` logits.
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (mut xs, seq_len) = self.embed(input_ids)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        self.commit(seq_len);
        let xs = self.norm.forward(&xs)?;
        Ok(self.lm_head.forward(&xs)?)
    }
}

/// [`Gpt2Model`] plus autoregressive generation.
pub struct Gpt2ForCausalLM {
    model: Gpt2Model,
}

impl Gpt2ForCausalLM {
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            model: Gpt2Model::new(config, vb)?,
        })
    }

    pub fn model(&self) -> &Gpt2Model {
        &self.model
    }

    pub fn clear_kv_cache(&self) {
        self.model.clear_kv_cache();
    }

    /// Logits of the last input position, `(batch, vocab)`.
    pub fn next_token_logits(&self, input_ids: &Tensor) -> Result<Tensor> {
        let logits = self.model.forward(input_ids)?;
        let seq_len = logits.dim(1)?;
        Ok(logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?)
    }

    /// Starts a fresh session from `prompt` and samples up to
    /// `max_new_tokens` ids, stopping early after `eos`.
    pub fn generate(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        sampler: &mut LogitsProcessor,
        eos: Option<u32>,
    ) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            return Err(Gpt2Error::EmptyPrompt);
        }
        self.clear_kv_cache();

        let incremental = self.model.config().use_cache;
        let mut tokens = prompt.to_vec();
        let mut generated = Vec::with_capacity(max_new_tokens);
        for step in 0..max_new_tokens {
            let context = if incremental && step > 0 {
                &tokens[tokens.len() - 1..]
            } else {
                &tokens[..]
            };
            let input = Tensor::new(context, self.model.device())?.unsqueeze(0)?;
            let logits = self
                .next_token_logits(&input)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            let next = sampler.sample(&logits)?;
            tracing::trace!(step, token = next, "sampled token");

            tokens.push(next);
            generated.push(next);
            if eos == Some(next) {
                break;
            }
        }
        Ok(generated)
    }
}
