use super::positional::RotaryTables;
use crate::core::cache::{CacheHandle, LayerKvCache, ResettableCache};
use crate::core::model::config::{Gpt2Config, PositionEncoding};
use crate::core::model::names::Gpt2Names;
use crate::core::{Gpt2Error, Result};
use candle_core::{Device, Tensor};
use candle_nn::{linear, linear_no_bias, Linear, Module, VarBuilder};
use std::sync::Arc;

/// Shape and behaviour of one causal self-attention layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub position_encoding: PositionEncoding,
    pub rope_theta: f32,
    pub max_positions: usize,
    pub cache_limit: usize,
    pub bias: bool,
    pub use_cache: bool,
}

impl AttentionConfig {
    pub fn from_model(config: &Gpt2Config) -> Self {
        Self {
            hidden_size: config.hidden_size,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim(),
            position_encoding: config.position_encoding,
            rope_theta: config.rope_theta,
            max_positions: config.max_position_embeddings,
            cache_limit: config.cache_limit,
            bias: true,
            use_cache: config.use_cache,
        }
    }
}

/// Multi-head causal self-attention with an optional key/value cache.
///
/// Key/value history persists across `forward` calls until the cache
/// handles are cleared, so consecutive calls continue one sequence.
pub struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    kv_cache: Option<Arc<LayerKvCache>>,
    rotary: Option<Arc<RotaryTables>>,
}

impl CausalSelfAttention {
    /// `vb` must already point at the attention prefix (e.g. `h.3.attn`);
    /// `label` names the cache handles.
    pub fn new(cfg: &AttentionConfig, names: &Gpt2Names, vb: VarBuilder, label: &str) -> Result<Self> {
        if cfg.num_kv_heads != cfg.num_heads {
            return Err(Gpt2Error::InvalidConfig(format!(
                "{}: grouped key/value heads are not supported ({} vs {})",
                label, cfg.num_kv_heads, cfg.num_heads
            )));
        }
        let inner = cfg.num_heads * cfg.head_dim;
        let proj = |in_dim: usize, out_dim: usize, name: &str| -> Result<Linear> {
            let layer = if cfg.bias {
                linear(in_dim, out_dim, vb.pp(name))?
            } else {
                linear_no_bias(in_dim, out_dim, vb.pp(name))?
            };
            Ok(layer)
        };

        let kv_cache = cfg
            .use_cache
            .then(|| Arc::new(LayerKvCache::new(format!("{}.kv", label), cfg.cache_limit)));
        let rotary = (cfg.position_encoding == PositionEncoding::Rotary).then(|| {
            Arc::new(RotaryTables::new(
                format!("{}.rope", label),
                cfg.head_dim,
                cfg.rope_theta,
                cfg.max_positions,
            ))
        });

        Ok(Self {
            q_proj: proj(cfg.hidden_size, inner, &names.q_proj_name)?,
            k_proj: proj(cfg.hidden_size, inner, &names.k_proj_name)?,
            v_proj: proj(cfg.hidden_size, inner, &names.v_proj_name)?,
            o_proj: proj(inner, cfg.hidden_size, &names.o_proj_name)?,
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim,
            scale: 1.0 / (cfg.head_dim as f64).sqrt(),
            kv_cache,
            rotary,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Cache and rotary handles owned by this layer, for the model's reset list.
    pub fn cache_handles(&self) -> Vec<CacheHandle> {
        let mut handles: Vec<CacheHandle> = Vec::new();
        if let Some(cache) = &self.kv_cache {
            handles.push(cache.clone());
        }
        if let Some(rotary) = &self.rotary {
            handles.push(rotary.clone());
        }
        handles
    }

    /// `query`, `key` and `value` are `(batch, seq, hidden)` and share the
    /// sequence length; the output has the query's shape.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let (b, t, _) = query.dims3()?;
        for (what, xs) in [("attention key", key), ("attention value", value)] {
            if xs.dims() != query.dims() {
                return Err(Gpt2Error::ShapeMismatch {
                    what: what.to_string(),
                    expected: format!("{:?}", query.dims()),
                    actual: xs.dims().to_vec(),
                });
            }
        }

        let q = self.split_heads(&self.q_proj.forward(query)?, b, t)?;
        let k = self.split_heads(&self.k_proj.forward(key)?, b, t)?;
        let v = self.split_heads(&self.v_proj.forward(value)?, b, t)?;

        let past = self.kv_cache.as_ref().map(|c| c.len()).unwrap_or(0);
        let (q, k) = match &self.rotary {
            Some(rotary) => {
                let (cos, sin) = rotary.slice(past, t, q.device(), q.dtype())?;
                (
                    candle_nn::rotary_emb::rope(&q, &cos, &sin)?,
                    candle_nn::rotary_emb::rope(&k, &cos, &sin)?,
                )
            }
            None => (q, k),
        };

        let (k, v) = match &self.kv_cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };
        let total = k.dim(2)?;

        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let mask = causal_mask(t, total, q.device())?.to_dtype(scores.dtype())?;
        let scores = scores.broadcast_add(&mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = probs
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }

    fn split_heads(&self, xs: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        Ok(xs
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

/// Additive mask for `seq_len` new queries attending over `total` keys, the
/// last `seq_len` of which are the queries themselves.
pub fn causal_mask(seq_len: usize, total: usize, device: &Device) -> Result<Tensor> {
    let Some(past) = total.checked_sub(seq_len) else {
        return Err(Gpt2Error::ShapeMismatch {
            what: "causal mask".to_string(),
            expected: format!("at least {} keys", seq_len),
            actual: vec![seq_len, total],
        });
    };
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > past + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, total), device)?)
}
