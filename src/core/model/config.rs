use super::names::Gpt2Names;
use crate::core::{Gpt2Error, Result};
use candle_nn::Activation;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const VOCAB_SIZE: usize = 50257;
pub const MAX_POSITION_EMBEDDINGS: usize = 1024;
pub const LAYER_NORM_EPS: f64 = 1e-5;
pub const ROPE_THETA: f32 = 10000.0;
pub const ARCH: &str = "GPT2Model";

/// The closed set of published GPT-2 sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModelSize {
    #[default]
    Small,
    Medium,
    Large,
    Xl,
}

struct PresetDims {
    hidden_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    intermediate_size: usize,
}

impl ModelSize {
    pub const ALL: [ModelSize; 4] = [ModelSize::Small, ModelSize::Medium, ModelSize::Large, ModelSize::Xl];

    pub fn label(&self) -> &'static str {
        match self {
            ModelSize::Small => "117M",
            ModelSize::Medium => "345M",
            ModelSize::Large => "762M",
            ModelSize::Xl => "1.5B",
        }
    }

    fn dims(&self) -> PresetDims {
        let (hidden_size, num_hidden_layers, num_attention_heads, intermediate_size) = match self {
            ModelSize::Small => (768, 12, 12, 3072),
            ModelSize::Medium => (1024, 24, 16, 4096),
            ModelSize::Large => (1280, 36, 20, 5120),
            ModelSize::Xl => (1600, 48, 25, 6400),
        };
        PresetDims {
            hidden_size,
            num_hidden_layers,
            num_attention_heads,
            intermediate_size,
        }
    }
}

impl FromStr for ModelSize {
    type Err = Gpt2Error;

    fn from_str(s: &str) -> Result<Self> {
        ModelSize::ALL
            .into_iter()
            .find(|size| size.label() == s)
            .ok_or_else(|| Gpt2Error::UnknownModelSize(s.to_string()))
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionEncoding {
    /// Learned absolute positions only (GPT-2).
    #[default]
    None,
    Rotary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub max_position_embeddings: usize,
    pub position_encoding: PositionEncoding,
    pub rope_theta: f32,
    pub cache_limit: usize,
    pub layer_norm_eps: f64,
    pub activation: Activation,
    pub use_cache: bool,
    pub tie_word_embeddings: bool,
    pub arch: String,
    pub names: Gpt2Names,
}

impl Gpt2Config {
    /// Hyperparameters of a published size. `token_limit` bounds each
    /// attention layer's key/value cache.
    pub fn new(token_limit: usize, size: ModelSize) -> Self {
        let dims = size.dims();
        Self {
            vocab_size: VOCAB_SIZE,
            hidden_size: dims.hidden_size,
            intermediate_size: dims.intermediate_size,
            num_attention_heads: dims.num_attention_heads,
            num_key_value_heads: dims.num_attention_heads,
            num_hidden_layers: dims.num_hidden_layers,
            max_position_embeddings: MAX_POSITION_EMBEDDINGS,
            position_encoding: PositionEncoding::None,
            rope_theta: ROPE_THETA,
            cache_limit: token_limit,
            layer_norm_eps: LAYER_NORM_EPS,
            activation: Activation::NewGelu,
            use_cache: true,
            tie_word_embeddings: false,
            arch: ARCH.to_string(),
            names: Gpt2Names::default(),
        }
    }

    /// Like [`Gpt2Config::new`] but from a size label; unknown labels are an error.
    pub fn from_label(token_limit: usize, label: &str) -> Result<Self> {
        Ok(Self::new(token_limit, label.parse()?))
    }

    /// Reads a Hugging Face `config.json` for a GPT-2 checkpoint.
    pub fn from_hf_json(json: &str, cache_limit: usize) -> Result<Self> {
        let hf: HfGpt2Config = serde_json::from_str(json)?;
        let config = Self {
            vocab_size: hf.vocab_size,
            hidden_size: hf.n_embd,
            intermediate_size: hf.n_inner.unwrap_or(4 * hf.n_embd),
            num_attention_heads: hf.n_head,
            num_key_value_heads: hf.n_head,
            num_hidden_layers: hf.n_layer,
            max_position_embeddings: hf.n_positions,
            layer_norm_eps: hf.layer_norm_epsilon,
            activation: parse_activation(&hf.activation_function)?,
            tie_word_embeddings: hf.tie_word_embeddings,
            cache_limit,
            ..Self::new(cache_limit, ModelSize::Small)
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_hf_file<P: AsRef<Path>>(path: P, cache_limit: usize) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_hf_json(&json, cache_limit)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("max_position_embeddings", self.max_position_embeddings),
            ("cache_limit", self.cache_limit),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Gpt2Error::InvalidConfig(format!("{} must be greater than zero", name)));
            }
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Gpt2Error::InvalidConfig(format!(
                "num_attention_heads ({}) must divide hidden_size ({})",
                self.num_attention_heads, self.hidden_size
            )));
        }
        if self.num_key_value_heads != self.num_attention_heads {
            return Err(Gpt2Error::InvalidConfig(format!(
                "num_key_value_heads ({}) must equal num_attention_heads ({})",
                self.num_key_value_heads, self.num_attention_heads
            )));
        }
        if self.position_encoding == PositionEncoding::Rotary && self.head_dim() % 2 != 0 {
            return Err(Gpt2Error::InvalidConfig(format!(
                "rotary encoding needs an even head_dim, got {}",
                self.head_dim()
            )));
        }
        self.names.validate()
    }

    /// Total learned parameters, tied head counted once.
    pub fn parameter_count(&self) -> u64 {
        self.names
            .tensor_specs(self)
            .iter()
            .map(|spec| spec.numel() as u64)
            .sum()
    }

    pub fn builder() -> Gpt2ConfigBuilder {
        Gpt2ConfigBuilder::new()
    }
}

impl Default for Gpt2Config {
    fn default() -> Self {
        Self::new(MAX_POSITION_EMBEDDINGS, ModelSize::default())
    }
}

fn parse_activation(name: &str) -> Result<Activation> {
    match name {
        "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Activation::NewGelu),
        "gelu" => Ok(Activation::Gelu),
        "relu" => Ok(Activation::Relu),
        "silu" | "swish" => Ok(Activation::Silu),
        other => Err(Gpt2Error::InvalidConfig(format!("unsupported activation_function {:?}", other))),
    }
}

#[derive(Debug, Deserialize)]
struct HfGpt2Config {
    vocab_size: usize,
    n_embd: usize,
    n_layer: usize,
    n_head: usize,
    n_positions: usize,
    #[serde(default)]
    n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    layer_norm_epsilon: f64,
    #[serde(default = "default_activation_function")]
    activation_function: String,
    #[serde(default = "default_tie_word_embeddings")]
    tie_word_embeddings: bool,
}

fn default_layer_norm_epsilon() -> f64 {
    LAYER_NORM_EPS
}

fn default_activation_function() -> String {
    "gelu_new".to_string()
}

fn default_tie_word_embeddings() -> bool {
    true
}

pub struct Gpt2ConfigBuilder {
    config: Gpt2Config,
}

impl Gpt2ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Gpt2Config::default(),
        }
    }

    pub fn preset(mut self, size: ModelSize) -> Self {
        let cache_limit = self.config.cache_limit;
        self.config = Gpt2Config {
            names: self.config.names,
            ..Gpt2Config::new(cache_limit, size)
        };
        self
    }

    pub fn vocab_size(mut self, size: usize) -> Self {
        self.config.vocab_size = size;
        self
    }

    pub fn hidden_size(mut self, size: usize) -> Self {
        self.config.hidden_size = size;
        self
    }

    pub fn intermediate_size(mut self, size: usize) -> Self {
        self.config.intermediate_size = size;
        self
    }

    pub fn num_layers(mut self, n: usize) -> Self {
        self.config.num_hidden_layers = n;
        self
    }

    /// Sets both query and key/value head counts.
    pub fn num_heads(mut self, n: usize) -> Self {
        self.config.num_attention_heads = n;
        self.config.num_key_value_heads = n;
        self
    }

    pub fn max_positions(mut self, n: usize) -> Self {
        self.config.max_position_embeddings = n;
        self
    }

    pub fn cache_limit(mut self, n: usize) -> Self {
        self.config.cache_limit = n;
        self
    }

    pub fn rotary(mut self, theta: f32) -> Self {
        self.config.position_encoding = PositionEncoding::Rotary;
        self.config.rope_theta = theta;
        self
    }

    pub fn norm_eps(mut self, eps: f64) -> Self {
        self.config.layer_norm_eps = eps;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.config.activation = activation;
        self
    }

    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.config.use_cache = enabled;
        self
    }

    pub fn tie_word_embeddings(mut self, tied: bool) -> Self {
        self.config.tie_word_embeddings = tied;
        self
    }

    pub fn names(mut self, names: Gpt2Names) -> Self {
        self.config.names = names;
        self
    }

    pub fn build(self) -> Result<Gpt2Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for Gpt2ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_match_table() {
        let expected = [
            ("117M", 768, 12, 12, 3072),
            ("345M", 1024, 24, 16, 4096),
            ("762M", 1280, 36, 20, 5120),
            ("1.5B", 1600, 48, 25, 6400),
        ];
        for (label, hidden, layers, heads, inter) in expected {
            let config = Gpt2Config::from_label(512, label).unwrap();
            assert_eq!(config.hidden_size, hidden, "{}", label);
            assert_eq!(config.num_hidden_layers, layers, "{}", label);
            assert_eq!(config.num_attention_heads, heads, "{}", label);
            assert_eq!(config.num_key_value_heads, heads, "{}", label);
            assert_eq!(config.intermediate_size, inter, "{}", label);
            assert_eq!(config.vocab_size, 50257);
            assert_eq!(config.max_position_embeddings, 1024);
            assert_eq!(config.cache_limit, 512);
            assert_eq!(config.hidden_size % config.num_attention_heads, 0);
            assert_eq!(config.position_encoding, PositionEncoding::None);
            assert_eq!(config.arch, "GPT2Model");
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_unknown_label_rejected() {
        let err = Gpt2Config::from_label(1024, "2.7B").unwrap_err();
        assert!(matches!(err, Gpt2Error::UnknownModelSize(ref l) if l == "2.7B"));
        assert!("117m".parse::<ModelSize>().is_err());
        assert_eq!(ModelSize::default().label(), "117M");
    }

    #[test]
    fn test_heads_must_divide_hidden() {
        let err = Gpt2Config::builder().hidden_size(10).num_heads(3).build().unwrap_err();
        assert!(matches!(err, Gpt2Error::InvalidConfig(_)));
    }

    #[test]
    fn test_parameter_count_small() {
        let tied = Gpt2Config::builder().tie_word_embeddings(true).build().unwrap();
        assert_eq!(tied.parameter_count(), 124_439_808);

        let untied = Gpt2Config::new(1024, ModelSize::Small);
        assert_eq!(untied.parameter_count(), 124_439_808 + 50257 * 768);
    }

    #[test]
    fn test_config_builder() {
        let config = Gpt2Config::builder()
            .vocab_size(32)
            .hidden_size(16)
            .intermediate_size(64)
            .num_layers(2)
            .num_heads(4)
            .max_positions(8)
            .cache_limit(8)
            .build()
            .unwrap();

        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.num_key_value_heads, 4);
        assert_eq!(config.layer_norm_eps, 1e-5);
    }

    #[test]
    fn test_hf_json() {
        let json = r#"{
            "activation_function": "gelu_new",
            "n_embd": 768,
            "n_head": 12,
            "n_layer": 12,
            "n_positions": 1024,
            "n_ctx": 1024,
            "layer_norm_epsilon": 1e-05,
            "vocab_size": 50257
        }"#;
        let config = Gpt2Config::from_hf_json(json, 256).unwrap();
        assert_eq!(config.intermediate_size, 3072);
        assert_eq!(config.cache_limit, 256);
        assert!(config.tie_word_embeddings);
        assert_eq!(config.activation, Activation::NewGelu);
    }
}
