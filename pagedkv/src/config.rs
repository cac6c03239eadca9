//! Attention configuration.
//!
//! [`ModelAttentionConfig`] is parsed from a model's `config.json` and
//! resolved once, at load time, into [`LayerCapabilities`]. The engine is
//! written once against that capability set instead of per-model variants.

use std::path::Path;

use serde::Deserialize;

use crate::dtype::DType;
use crate::window::SlidingWindow;
use crate::{Error, Result};

/// Query/key/value head arrangement for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadLayout {
    pub num_q_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl HeadLayout {
    /// Build a validated head layout.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if any count is zero or the query
    /// heads cannot be split evenly across the key/value heads.
    pub fn new(num_q_heads: usize, num_kv_heads: usize, head_dim: usize) -> Result<Self> {
        if num_q_heads == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "head layout must be non-zero, got q={num_q_heads} kv={num_kv_heads} dim={head_dim}"
            )));
        }
        if num_q_heads % num_kv_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "{num_q_heads} query heads cannot be grouped over {num_kv_heads} kv heads"
            )));
        }
        Ok(Self {
            num_q_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Number of query heads sharing each key/value head.
    #[must_use]
    pub fn gqa_ratio(&self) -> usize {
        self.num_q_heads / self.num_kv_heads
    }

    /// Key/value head read by query head `q_head`.
    #[must_use]
    pub fn kv_head_for(&self, q_head: usize) -> usize {
        q_head / self.gqa_ratio()
    }

    /// Elements per token in a query row.
    #[must_use]
    pub fn q_width(&self) -> usize {
        self.num_q_heads * self.head_dim
    }

    /// Elements per token in a key or value row.
    #[must_use]
    pub fn kv_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Softmax temperature `1/sqrt(head_dim)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }
}

/// Normalisation flavour of the surrounding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    RmsNorm,
    LayerNorm,
}

/// Feed-forward activation of the surrounding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Silu,
    GeluTanh,
    Gelu,
}

impl ActivationKind {
    /// Map an HF `hidden_act` string.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for unknown activations.
    pub fn from_hidden_act(name: &str) -> Result<Self> {
        match name {
            "silu" | "swiglu" => Ok(Self::Silu),
            "gelu_pytorch_tanh" | "gelu_new" | "gelu_fast" => Ok(Self::GeluTanh),
            "gelu" => Ok(Self::Gelu),
            other => Err(Error::InvalidConfig(format!(
                "unsupported hidden_act: {other}"
            ))),
        }
    }
}

/// Capability set a model family is reduced to at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerCapabilities {
    pub norm_kind: NormKind,
    pub activation_kind: ActivationKind,
    pub sliding_window: SlidingWindow,
    pub head_layout: HeadLayout,
}

impl LayerCapabilities {
    #[must_use]
    pub fn uses_sliding_window(&self) -> bool {
        self.sliding_window.is_bounded()
    }
}

/// Model families whose layers use LayerNorm (with bias) instead of RMSNorm.
const LAYER_NORM_MODELS: &[&str] = &["starcoder2", "bloom", "gpt2", "gpt_bigcode", "phi"];

/// Attention-relevant subset of a HuggingFace `config.json`.
///
/// Multimodal wrappers that nest the language model under `text_config` are
/// unwrapped by [`ModelAttentionConfig::from_json`].
#[derive(Debug, Clone, Deserialize)]
pub struct ModelAttentionConfig {
    /// Architecture tag (e.g. `"mistral"`, `"starcoder2"`)
    #[serde(default)]
    pub model_type: String,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA, defaults to `num_attention_heads`)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Explicit head dimension (defaults to `hidden_size / num_attention_heads`)
    #[serde(default)]
    pub head_dim: Option<usize>,

    /// Sliding window size; `null` or absent means unbounded
    #[serde(default)]
    pub sliding_window: Option<usize>,

    /// Qwen2-style switch; `false` ignores a configured `sliding_window`
    #[serde(default)]
    pub use_sliding_window: Option<bool>,

    /// FFN activation name
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,

    /// Checkpoint precision, used as the default cache precision
    #[serde(default)]
    pub torch_dtype: Option<String>,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

impl ModelAttentionConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON text, unwrapping `text_config` if present.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or misses required keys.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        if let Some(text) = value.get_mut("text_config") {
            let text = text.take();
            return Ok(serde_json::from_value(text)?);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Get the number of key-value heads (for grouped-query attention)
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get the head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Effective sliding window after applying `use_sliding_window`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for a zero-sized window.
    pub fn window(&self) -> Result<SlidingWindow> {
        if self.use_sliding_window == Some(false) {
            return Ok(SlidingWindow::Unbounded);
        }
        SlidingWindow::new(self.sliding_window)
    }

    /// Precision named by `torch_dtype`, `f32` when absent.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedDtype`] for unrecognised names.
    pub fn dtype(&self) -> Result<DType> {
        match &self.torch_dtype {
            None => Ok(DType::F32),
            Some(name) => DType::from_torch_dtype(name)
                .ok_or_else(|| Error::UnsupportedDtype(name.clone())),
        }
    }

    /// Resolve the capability set the attention engine runs against.
    ///
    /// # Errors
    /// Returns an error if the head layout, window or activation is invalid.
    pub fn capabilities(&self) -> Result<LayerCapabilities> {
        let norm_kind = if LAYER_NORM_MODELS.contains(&self.model_type.as_str()) {
            NormKind::LayerNorm
        } else {
            NormKind::RmsNorm
        };
        Ok(LayerCapabilities {
            norm_kind,
            activation_kind: ActivationKind::from_hidden_act(&self.hidden_act)?,
            sliding_window: self.window()?,
            head_layout: HeadLayout::new(
                self.num_attention_heads,
                self.num_kv_heads(),
                self.head_dim(),
            )?,
        })
    }

    /// Cache sizing for this model with the given token ceiling.
    ///
    /// # Errors
    /// Returns an error if `torch_dtype` is unrecognised.
    pub fn cache_config(&self, max_total_tokens: usize) -> Result<CacheConfig> {
        Ok(CacheConfig {
            num_layers: self.num_hidden_layers,
            max_total_tokens,
            dtype: self.dtype()?,
        })
    }
}

/// Sizing of the shared KV cache store.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Number of transformer layers, one buffer each.
    pub num_layers: usize,
    /// Total token slots across all requests; a hard ceiling.
    pub max_total_tokens: usize,
    /// Storage precision of cached keys and values.
    pub dtype: DType,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_layers: 1,
            max_total_tokens: 4096,
            dtype: DType::F32,
        }
    }
}

/// Decode attention implementation, chosen once when the engine is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeStrategy {
    /// Packed score matrix, then a fused softmax/value-reduce pass.
    #[default]
    TwoStage,
    /// Split the visible range into partitions reduced independently and
    /// merged by log-sum-exp weighting.
    SplitKv { partition_size: usize },
}

/// Engine-level configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub decode_strategy: DecodeStrategy,
}
