// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transformer configuration and `HuggingFace` `config.json` parsing.
//!
//! The built-in backend covers the `LLaMA` family of decoders: RMS norm,
//! `SwiGLU` MLP, rotary embeddings and grouped-query attention. Families
//! differ only in a handful of defaults (norm epsilon, QKV bias, `RoPE`
//! base, context length, sliding window), collected per family in
//! [`FamilyDefaults`].
//!
//! ```
//! use candle_tuned_lens::TransformerConfig;
//!
//! let json = serde_json::json!({"model_type": "llama", "hidden_size": 2048,
//!     "num_hidden_layers": 16, "num_attention_heads": 32,
//!     "num_key_value_heads": 8, "intermediate_size": 8192,
//!     "vocab_size": 32000});
//! let config = TransformerConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_layers, 16);
//! assert_eq!(config.head_dim, 64);
//! ```

use serde_json::Value;

use crate::error::{LensError, Result};

/// Configuration for a `LLaMA`-family decoder-only transformer.
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of decoder blocks.
    pub num_layers: usize,
    /// Number of query heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA when < `num_attention_heads`).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// MLP intermediate dimension.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// RMS norm epsilon.
    pub norm_eps: f64,
    /// Whether Q, K, V projections carry a bias (Qwen2).
    pub qkv_bias: bool,
    /// Whether the LM head shares weights with the token embedding.
    pub tie_word_embeddings: bool,
    /// `RoPE` base frequency.
    pub rope_theta: f64,
    /// Maximum sequence length for the `RoPE` cache.
    pub max_position_embeddings: usize,
    /// Sliding attention window (Mistral); `None` for global attention.
    pub sliding_window: Option<usize>,
}

/// Per-family defaults for fields a `config.json` may omit.
struct FamilyDefaults {
    norm_eps: f64,
    qkv_bias: bool,
    rope_theta: f64,
    max_position_embeddings: usize,
    reads_sliding_window: bool,
}

impl FamilyDefaults {
    fn for_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "llama" => Some(Self {
                norm_eps: 1e-5,
                qkv_bias: false,
                rope_theta: 10_000.0,
                max_position_embeddings: 4096,
                reads_sliding_window: false,
            }),
            "qwen2" => Some(Self {
                norm_eps: 1e-6,
                qkv_bias: true,
                rope_theta: 1_000_000.0,
                max_position_embeddings: 32_768,
                reads_sliding_window: false,
            }),
            "mistral" => Some(Self {
                norm_eps: 1e-5,
                qkv_bias: false,
                rope_theta: 10_000.0,
                max_position_embeddings: 32_768,
                reads_sliding_window: true,
            }),
            _ => None,
        }
    }
}

impl TransformerConfig {
    /// Parse a [`TransformerConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `model_type` is missing or
    /// unsupported, or if a required dimension is absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| LensError::Config("missing 'model_type' field".into()))?;
        let defaults = FamilyDefaults::for_model_type(model_type)
            .ok_or_else(|| LensError::Config(format!("unsupported model_type: '{model_type}'")))?;

        let hidden_size = get_usize(config, "hidden_size")?;
        let num_attention_heads = get_usize(config, "num_attention_heads")?;
        let num_kv_heads = get_usize_or(config, "num_key_value_heads", num_attention_heads);
        if num_kv_heads == 0 || num_attention_heads % num_kv_heads != 0 {
            return Err(LensError::Config(format!(
                "num_attention_heads ({num_attention_heads}) is not a multiple of \
                 num_key_value_heads ({num_kv_heads})"
            )));
        }

        let sliding_window = if defaults.reads_sliding_window {
            config
                .get("sliding_window")
                .and_then(Value::as_u64)
                .and_then(|v| usize::try_from(v).ok())
        } else {
            None
        };

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            num_attention_heads,
            num_kv_heads,
            head_dim: get_head_dim(config, hidden_size, num_attention_heads)?,
            intermediate_size: get_usize(config, "intermediate_size")?,
            vocab_size: get_usize(config, "vocab_size")?,
            norm_eps: get_f64_or(config, "rms_norm_eps", defaults.norm_eps),
            qkv_bias: get_bool_or(config, "attention_bias", defaults.qkv_bias),
            tie_word_embeddings: get_bool_or(config, "tie_word_embeddings", false),
            rope_theta: get_f64_or(config, "rope_theta", defaults.rope_theta),
            max_position_embeddings: get_usize_or(
                config,
                "max_position_embeddings",
                defaults.max_position_embeddings,
            ),
            sliding_window,
        })
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| LensError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| LensError::Config(format!("field '{key}' value {val} overflows usize")))
}

fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Explicit `head_dim` wins over `hidden_size / num_attention_heads`.
fn get_head_dim(config: &Value, hidden_size: usize, num_attention_heads: usize) -> Result<usize> {
    if let Some(hd) = config.get("head_dim").and_then(Value::as_u64) {
        return usize::try_from(hd).map_err(|_| LensError::Config("head_dim overflows usize".into()));
    }
    if num_attention_heads == 0 {
        return Err(LensError::Config(
            "num_attention_heads is 0, cannot compute head_dim".into(),
        ));
    }
    Ok(hidden_size / num_attention_heads)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_json(model_type: &str) -> Value {
        serde_json::json!({
            "model_type": model_type,
            "hidden_size": 896,
            "num_hidden_layers": 24,
            "num_attention_heads": 14,
            "num_key_value_heads": 2,
            "intermediate_size": 4864,
            "vocab_size": 151936
        })
    }

    #[test]
    fn parse_llama_defaults() {
        let config = TransformerConfig::from_hf_config(&base_json("llama")).unwrap();
        assert_eq!(config.num_layers, 24);
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.num_kv_heads, 2);
        assert!(!config.qkv_bias);
        assert!(!config.tie_word_embeddings);
        assert!((config.rope_theta - 10_000.0).abs() < f64::EPSILON);
        assert!(config.sliding_window.is_none());
    }

    #[test]
    fn parse_qwen2_has_qkv_bias() {
        let mut json = base_json("qwen2");
        json["tie_word_embeddings"] = Value::Bool(true);
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert!(config.qkv_bias);
        assert!(config.tie_word_embeddings);
        assert!((config.norm_eps - 1e-6).abs() < f64::EPSILON);
    }

    #[test]
    fn sliding_window_only_for_mistral() {
        let mut json = base_json("mistral");
        json["sliding_window"] = serde_json::json!(4096);
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.sliding_window, Some(4096));

        json["model_type"] = serde_json::json!("llama");
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert!(config.sliding_window.is_none());
    }

    #[test]
    fn explicit_head_dim_wins() {
        let mut json = base_json("llama");
        json["head_dim"] = serde_json::json!(128);
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.head_dim, 128);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(TransformerConfig::from_hf_config(&serde_json::json!({"hidden_size": 8})).is_err());
        assert!(TransformerConfig::from_hf_config(&base_json("bert")).is_err());

        let mut json = base_json("llama");
        json["num_key_value_heads"] = serde_json::json!(3);
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }
}
