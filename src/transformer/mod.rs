// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in `LLaMA`-family transformer backend.
//!
//! One forward pass covers `LLaMA`, `Qwen2` and Mistral checkpoints,
//! parameterized by [`TransformerConfig`](crate::config::TransformerConfig).
//! Residual-stream hook points are `hook_embed`,
//! `blocks.{i}.hook_resid_post` and `hook_final_norm`.

pub(crate) mod attention;
pub(crate) mod mlp;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};

use crate::backend::ModelBackend;
use crate::config::TransformerConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::lens::Unembed;

use self::attention::{Attention, RopeCache};
use self::mlp::Mlp;

/// A single pre-norm decoder layer.
struct DecoderLayer {
    input_norm: RmsNorm,
    attention: Attention,
    post_attention_norm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            input_norm: candle_nn::rms_norm(
                config.hidden_size,
                config.norm_eps,
                vb.pp("input_layernorm"),
            )?,
            attention: Attention::load(config, vb.pp("self_attn"))?,
            post_attention_norm: candle_nn::rms_norm(
                config.hidden_size,
                config.norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, hidden: &Tensor, mask: &Tensor, rope: &RopeCache) -> Result<Tensor> {
        let attn = self
            .attention
            .forward(&self.input_norm.forward(hidden)?, mask, rope)?;
        let hidden = (hidden + attn)?;
        let mlp = self.mlp.forward(&self.post_attention_norm.forward(&hidden)?)?;
        Ok((hidden + mlp)?)
    }
}

/// Config-driven decoder-only transformer.
pub struct GenericTransformer {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    final_norm: RmsNorm,
    /// Final norm weight, kept for [`Unembed`] export.
    final_norm_weight: Tensor,
    /// `None` when tied to `embed_tokens`.
    lm_head: Option<Linear>,
    rope_cache: RopeCache,
    config: TransformerConfig,
}

impl GenericTransformer {
    /// Load all weights and pre-compute the `RoPE` cache.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if weight
    /// loading fails or dimensions are inconsistent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let vb_model = vb.pp("model");

        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let layers = (0..config.num_layers)
            .map(|i| DecoderLayer::load(&config, vb_model.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let final_norm =
            candle_nn::rms_norm(config.hidden_size, config.norm_eps, vb_model.pp("norm"))?;
        let final_norm_weight = final_norm.clone().into_inner().weight().clone();

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rope_cache = RopeCache::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
            final_norm_weight,
            lm_head,
            rope_cache,
            config,
        })
    }

    /// The model configuration.
    #[must_use]
    pub const fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// The `[vocab, hidden]` unembedding matrix.
    fn unembedding_weight(&self) -> &Tensor {
        self.lm_head
            .as_ref()
            .map_or_else(|| self.embed_tokens.embeddings(), Linear::weight)
    }

    /// Causal mask, banded when the config sets a sliding window.
    ///
    /// # Shapes
    /// - returns: `[1, 1, seq_len, seq_len]`
    fn causal_mask(&self, seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let window = self.config.sliding_window;
        let data: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..seq_len).map(move |j| {
                    let outside_window = window.is_some_and(|w| i.saturating_sub(j) > w);
                    if j > i || outside_window {
                        f32::NEG_INFINITY
                    } else {
                        0.0
                    }
                })
            })
            .collect();
        Ok(Tensor::from_vec(data, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
    }
}

impl ModelBackend for GenericTransformer {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let mut hidden = self.embed_tokens.forward(input_ids)?;
        let (_, seq_len, _) = hidden.dims3()?;

        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, hidden.device())?);
        if hooks.is_captured(&HookPoint::Embed) {
            cache.store(HookPoint::Embed, hidden.clone());
        }

        let mask = self.causal_mask(seq_len, hidden.device(), hidden.dtype())?;
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &mask, &self.rope_cache)?;
            if hooks.is_captured(&HookPoint::ResidPost(layer_idx)) {
                cache.store(HookPoint::ResidPost(layer_idx), hidden.clone());
            }
        }

        hidden = self.final_norm.forward(&hidden)?;
        if hooks.is_captured(&HookPoint::FinalNorm) {
            cache.store(HookPoint::FinalNorm, hidden.clone());
        }

        cache.set_output(hidden.broadcast_matmul(&self.unembedding_weight().t()?)?);
        Ok(cache)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.final_norm.forward(hidden)?;
        Ok(normed.broadcast_matmul(&self.unembedding_weight().t()?)?)
    }

    fn unembed(&self) -> Result<Unembed> {
        Ok(Unembed::new(
            Some(self.final_norm_weight.clone()),
            self.config.norm_eps,
            self.unembedding_weight().clone(),
        ))
    }
}
