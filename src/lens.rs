// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tuned lens: per-layer affine translators plus a shared unembedding.
//!
//! A tuned lens decodes the hidden state entering layer `i` as
//! `unembed(h + A_i h + b_i)`. With every translator at zero it reduces to
//! the plain logit lens, `unembed(h)`, which the evaluation loop uses as
//! its baseline via [`TunedLens::to_logits`].
//!
//! # On-disk layout
//!
//! A lens directory holds `config.json` ([`LensConfig`]) and
//! `params.safetensors` with tensors
//! `layer_translators.{i}.weight`, `layer_translators.{i}.bias`,
//! `unembed.weight` and, when the model has a final norm,
//! `unembed.norm.weight`.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::backend::ModelBackend;
use crate::error::{LensError, Result};

/// File name of the lens configuration inside a lens directory.
pub const LENS_CONFIG_FILE: &str = "config.json";
/// File name of the lens parameters inside a lens directory.
pub const LENS_PARAMS_FILE: &str = "params.safetensors";

// ---------------------------------------------------------------------------
// Unembed
// ---------------------------------------------------------------------------

/// Final RMS norm followed by the vocabulary projection.
#[derive(Debug, Clone)]
pub struct Unembed {
    /// `[hidden]`; `None` skips normalization.
    norm_weight: Option<Tensor>,
    norm_eps: f64,
    /// `[vocab, hidden]`
    weight: Tensor,
}

impl Unembed {
    /// Create an unembedding from its tensors.
    #[must_use]
    pub const fn new(norm_weight: Option<Tensor>, norm_eps: f64, weight: Tensor) -> Self {
        Self {
            norm_weight,
            norm_eps,
            weight,
        }
    }

    /// `(vocab_size, hidden_size)`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if the weight is not 2-D.
    pub fn dims(&self) -> Result<(usize, usize)> {
        Ok(self.weight.dims2()?)
    }

    /// Move and cast every tensor.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on transfer failure.
    pub fn to_device(&self, device: &Device, dtype: DType) -> Result<Self> {
        let norm_weight = match &self.norm_weight {
            Some(w) => Some(w.to_device(device)?.to_dtype(dtype)?),
            None => None,
        };
        Ok(Self {
            norm_weight,
            norm_eps: self.norm_eps,
            weight: self.weight.to_device(device)?.to_dtype(dtype)?,
        })
    }

    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on shape mismatch.
    #[allow(clippy::cast_possible_truncation)]
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = match &self.norm_weight {
            Some(w) => candle_nn::ops::rms_norm(&hidden.contiguous()?, w, self.norm_eps as f32)?,
            None => hidden.clone(),
        };
        Ok(normed.broadcast_matmul(&self.weight.t()?)?)
    }
}

// ---------------------------------------------------------------------------
// LensConfig
// ---------------------------------------------------------------------------

/// Shape and provenance of a lens, stored as `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensConfig {
    /// Number of translators (one per captured residual-stream layer).
    pub num_layers: usize,
    /// Model hidden dimension.
    pub hidden_size: usize,
    /// Model vocabulary size.
    pub vocab_size: usize,
    /// Epsilon of the unembedding's RMS norm.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Model the lens was fitted to, if known.
    #[serde(default)]
    pub base_model: Option<String>,
}

const fn default_norm_eps() -> f64 {
    1e-5
}

// ---------------------------------------------------------------------------
// TunedLens
// ---------------------------------------------------------------------------

/// A trained (or identity) tuned lens.
#[derive(Debug, Clone)]
pub struct TunedLens {
    config: LensConfig,
    translators: Vec<Linear>,
    unembed: Unembed,
    training: bool,
}

impl TunedLens {
    /// Assemble a lens, checking every shape against `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Lens`] if the translator count or any tensor
    /// shape disagrees with `config`.
    pub fn new(config: LensConfig, translators: Vec<Linear>, unembed: Unembed) -> Result<Self> {
        if translators.len() != config.num_layers {
            return Err(LensError::Lens(format!(
                "expected {} translators, got {}",
                config.num_layers,
                translators.len()
            )));
        }
        let d = config.hidden_size;
        for (i, translator) in translators.iter().enumerate() {
            if translator.weight().dims() != [d, d] {
                return Err(LensError::Lens(format!(
                    "translator {i} weight has shape {:?}, expected [{d}, {d}]",
                    translator.weight().dims()
                )));
            }
        }
        if unembed.dims()? != (config.vocab_size, d) {
            return Err(LensError::Lens(format!(
                "unembedding has shape {:?}, expected ({}, {d})",
                unembed.dims()?,
                config.vocab_size
            )));
        }

        Ok(Self {
            config,
            translators,
            unembed,
            training: true,
        })
    }

    /// A lens whose translators are all zero, i.e. a logit lens.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Lens`] if `unembed` does not match `config`.
    pub fn identity(config: LensConfig, unembed: Unembed, device: &Device, dtype: DType) -> Result<Self> {
        let d = config.hidden_size;
        let translators = (0..config.num_layers)
            .map(|_| {
                Ok(Linear::new(
                    Tensor::zeros((d, d), dtype, device)?,
                    Some(Tensor::zeros(d, dtype, device)?),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(config, translators, unembed.to_device(device, dtype)?)
    }

    /// An identity lens sized for `model`, sharing the model's unembedding.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the backend cannot export its
    /// unembedding.
    pub fn from_model(model: &dyn ModelBackend, device: &Device, dtype: DType) -> Result<Self> {
        let unembed = model.unembed()?;
        let config = LensConfig {
            num_layers: model.num_layers(),
            hidden_size: model.hidden_size(),
            vocab_size: model.vocab_size(),
            norm_eps: unembed.norm_eps,
            base_model: None,
        };
        Self::identity(config, unembed, device, dtype)
    }

    /// Load a lens directory (see the module docs for the layout).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `config.json` is missing or
    /// malformed, [`LensError::Lens`] if a tensor is missing or misshapen.
    pub fn load(dir: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let config_path = dir.join(LENS_CONFIG_FILE);
        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            LensError::Config(format!("read {}: {e}", config_path.display()))
        })?;
        let config: LensConfig = serde_json::from_str(&config_str)
            .map_err(|e| LensError::Config(format!("parse {}: {e}", config_path.display())))?;

        let mut params = candle_core::safetensors::load(dir.join(LENS_PARAMS_FILE), device)?;
        let norm_weight = params
            .remove("unembed.norm.weight")
            .map(|t| t.to_dtype(dtype))
            .transpose()?;
        let mut take = |name: &str| -> Result<Tensor> {
            let tensor = params
                .remove(name)
                .ok_or_else(|| LensError::Lens(format!("missing tensor `{name}`")))?;
            Ok(tensor.to_dtype(dtype)?)
        };

        let translators = (0..config.num_layers)
            .map(|i| {
                let weight = take(&format!("layer_translators.{i}.weight"))?;
                let bias = take(&format!("layer_translators.{i}.bias"))?;
                Ok(Linear::new(weight, Some(bias)))
            })
            .collect::<Result<Vec<_>>>()?;
        let weight = take("unembed.weight")?;

        tracing::debug!(
            dir = %dir.display(),
            layers = config.num_layers,
            normed = norm_weight.is_some(),
            "loaded lens"
        );
        let unembed = Unembed::new(norm_weight, config.norm_eps, weight);
        Self::new(config, translators, unembed)
    }

    /// Write `config.json` and `params.safetensors` into `dir`, creating it
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Io`] on filesystem failures and
    /// [`LensError::Model`] if serialization fails.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let config_json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| LensError::Config(format!("serialize lens config: {e}")))?;
        std::fs::write(dir.join(LENS_CONFIG_FILE), config_json)?;

        let mut params: HashMap<String, Tensor> = HashMap::new();
        for (i, translator) in self.translators.iter().enumerate() {
            params.insert(
                format!("layer_translators.{i}.weight"),
                translator.weight().contiguous()?,
            );
            if let Some(bias) = translator.bias() {
                params.insert(format!("layer_translators.{i}.bias"), bias.contiguous()?);
            }
        }
        params.insert("unembed.weight".into(), self.unembed.weight.contiguous()?);
        if let Some(norm) = &self.unembed.norm_weight {
            params.insert("unembed.norm.weight".into(), norm.contiguous()?);
        }
        candle_core::safetensors::save(&params, dir.join(LENS_PARAMS_FILE))?;
        Ok(())
    }

    /// The lens configuration.
    #[must_use]
    pub const fn config(&self) -> &LensConfig {
        &self.config
    }

    /// Number of translators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.translators.len()
    }

    /// Whether the lens has no translators.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.translators.is_empty()
    }

    /// Switch to inference mode.
    ///
    /// The lens has no dropout or other mode-dependent layers, so the flag
    /// only records intent; [`forward`](Self::forward) and
    /// [`to_logits`](Self::to_logits) behave the same in both modes.
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Switch to training mode.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Whether the lens is in training mode.
    #[must_use]
    pub const fn is_training(&self) -> bool {
        self.training
    }

    /// The shared unembedding.
    #[must_use]
    pub const fn unembed(&self) -> &Unembed {
        &self.unembed
    }

    /// `h + A_idx h + b_idx`.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: same shape
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Lens`] if `idx` is out of range.
    pub fn transform_hidden(&self, hidden: &Tensor, idx: usize) -> Result<Tensor> {
        let translator = self.translators.get(idx).ok_or_else(|| {
            LensError::Lens(format!(
                "layer index {idx} out of range for a lens with {} translators",
                self.translators.len()
            ))
        })?;
        Ok((hidden + translator.forward(hidden)?)?)
    }

    /// Tuned-lens logits for the hidden state entering layer `idx`.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Lens`] if `idx` is out of range, or
    /// [`LensError::Model`] on tensor failures.
    pub fn forward(&self, hidden: &Tensor, idx: usize) -> Result<Tensor> {
        self.to_logits(&self.transform_hidden(hidden, idx)?)
    }

    /// Decode a hidden state with the unembedding alone (logit lens).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn to_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        self.unembed.forward(hidden)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(num_layers: usize) -> LensConfig {
        LensConfig {
            num_layers,
            hidden_size: 3,
            vocab_size: 4,
            norm_eps: 1e-5,
            base_model: Some("toy".into()),
        }
    }

    fn unembed(device: &Device) -> Unembed {
        let weight = Tensor::new(
            &[
                [1.0_f32, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [1.0, 1.0, 1.0],
            ],
            device,
        )
        .unwrap();
        Unembed::new(None, 1e-5, weight)
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn identity_lens_is_logit_lens() {
        let device = Device::Cpu;
        let lens = TunedLens::identity(config(2), unembed(&device), &device, DType::F32).unwrap();
        let h = Tensor::new(&[[[0.5_f32, -1.0, 2.0]]], &device).unwrap();

        let tuned = lens.forward(&h, 1).unwrap();
        let baseline = lens.to_logits(&h).unwrap();
        assert_eq!(tuned.dims(), &[1, 1, 4]);
        assert_eq!(to_vec(&tuned), to_vec(&baseline));
        assert_eq!(to_vec(&baseline), vec![0.5, -1.0, 2.0, 1.5]);
    }

    #[test]
    fn translator_is_residual() {
        let device = Device::Cpu;
        let weight = (Tensor::eye(3, DType::F32, &device).unwrap() * 2.0).unwrap();
        let bias = Tensor::new(&[1.0_f32, 0.0, 0.0], &device).unwrap();
        let lens = TunedLens::new(
            config(1),
            vec![Linear::new(weight, Some(bias))],
            unembed(&device),
        )
        .unwrap();

        let h = Tensor::new(&[[1.0_f32, 1.0, 1.0]], &device).unwrap();
        let transformed = lens.transform_hidden(&h, 0).unwrap();
        assert_eq!(to_vec(&transformed), vec![4.0, 3.0, 3.0]);
        assert!(lens.transform_hidden(&h, 1).is_err());
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let device = Device::Cpu;
        let lens = TunedLens::identity(config(2), unembed(&device), &device, DType::F32).unwrap();
        let too_few = TunedLens::new(config(3), lens.translators.clone(), unembed(&device));
        assert!(too_few.is_err());

        let mut wrong_vocab = config(2);
        wrong_vocab.vocab_size = 7;
        assert!(TunedLens::identity(wrong_vocab, unembed(&device), &device, DType::F32).is_err());
    }

    #[test]
    fn eval_mode_toggle() {
        let device = Device::Cpu;
        let mut lens = TunedLens::identity(config(1), unembed(&device), &device, DType::F32).unwrap();
        assert!(lens.is_training());
        lens.eval();
        assert!(!lens.is_training());
        lens.train();
        assert!(lens.is_training());
    }

    #[test]
    fn mode_does_not_change_outputs() {
        let device = Device::Cpu;
        let bias = Tensor::new(&[0.5_f32, -0.5, 1.0], &device).unwrap();
        let weight = Tensor::eye(3, DType::F32, &device).unwrap();
        let mut lens = TunedLens::new(
            config(1),
            vec![Linear::new(weight, Some(bias))],
            unembed(&device),
        )
        .unwrap();
        let h = Tensor::new(&[[0.3_f32, -0.7, 1.1]], &device).unwrap();

        let training = to_vec(&lens.forward(&h, 0).unwrap());
        lens.eval();
        assert_eq!(to_vec(&lens.forward(&h, 0).unwrap()), training);
    }

    #[test]
    fn load_keeps_norm_only_when_saved() {
        let device = Device::Cpu;
        let weight = unembed(&device).weight;
        for norm in [None, Some(Tensor::new(&[1.0_f32, 2.0, 0.5], &device).unwrap())] {
            let dir = tempfile::tempdir().unwrap();
            let expected = norm.as_ref().map(to_vec);
            let lens = TunedLens::identity(
                config(1),
                Unembed::new(norm, 1e-5, weight.clone()),
                &device,
                DType::F32,
            )
            .unwrap();
            lens.save(dir.path()).unwrap();

            let loaded = TunedLens::load(dir.path(), &device, DType::F32).unwrap();
            assert_eq!(loaded.unembed().norm_weight.as_ref().map(to_vec), expected);
        }
    }

    #[test]
    fn save_then_load_preserves_outputs() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let norm = Tensor::new(&[1.0_f32, 2.0, 0.5], &device).unwrap();
        let weight = Tensor::new(
            &[[0.1_f32, 0.2, 0.3], [0.0, -1.0, 0.0], [2.0, 0.0, 1.0], [0.5, 0.5, 0.5]],
            &device,
        )
        .unwrap();
        let lens = TunedLens::identity(
            config(2),
            Unembed::new(Some(norm), 1e-5, weight),
            &device,
            DType::F32,
        )
        .unwrap();
        lens.save(dir.path()).unwrap();

        let loaded = TunedLens::load(dir.path(), &device, DType::F32).unwrap();
        assert_eq!(loaded.config(), lens.config());
        assert_eq!(loaded.len(), 2);

        let h = Tensor::new(&[[0.3_f32, -0.7, 1.1]], &device).unwrap();
        assert_eq!(
            to_vec(&loaded.forward(&h, 0).unwrap()),
            to_vec(&lens.forward(&h, 0).unwrap())
        );
    }
}
