// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-batch evaluation metrics and their on-disk format.
//!
//! A [`BatchOutput`] maps each [`Metric`] to a map from layer name to an
//! unreduced tensor. It is saved as one safetensors file whose keys are
//! `"{metric}/{layer}"`, e.g. `lens_kl/blocks.3.hook_resid_post`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::{Device, Tensor};

use crate::error::{LensError, Result};

/// Layer name under which the model's own output distribution is stored.
pub const FINAL_LAYER: &str = "final";

/// A metric recorded per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    /// Cross-entropy of the logit-lens decoding, `[batch * (seq - 1)]`.
    BaselineCe,
    /// Entropy of the logit-lens decoding, `[batch, seq]`.
    BaselineEntropy,
    /// Cross-entropy of the tuned-lens decoding, `[batch * (seq - 1)]`.
    LensCe,
    /// Entropy of the tuned-lens decoding, `[batch, seq]`.
    LensEntropy,
    /// KL divergence from the final distribution to the tuned lens, `[batch, seq]`.
    LensKl,
}

impl Metric {
    /// All metrics in file order.
    pub const ALL: [Self; 5] = [
        Self::BaselineCe,
        Self::BaselineEntropy,
        Self::LensCe,
        Self::LensEntropy,
        Self::LensKl,
    ];

    /// Key prefix used on disk.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BaselineCe => "baseline_ce",
            Self::BaselineEntropy => "baseline_entropy",
            Self::LensCe => "lens_ce",
            Self::LensEntropy => "lens_entropy",
            Self::LensKl => "lens_kl",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = LensError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| LensError::Data(format!("unknown metric {s:?}")))
    }
}

/// Metric → layer name → tensor, for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    metrics: BTreeMap<Metric, BTreeMap<String, Tensor>>,
}

impl BatchOutput {
    /// Create an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `tensor` as `metric` for `layer`, replacing any earlier value.
    pub fn insert(&mut self, metric: Metric, layer: impl Into<String>, tensor: Tensor) {
        self.metrics
            .entry(metric)
            .or_default()
            .insert(layer.into(), tensor);
    }

    /// Look up one tensor.
    #[must_use]
    pub fn get(&self, metric: Metric, layer: &str) -> Option<&Tensor> {
        self.metrics.get(&metric).and_then(|layers| layers.get(layer))
    }

    /// All layers recorded for `metric`.
    #[must_use]
    pub fn layers(&self, metric: Metric) -> Option<&BTreeMap<String, Tensor>> {
        self.metrics.get(&metric)
    }

    /// Total number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every tensor to `path` under `"{metric}/{layer}"`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if a transfer or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = HashMap::with_capacity(self.len());
        for (metric, layers) in &self.metrics {
            for (layer, tensor) in layers {
                tensors.insert(format!("{metric}/{layer}"), tensor.to_device(&Device::Cpu)?);
            }
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Read a file written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Data`] for keys that are not
    /// `"{metric}/{layer}"`, or [`LensError::Model`] if the file cannot be
    /// read.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut output = Self::new();
        for (key, tensor) in candle_core::safetensors::load(path, device)? {
            let (metric, layer) = key
                .split_once('/')
                .ok_or_else(|| LensError::Data(format!("malformed metric key {key:?}")))?;
            output.insert(metric.parse()?, layer, tensor);
        }
        Ok(output)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(metric.to_string().parse::<Metric>().unwrap(), metric);
        }
        assert!("lens_mse".parse::<Metric>().is_err());
    }

    #[test]
    fn save_uses_metric_slash_layer_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch_0.safetensors");

        let mut output = BatchOutput::new();
        output.insert(
            Metric::LensKl,
            "hook_embed",
            Tensor::new(&[[0.5_f32, 0.25]], &Device::Cpu).unwrap(),
        );
        output.insert(
            Metric::BaselineCe,
            FINAL_LAYER,
            Tensor::new(&[1.0_f32], &Device::Cpu).unwrap(),
        );
        output.save(&path).unwrap();

        let raw = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        let mut keys: Vec<&String> = raw.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["baseline_ce/final", "lens_kl/hook_embed"]);

        let loaded = BatchOutput::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 2);
        let kl: Vec<Vec<f32>> = loaded
            .get(Metric::LensKl, "hook_embed")
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(kl, vec![vec![0.5, 0.25]]);
    }

    #[test]
    fn insert_replaces() {
        let mut output = BatchOutput::new();
        let t = Tensor::new(&[1.0_f32], &Device::Cpu).unwrap();
        output.insert(Metric::LensCe, "x", t.clone());
        output.insert(Metric::LensCe, "x", t);
        assert_eq!(output.len(), 1);
        assert!(output.get(Metric::LensEntropy, "x").is_none());
    }
}
