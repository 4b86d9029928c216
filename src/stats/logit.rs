// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running statistics of next-token distributions.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use super::{batch_weight, flatten_samples, load_with_count, save_with_count};
use crate::error::{LensError, Result};
use crate::metrics;

const MARGINAL_KEY: &str = "marginal_probs";
const SUFFICIENT_KEY: &str = "sufficient_stats";

/// Running marginal distribution and mean log-probabilities over every
/// position seen.
///
/// `marginal_probs` is the average of the per-position probability
/// vectors; `sufficient_stats` is the average of the log-probability
/// vectors, which is the sufficient statistic for fitting a Dirichlet to
/// the outputs.
#[derive(Debug, Clone, Default)]
pub struct LogitStats {
    n: usize,
    marginal_probs: Option<Tensor>,
    sufficient_stats: Option<Tensor>,
}

impl LogitStats {
    /// Create an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            n: 0,
            marginal_probs: None,
            sufficient_stats: None,
        }
    }

    /// Fold a batch of logits into the running means.
    ///
    /// `logits` is `[..., vocab]`. With `assume_normalized`, the values are
    /// taken to be log-probabilities already; otherwise a log-softmax is
    /// applied first.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Stats`] if the vocabulary size changes between
    /// updates.
    pub fn update(&mut self, logits: &Tensor, assume_normalized: bool) -> Result<()> {
        let log_probs = if assume_normalized {
            logits.clone()
        } else {
            metrics::log_softmax(logits)?
        };
        let flat = flatten_samples(&log_probs)?;
        let count = flat.dim(0)?;
        if count == 0 {
            return Ok(());
        }

        let batch_lps = flat.mean(0)?;
        let batch_probs = flat.exp()?.mean(0)?;

        let (probs, lps) = match (&self.marginal_probs, &self.sufficient_stats) {
            (Some(probs), Some(lps)) => {
                if probs.dims() != batch_probs.dims() {
                    return Err(LensError::Stats(format!(
                        "vocabulary size changed from {:?} to {:?}",
                        probs.dims(),
                        batch_probs.dims()
                    )));
                }
                let weight = batch_weight(self.n, count);
                (
                    (probs + ((batch_probs - probs)? * weight)?)?,
                    (lps + ((batch_lps - lps)? * weight)?)?,
                )
            }
            _ => (batch_probs, batch_lps),
        };
        self.marginal_probs = Some(probs);
        self.sufficient_stats = Some(lps);
        self.n += count;
        Ok(())
    }

    /// Number of positions seen.
    #[must_use]
    pub const fn n(&self) -> usize {
        self.n
    }

    /// Mean probability vector, `[vocab]`, or `None` before any update.
    #[must_use]
    pub const fn marginal_probs(&self) -> Option<&Tensor> {
        self.marginal_probs.as_ref()
    }

    /// Mean log-probability vector, `[vocab]`, or `None` before any update.
    #[must_use]
    pub const fn sufficient_stats(&self) -> Option<&Tensor> {
        self.sufficient_stats.as_ref()
    }

    /// Entropy of the marginal distribution, in nats.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Stats`] before any update.
    pub fn marginal_entropy(&self) -> Result<f64> {
        let probs = self
            .marginal_probs
            .as_ref()
            .ok_or_else(|| LensError::Stats("no logits accumulated".into()))?;
        // 0 · log 0 contributes 0
        let log_probs = probs.clamp(f64::MIN_POSITIVE, 1.0)?.log()?;
        Ok(-(probs * log_probs)?.sum_all()?.to_scalar::<f64>()?)
    }

    /// Save to a safetensors file with keys `n`, `marginal_probs` and
    /// `sufficient_stats`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if serialization fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = HashMap::new();
        if let Some(probs) = &self.marginal_probs {
            tensors.insert(MARGINAL_KEY.to_owned(), probs.clone());
        }
        if let Some(lps) = &self.sufficient_stats {
            tensors.insert(SUFFICIENT_KEY.to_owned(), lps.clone());
        }
        save_with_count(tensors, self.n, path)
    }

    /// Load an accumulator written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Stats`] if only one of the two vectors is
    /// present, or [`LensError::Model`] if the file cannot be read.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let (n, mut tensors) = load_with_count(path, device)?;
        let marginal_probs = tensors.remove(MARGINAL_KEY);
        let sufficient_stats = tensors.remove(SUFFICIENT_KEY);
        if marginal_probs.is_some() != sufficient_stats.is_some() {
            return Err(LensError::Stats(format!(
                "{} must hold both {MARGINAL_KEY} and {SUFFICIENT_KEY}",
                path.display()
            )));
        }
        Ok(Self {
            n,
            marginal_probs,
            sufficient_stats,
        })
    }
}
