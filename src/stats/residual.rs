// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-layer moments of the residual stream.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use super::{batch_weight, flatten_samples, load_with_count, save_with_count, take_indexed};
use crate::error::{LensError, Result};
use crate::stream::ResidualStream;

/// Key of the covariance-tracking flag in a saved accumulator.
const TRACK_COV_KEY: &str = "track_cov";

/// Moments of one layer, all `F64`.
#[derive(Debug, Clone)]
struct LayerMoments {
    /// `[dim]`
    mean: Tensor,
    /// Sum of squared deviations from the mean, `[dim]`.
    m2: Tensor,
    /// Sum of outer products of deviations, `[dim, dim]`.
    comoment: Option<Tensor>,
}

/// Running mean and variance (optionally covariance) of every layer of a
/// residual stream.
///
/// All layers share one sample count: each [`update`](Self::update)
/// must contribute the same number of samples to every layer.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_tuned_lens::{HookPoint, ResidualStats, ResidualStream};
///
/// # fn main() -> candle_tuned_lens::Result<()> {
/// let mut stream = ResidualStream::new();
/// stream.push(HookPoint::Embed, Tensor::new(&[[1.0_f32], [3.0]], &Device::Cpu)?);
///
/// let mut stats = ResidualStats::new(false);
/// stats.update(&stream)?;
/// assert_eq!(stats.n(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ResidualStats {
    track_cov: bool,
    n: usize,
    layers: Vec<LayerMoments>,
}

impl Default for ResidualStats {
    /// Tracks the full covariance.
    fn default() -> Self {
        Self::new(true)
    }
}

impl ResidualStats {
    /// Create an empty accumulator. With `track_cov`, a `[dim, dim]`
    /// co-moment is kept per layer.
    #[must_use]
    pub const fn new(track_cov: bool) -> Self {
        Self {
            track_cov,
            n: 0,
            layers: Vec::new(),
        }
    }

    /// Fold a batch of hidden states into the running moments.
    ///
    /// Every leading axis of each layer's tensor is a sample axis. A batch
    /// with zero samples leaves the accumulator unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Stats`] if layers contribute different sample
    /// counts, or if the layer count or width differs from earlier updates.
    pub fn update(&mut self, stream: &ResidualStream) -> Result<()> {
        let batches = stream
            .tensors()
            .map(flatten_samples)
            .collect::<Result<Vec<_>>>()?;

        let Some(first) = batches.first() else {
            return Ok(());
        };
        let count = first.dim(0)?;
        for (i, batch) in batches.iter().enumerate() {
            if batch.dim(0)? != count {
                return Err(LensError::Stats(format!(
                    "layer {i} has {} samples, layer 0 has {count}",
                    batch.dim(0)?
                )));
            }
        }
        if count == 0 {
            return Ok(());
        }
        if self.n > 0 && batches.len() != self.layers.len() {
            return Err(LensError::Stats(format!(
                "update has {} layers, accumulator has {}",
                batches.len(),
                self.layers.len()
            )));
        }

        for (running, batch) in self.layers.iter().zip(&batches) {
            let width = batch.dim(1)?;
            if running.mean.dims() != [width] {
                return Err(LensError::Stats(format!(
                    "hidden width changed from {:?} to {width}",
                    running.mean.dims()
                )));
            }
        }

        let batch_moments = batches
            .iter()
            .map(|x| self.moments_of(x))
            .collect::<Result<Vec<_>>>()?;

        if self.n == 0 {
            self.layers = batch_moments;
        } else {
            let weight = batch_weight(self.n, count);
            #[allow(clippy::cast_precision_loss)]
            let cross = (self.n as f64) * weight;
            for (running, batch) in self.layers.iter_mut().zip(batch_moments) {
                let delta = (&batch.mean - &running.mean)?;
                running.m2 = ((&running.m2 + &batch.m2)? + (delta.sqr()? * cross)?)?;
                if let (Some(c), Some(c_b)) = (&running.comoment, &batch.comoment) {
                    let outer = delta.unsqueeze(1)?.matmul(&delta.unsqueeze(0)?)?;
                    running.comoment = Some(((c + c_b)? + (outer * cross)?)?);
                }
                running.mean = (&running.mean + (delta * weight)?)?;
            }
        }
        self.n += count;
        Ok(())
    }

    /// Moments of a single `[samples, dim]` batch.
    fn moments_of(&self, x: &Tensor) -> Result<LayerMoments> {
        let mean = x.mean(0)?;
        let centered = x.broadcast_sub(&mean)?;
        let m2 = centered.sqr()?.sum(0)?;
        let comoment = if self.track_cov {
            Some(centered.t()?.matmul(&centered)?)
        } else {
            None
        };
        Ok(LayerMoments { mean, m2, comoment })
    }

    /// Number of samples seen.
    #[must_use]
    pub const fn n(&self) -> usize {
        self.n
    }

    /// Number of layers tracked (zero before the first update).
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Whether the full covariance is tracked.
    #[must_use]
    pub const fn tracks_covariance(&self) -> bool {
        self.track_cov
    }

    /// Running mean of each layer, `[dim]`.
    #[must_use]
    pub fn mean(&self) -> Vec<Tensor> {
        self.layers.iter().map(|l| l.mean.clone()).collect()
    }

    /// Unbiased variance of each layer, `[dim]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Stats`] with fewer than two samples.
    pub fn variance(&self) -> Result<Vec<Tensor>> {
        let denom = self.unbiased_denominator()?;
        self.layers
            .iter()
            .map(|l| Ok((&l.m2 / denom)?))
            .collect()
    }

    /// Unbiased covariance of each layer, `[dim, dim]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Stats`] if covariance is not tracked or with
    /// fewer than two samples.
    pub fn covariance(&self) -> Result<Vec<Tensor>> {
        if !self.track_cov {
            return Err(LensError::Stats("covariance is not tracked".into()));
        }
        let denom = self.unbiased_denominator()?;
        self.layers
            .iter()
            .map(|l| {
                let c = l.comoment.as_ref().ok_or_else(|| {
                    LensError::Stats("covariance is not tracked".into())
                })?;
                Ok((c / denom)?)
            })
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn unbiased_denominator(&self) -> Result<f64> {
        if self.n < 2 {
            return Err(LensError::Stats(format!(
                "need at least 2 samples for an unbiased estimate, have {}",
                self.n
            )));
        }
        Ok((self.n - 1) as f64)
    }

    /// Save to a safetensors file with keys `n`, `track_cov`, `mean.{i}`,
    /// `m2.{i}` and, when tracked, `cov.{i}` (the unnormalized co-moment).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if serialization fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert(
            TRACK_COV_KEY.to_owned(),
            Tensor::new(&[u8::from(self.track_cov)], &Device::Cpu)?,
        );
        for (i, layer) in self.layers.iter().enumerate() {
            tensors.insert(format!("mean.{i}"), layer.mean.clone());
            tensors.insert(format!("m2.{i}"), layer.m2.clone());
            if let Some(c) = &layer.comoment {
                tensors.insert(format!("cov.{i}"), c.clone());
            }
        }
        save_with_count(tensors, self.n, path)
    }

    /// Load an accumulator written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Stats`] if the file is inconsistent, or
    /// [`LensError::Model`] if it cannot be read.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let (n, mut tensors) = load_with_count(path, device)?;
        let saved_flag = tensors
            .remove(TRACK_COV_KEY)
            .map(|t| -> Result<bool> {
                let flag: Vec<u8> = t.to_dtype(DType::U8)?.flatten_all()?.to_vec1()?;
                Ok(flag.first().is_some_and(|&f| f != 0))
            })
            .transpose()?;
        let means = take_indexed(&mut tensors, "mean");
        let m2s = take_indexed(&mut tensors, "m2");
        let covs = take_indexed(&mut tensors, "cov");

        if means.len() != m2s.len() || (!covs.is_empty() && covs.len() != means.len()) {
            return Err(LensError::Stats(format!(
                "{} has {} means, {} second moments and {} covariances",
                path.display(),
                means.len(),
                m2s.len(),
                covs.len()
            )));
        }
        // Files without the flag predate it; infer from the co-moments.
        let track_cov = saved_flag.unwrap_or(!covs.is_empty());
        if track_cov && covs.len() != means.len() {
            return Err(LensError::Stats(format!(
                "{} tracks covariance but has {} covariances for {} layers",
                path.display(),
                covs.len(),
                means.len()
            )));
        }
        let mut covs = covs.into_iter().filter(|_| track_cov);
        let layers = means
            .into_iter()
            .zip(m2s)
            .map(|(mean, m2)| LayerMoments {
                mean,
                m2,
                comoment: covs.next(),
            })
            .collect();
        Ok(Self {
            track_cov,
            n,
            layers,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hooks::HookPoint;

    fn one_layer(rows: &[[f32; 2]]) -> ResidualStream {
        let mut stream = ResidualStream::new();
        let data: Vec<f32> = rows.concat();
        stream.push(
            HookPoint::Embed,
            Tensor::from_vec(data, (rows.len(), 2), &Device::Cpu).unwrap(),
        );
        stream
    }

    fn vec1(t: &Tensor) -> Vec<f64> {
        t.to_vec1().unwrap()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
        }
    }

    const ROWS: [[f32; 2]; 4] = [[1.0, 0.0], [2.0, 4.0], [4.0, 2.0], [5.0, 6.0]];

    #[test]
    fn mean_and_variance_match_direct_computation() {
        let mut stats = ResidualStats::new(true);
        stats.update(&one_layer(&ROWS)).unwrap();

        assert_eq!(stats.n(), 4);
        assert_close(&vec1(&stats.mean()[0]), &[3.0, 3.0]);
        // Σ(x - 3)² = 4 + 1 + 1 + 4 and 9 + 1 + 1 + 9, over n - 1 = 3
        assert_close(&vec1(&stats.variance().unwrap()[0]), &[10.0 / 3.0, 20.0 / 3.0]);
        let cov: Vec<Vec<f64>> = stats.covariance().unwrap()[0].to_vec2().unwrap();
        // Σ(x - 3)(y - 3) = 6 - 1 - 1 + 6
        assert!((cov[0][1] - 10.0 / 3.0).abs() < 1e-9);
        assert!((cov[1][0] - cov[0][1]).abs() < 1e-12);
    }

    #[test]
    fn batch_split_does_not_change_result() {
        let mut whole = ResidualStats::new(true);
        whole.update(&one_layer(&ROWS)).unwrap();

        let mut split = ResidualStats::new(true);
        split.update(&one_layer(&ROWS[2..])).unwrap();
        split.update(&one_layer(&ROWS[..1])).unwrap();
        split.update(&one_layer(&ROWS[1..2])).unwrap();

        assert_eq!(split.n(), whole.n());
        assert_close(&vec1(&split.mean()[0]), &vec1(&whole.mean()[0]));
        assert_close(
            &vec1(&split.variance().unwrap()[0]),
            &vec1(&whole.variance().unwrap()[0]),
        );
        let a: Vec<Vec<f64>> = split.covariance().unwrap()[0].to_vec2().unwrap();
        let b: Vec<Vec<f64>> = whole.covariance().unwrap()[0].to_vec2().unwrap();
        assert_close(&a.concat(), &b.concat());
    }

    #[test]
    fn mismatched_sample_counts_are_rejected() {
        let mut stream = one_layer(&ROWS);
        stream.push(
            HookPoint::ResidPost(0),
            Tensor::new(&[[1.0_f32, 1.0]], &Device::Cpu).unwrap(),
        );
        let mut stats = ResidualStats::new(false);
        assert!(matches!(stats.update(&stream), Err(LensError::Stats(_))));
        assert_eq!(stats.n(), 0);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut stats = ResidualStats::new(false);
        let mut stream = ResidualStream::new();
        stream.push(
            HookPoint::Embed,
            Tensor::zeros((1, 0, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
        );
        stats.update(&stream).unwrap();
        assert_eq!(stats.n(), 0);
        assert_eq!(stats.num_layers(), 0);
    }

    #[test]
    fn covariance_requires_tracking() {
        let mut stats = ResidualStats::new(false);
        stats.update(&one_layer(&ROWS)).unwrap();
        assert!(stats.covariance().is_err());
    }

    #[test]
    fn save_and_load_preserve_moments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.safetensors");

        let mut stats = ResidualStats::new(true);
        stats.update(&one_layer(&ROWS)).unwrap();
        stats.save(&path).unwrap();

        let loaded = ResidualStats::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.n(), 4);
        assert!(loaded.tracks_covariance());
        assert_close(&vec1(&loaded.mean()[0]), &[3.0, 3.0]);
    }

    #[test]
    fn empty_accumulator_saves_count_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        ResidualStats::default().save(&path).unwrap();

        let raw = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        let mut keys: Vec<&String> = raw.keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["n", "track_cov"]);
        let loaded = ResidualStats::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.n(), 0);
        assert_eq!(loaded.num_layers(), 0);
        assert!(loaded.tracks_covariance());
    }

    #[test]
    fn covariance_flag_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        for track_cov in [true, false] {
            let path = dir.path().join(format!("stats_{track_cov}.safetensors"));
            ResidualStats::new(track_cov).save(&path).unwrap();
            let loaded = ResidualStats::load(&path, &Device::Cpu).unwrap();
            assert_eq!(loaded.tracks_covariance(), track_cov);

            let mut filled = ResidualStats::new(track_cov);
            filled.update(&one_layer(&ROWS)).unwrap();
            filled.save(&path).unwrap();
            let loaded = ResidualStats::load(&path, &Device::Cpu).unwrap();
            assert_eq!(loaded.tracks_covariance(), track_cov);
            assert_eq!(loaded.covariance().is_ok(), track_cov);
        }
    }
}
