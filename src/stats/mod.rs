// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running statistics over the residual stream and the output distribution.
//!
//! - [`ResidualStats`]: per-layer mean and second central moment (and
//!   optionally the full covariance) of hidden states.
//! - [`LogitStats`]: marginal next-token distribution and mean
//!   log-probabilities.
//!
//! Both accumulate in `F64` with a batched Chan/Welford merge, so the
//! result does not depend on how samples are split into batches. Both
//! persist to a single safetensors file holding a sample count `n` plus
//! their per-layer tensors.

mod logit;
mod residual;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{LensError, Result};

pub use logit::LogitStats;
pub use residual::ResidualStats;

/// Key of the sample count in a saved accumulator.
const COUNT_KEY: &str = "n";

/// Flatten every leading axis into a sample axis, promoting to `F64`.
///
/// # Shapes
/// - `x`: `[..., dim]`
/// - returns: `[samples, dim]`
fn flatten_samples(x: &Tensor) -> Result<Tensor> {
    let dim = x.dims().last().copied().ok_or_else(|| {
        LensError::Stats("cannot accumulate statistics over a scalar".into())
    })?;
    let samples = if dim == 0 { 0 } else { x.elem_count() / dim };
    Ok(x.to_dtype(DType::F64)?.reshape((samples, dim))?)
}

/// Weight `new / (old + new)` of a batch merged into a running mean.
#[allow(clippy::cast_precision_loss)]
fn batch_weight(old: usize, new: usize) -> f64 {
    new as f64 / (old + new) as f64
}

/// Write `tensors` plus the sample count to `path`, moving them to CPU.
fn save_with_count(mut tensors: HashMap<String, Tensor>, n: usize, path: &Path) -> Result<()> {
    let count = i64::try_from(n)
        .map_err(|_| LensError::Stats(format!("sample count {n} does not fit in i64")))?;
    tensors.insert(COUNT_KEY.to_owned(), Tensor::new(&[count], &Device::Cpu)?);
    let tensors = tensors
        .into_iter()
        .map(|(name, t)| Ok((name, t.to_device(&Device::Cpu)?)))
        .collect::<Result<HashMap<_, _>>>()?;
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Read a file written by [`save_with_count`].
fn load_with_count(path: &Path, device: &Device) -> Result<(usize, HashMap<String, Tensor>)> {
    let mut tensors = candle_core::safetensors::load(path, device)?;
    let count = tensors
        .remove(COUNT_KEY)
        .ok_or_else(|| LensError::Stats(format!("{} has no sample count", path.display())))?;
    let count: Vec<i64> = count.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
    let n = count
        .first()
        .and_then(|&c| usize::try_from(c).ok())
        .ok_or_else(|| LensError::Stats(format!("{} has an invalid sample count", path.display())))?;
    Ok((n, tensors))
}

/// Collect `"{prefix}.{i}"` for `i = 0, 1, ...` until the first gap.
fn take_indexed(tensors: &mut HashMap<String, Tensor>, prefix: &str) -> Vec<Tensor> {
    (0..)
        .map_while(|i| tensors.remove(&format!("{prefix}.{i}")))
        .collect()
}
