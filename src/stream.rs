// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual-stream capture.
//!
//! [`record_residual_stream`] runs one forward pass with a capture-only
//! [`HookSpec`] and returns the logits together with a
//! [`ResidualStream`]: the embedding followed by every captured block
//! output, in layer order. The spec and the cache are locals of that call, so the capture
//! is released on every exit path, early `?` returns included.

use candle_core::Tensor;

use crate::backend::ModelBackend;
use crate::error::Result;
use crate::hooks::{HookPoint, HookSpec};

/// Ordered `(hook point, hidden state)` pairs, one per captured layer.
#[derive(Debug, Clone, Default)]
pub struct ResidualStream {
    layers: Vec<(HookPoint, Tensor)>,
}

impl ResidualStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer.
    pub fn push(&mut self, hook: HookPoint, tensor: Tensor) {
        self.layers.push((hook, tensor));
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stream has no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterate over `(hook point, tensor)` pairs in layer order.
    pub fn iter(&self) -> impl Iterator<Item = (&HookPoint, &Tensor)> {
        self.layers.iter().map(|(hook, tensor)| (hook, tensor))
    }

    /// Iterate over the tensors in layer order.
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.layers.iter().map(|(_, tensor)| tensor)
    }

    /// Layer names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.layers.iter().map(|(hook, _)| hook.to_string()).collect()
    }

    /// Apply `f` to every tensor, keeping names and order.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `f`.
    pub fn map<F>(&self, mut f: F) -> Result<Self>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        let layers = self
            .layers
            .iter()
            .map(|(hook, tensor)| Ok((hook.clone(), f(tensor)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Per-block updates `h_k - h_{k-1}` for `k >= 1`, each named after
    /// the later layer. `N` layers give `N - 1` entries.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if adjacent
    /// layers differ in shape.
    pub fn residuals(&self) -> Result<Self> {
        let layers = self
            .layers
            .iter()
            .zip(self.layers.iter().skip(1))
            .map(|((_, prev), (hook, tensor))| Ok((hook.clone(), (tensor - prev)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }
}

impl<'a> IntoIterator for &'a ResidualStream {
    type Item = &'a (HookPoint, Tensor);
    type IntoIter = std::slice::Iter<'a, (HookPoint, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

/// Hook points of the hidden states entering each of the model's blocks:
/// the embedding, then the output of every block but the last. With
/// `include_final`, the last block's output is appended.
#[must_use]
pub fn residual_hook_points(num_layers: usize, include_final: bool) -> Vec<HookPoint> {
    let block_outputs = if include_final {
        num_layers
    } else {
        num_layers.saturating_sub(1)
    };
    std::iter::once(HookPoint::Embed)
        .chain((0..block_outputs).map(HookPoint::ResidPost))
        .collect()
}

/// Run `model` on `input_ids`, capturing the residual stream.
///
/// # Shapes
/// - `input_ids`: `[batch, seq]`
/// - returns: logits `[batch, seq, vocab]` and one `[batch, seq, hidden]`
///   tensor per layer
///
/// # Errors
///
/// Propagates forward-pass errors; returns
/// [`LensError::Hook`](crate::LensError::Hook) if the
/// backend did not fill every requested hook point.
pub fn record_residual_stream(
    model: &dyn ModelBackend,
    input_ids: &Tensor,
    include_final: bool,
) -> Result<(Tensor, ResidualStream)> {
    let points = residual_hook_points(model.num_layers(), include_final);
    let mut hooks = HookSpec::new();
    for point in &points {
        hooks.capture(point.clone());
    }

    let mut cache = model.forward(input_ids, &hooks)?;

    let mut stream = ResidualStream::new();
    for point in points {
        let tensor = cache.take(&point)?;
        stream.push(point, tensor);
    }
    Ok((cache.into_output(), stream))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::{Device, IndexOp};

    use super::*;
    use crate::error::LensError;

    fn stream() -> ResidualStream {
        let device = Device::Cpu;
        let mut stream = ResidualStream::new();
        stream.push(
            HookPoint::Embed,
            Tensor::new(&[[[1.0_f32, 2.0], [3.0, 4.0]]], &device).unwrap(),
        );
        stream.push(
            HookPoint::ResidPost(0),
            Tensor::new(&[[[2.0_f32, 2.0], [5.0, 1.0]]], &device).unwrap(),
        );
        stream.push(
            HookPoint::ResidPost(1),
            Tensor::new(&[[[0.0_f32, 2.5], [5.0, 0.0]]], &device).unwrap(),
        );
        stream
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn hook_points_skip_last_block() {
        assert_eq!(
            residual_hook_points(3, false),
            vec![HookPoint::Embed, HookPoint::ResidPost(0), HookPoint::ResidPost(1)]
        );
        assert_eq!(residual_hook_points(3, true).len(), 4);
        assert_eq!(residual_hook_points(0, false), vec![HookPoint::Embed]);
    }

    #[test]
    fn map_preserves_order_and_names() {
        let stream = stream();
        let first = stream.map(|t| Ok(t.i((.., 0))?)).unwrap();

        assert_eq!(first.names(), stream.names());
        let tensors: Vec<Vec<f32>> = first.tensors().map(values).collect();
        assert_eq!(tensors, vec![vec![1.0, 2.0], vec![2.0, 2.0], vec![0.0, 2.5]]);
    }

    #[test]
    fn residuals_are_successive_differences() {
        let deltas = stream().residuals().unwrap();
        assert_eq!(
            deltas.names(),
            vec!["blocks.0.hook_resid_post", "blocks.1.hook_resid_post"]
        );
        let tensors: Vec<Vec<f32>> = deltas.tensors().map(values).collect();
        assert_eq!(
            tensors,
            vec![vec![1.0, 0.0, 2.0, -3.0], vec![-2.0, 0.5, 0.0, -1.0]]
        );
    }

    #[test]
    fn residuals_of_single_layer_are_empty() {
        let mut single = ResidualStream::new();
        single.push(
            HookPoint::Embed,
            Tensor::new(&[[1.0_f32, 2.0]], &Device::Cpu).unwrap(),
        );
        assert!(single.residuals().unwrap().is_empty());
    }

    #[test]
    fn map_propagates_errors() {
        let result = stream().map(|_| Err(LensError::Hook("boom".into())));
        assert!(result.is_err());
    }
}
