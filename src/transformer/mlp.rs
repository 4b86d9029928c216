// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gated `SwiGLU` feed-forward block: `down(silu(gate(x)) * up(x))`.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::TransformerConfig;
use crate::error::Result;

/// Feed-forward block of a decoder layer.
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    /// Load `gate_proj`, `up_proj` and `down_proj`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: candle_nn::linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
        })
    }

    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}
