// SPDX-License-Identifier: MIT OR Apache-2.0

//! Causal self-attention with grouped-query heads and rotary embeddings.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::TransformerConfig;
use crate::error::Result;

// ---------------------------------------------------------------------------
// RoPE cache
// ---------------------------------------------------------------------------

/// Pre-computed cosine and sine tables for rotary position embeddings.
pub struct RopeCache {
    /// `[max_position, head_dim / 2]`
    cos: Tensor,
    /// `[max_position, head_dim / 2]`
    sin: Tensor,
}

impl RopeCache {
    /// Build the tables for `max_position` positions.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// operation failures.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn new(
        head_dim: usize,
        max_position: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_position).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_position, 1), device)?;

        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate a query or key tensor.
    ///
    /// # Shapes
    /// - `x`: `[batch, heads, seq, head_dim]`
    /// - returns: same shape
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        let half_dim = head_dim / 2;

        let cos = self.cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        let rotated_1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Ok(Tensor::cat(&[&rotated_1, &rotated_2], D::Minus1)?)
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Multi-head causal self-attention.
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    /// Load `q_proj`, `k_proj`, `v_proj` and `o_proj`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_kv_heads * config.head_dim;
        let proj = |out_dim: usize, name: &str| -> Result<Linear> {
            if config.qkv_bias {
                Ok(candle_nn::linear(config.hidden_size, out_dim, vb.pp(name))?)
            } else {
                Ok(candle_nn::linear_no_bias(
                    config.hidden_size,
                    out_dim,
                    vb.pp(name),
                )?)
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (config.head_dim as f64).sqrt();

        Ok(Self {
            q_proj: proj(q_dim, "q_proj")?,
            k_proj: proj(kv_dim, "k_proj")?,
            v_proj: proj(kv_dim, "v_proj")?,
            o_proj: candle_nn::linear_no_bias(q_dim, config.hidden_size, vb.pp("o_proj"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            scale,
        })
    }

    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - `mask`: `[1, 1, seq, seq]`, `0` to keep and `-inf` to drop
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// operation failures.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, rope: &RopeCache) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let split_heads = |t: Tensor, heads: usize| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(self.q_proj.forward(x)?, self.num_heads)?;
        let k = split_heads(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = split_heads(self.v_proj.forward(x)?, self.num_kv_heads)?;

        let q = rope.apply(&q)?;
        let k = repeat_kv(rope.apply(&k)?, self.num_heads, self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads, self.num_kv_heads)?;

        let scores = (q.contiguous()?.matmul(&k.contiguous()?.transpose(2, 3)?)? * self.scale)?;
        let scores = scores.broadcast_add(mask)?;

        // PROMOTE: softmax over BF16 can produce NaN; compute in F32
        let dtype = scores.dtype();
        let pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(dtype)?;

        let out = pattern.matmul(&v.contiguous()?)?;
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

/// Expand `[batch, kv_heads, seq, head_dim]` to `[batch, heads, seq, head_dim]`.
fn repeat_kv(x: Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    if n_heads == n_kv_heads {
        return Ok(x);
    }
    let repeats = n_heads / n_kv_heads;
    let (batch, _, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((batch, n_kv_heads, repeats, seq_len, head_dim))?
        .reshape((batch, n_heads, seq_len, head_dim))?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rope_is_identity_at_position_zero() {
        let device = Device::Cpu;
        let rope = RopeCache::new(4, 8, 10_000.0, &device, DType::F32).unwrap();
        let x = Tensor::new(&[[[[1.0_f32, 2.0, 3.0, 4.0]]]], &device).unwrap();
        let rotated = rope.apply(&x).unwrap();
        let values: Vec<f32> = rotated.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn repeat_kv_expands_heads() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        let expanded = repeat_kv(x, 6, 2).unwrap();
        assert_eq!(expanded.dims(), &[1, 6, 3, 4]);
    }
}
