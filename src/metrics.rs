// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-token comparison metrics between next-token distributions.
//!
//! All functions take log-probabilities over the last axis and return
//! unreduced tensors: one value per token (cross-entropy) or per position
//! (entropy, KL divergence). Inputs are promoted to `F32` by
//! [`log_softmax`].

use candle_core::{D, DType, Tensor};

use crate::error::{LensError, Result};

/// Log-softmax over the vocabulary axis, computed in `F32`.
///
/// # Shapes
/// - `logits`: `[..., vocab]`
/// - returns: `[..., vocab]`, `F32`
///
/// # Errors
///
/// Returns [`LensError::Model`] on tensor failures.
pub fn log_softmax(logits: &Tensor) -> Result<Tensor> {
    // PROMOTE: reduced-precision logits lose too much mass in exp/sum
    let logits = logits.to_dtype(DType::F32)?;
    Ok(candle_nn::ops::log_softmax(&logits, D::Minus1)?)
}

/// Drop the last `shift` positions so prediction `t` lines up with the
/// label at `t + shift`.
///
/// # Shapes
/// - `preds`: `[batch, seq, ...]`
/// - returns: `[batch, seq - shift, ...]`
///
/// # Errors
///
/// Returns [`LensError::Data`] if `shift` exceeds the sequence length.
pub fn shift_preds(preds: &Tensor, shift: usize) -> Result<Tensor> {
    let seq_len = preds.dim(1)?;
    if shift > seq_len {
        return Err(LensError::Data(format!(
            "cannot shift {shift} positions in a sequence of {seq_len}"
        )));
    }
    Ok(preds.narrow(1, 0, seq_len - shift)?)
}

/// Labels for next-token prediction: every token but the first `shift`.
///
/// # Shapes
/// - `input_ids`: `[batch, seq]`
/// - returns: `[batch, seq - shift]`
///
/// # Errors
///
/// Returns [`LensError::Data`] if `shift` exceeds the sequence length.
pub fn shift_labels(input_ids: &Tensor, shift: usize) -> Result<Tensor> {
    let seq_len = input_ids.dim(1)?;
    if shift > seq_len {
        return Err(LensError::Data(format!(
            "cannot shift {shift} positions in a sequence of {seq_len}"
        )));
    }
    Ok(input_ids.narrow(1, shift, seq_len - shift)?)
}

/// Token-level cross-entropy, flattened across batch and sequence, with
/// no reduction.
///
/// # Shapes
/// - `log_probs`: `[batch, seq, vocab]` (already aligned with `labels`)
/// - `labels`: `[batch, seq]`
/// - returns: `[batch * seq]`
///
/// # Errors
///
/// Returns [`LensError::Data`] if the batch/sequence axes disagree.
pub fn cross_entropy(log_probs: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = log_probs.dims3()?;
    if labels.dims() != [batch, seq_len] {
        return Err(LensError::Data(format!(
            "labels have shape {:?}, predictions have [{batch}, {seq_len}, _]",
            labels.dims()
        )));
    }

    let flat = log_probs.reshape((batch * seq_len, vocab))?.contiguous()?;
    let index = labels
        .to_dtype(DType::U32)?
        .reshape((batch * seq_len, 1))?
        .contiguous()?;
    Ok(flat.gather(&index, 1)?.squeeze(1)?.neg()?)
}

/// Shannon entropy `-Σ p log p` of each position's distribution.
///
/// # Shapes
/// - `log_probs`: `[..., vocab]`
/// - returns: `[...]`
///
/// # Errors
///
/// Returns [`LensError::Model`] on tensor failures.
pub fn entropy(log_probs: &Tensor) -> Result<Tensor> {
    Ok((log_probs.exp()? * log_probs)?.sum(D::Minus1)?.neg()?)
}

/// Forward KL divergence `Σ p_ref (log p_ref - log p)` per position.
///
/// # Shapes
/// - `reference`, `log_probs`: `[..., vocab]`
/// - returns: `[...]`
///
/// # Errors
///
/// Returns [`LensError::Model`] on shape mismatch.
pub fn kl_divergence(reference: &Tensor, log_probs: &Tensor) -> Result<Tensor> {
    Ok((reference.exp()? * (reference - log_probs)?)?.sum(D::Minus1)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
