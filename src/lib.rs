// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-tuned-lens
//!
//! Tuned-lens evaluation for decoder-only language models in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A tuned lens attaches one learned affine translator to the hidden state
//! entering every transformer block and decodes it with the model's own
//! unembedding. [`eval_loop`] measures how well those early decodings match
//! the model's final distribution, against the plain logit lens as a
//! baseline, and accumulates running statistics of the residual stream.
//!
//! ## Pipeline
//!
//! 1. [`HookedModel`] (or any [`ModelBackend`]) runs a forward pass with a
//!    capture-only [`HookSpec`]; [`record_residual_stream`] turns the
//!    captures into a [`ResidualStream`].
//! 2. [`TunedLens`] decodes each layer; [`metrics`] compares the result
//!    with the final log-probabilities.
//! 3. [`BatchOutput`] and the [`ResidualStats`] / [`LogitStats`]
//!    accumulators are written as safetensors.
//!
//! ## Features
//!
//! - `transformer` (default): built-in `LLaMA`/`Qwen2`/Mistral backend and
//!   `HuggingFace` hub loading.
//! - `mmap`: memory-mapped weight loading.
//! - `cuda`: CUDA kernels.

#![warn(missing_docs)]

pub mod backend;
#[cfg(feature = "transformer")]
pub mod config;
pub mod data;
pub mod dist;
pub mod error;
pub mod eval;
pub mod hooks;
pub mod lens;
pub mod metrics;
pub mod output;
pub mod stats;
pub mod stream;
pub mod tokenizer;
#[cfg(feature = "transformer")]
pub mod transformer;

pub use backend::{HookedModel, ModelBackend};
#[cfg(feature = "transformer")]
pub use config::TransformerConfig;
pub use data::{Batch, TokenDataset};
pub use dist::DistContext;
pub use error::{LensError, Result};
pub use eval::{EvalConfig, EvalReport, eval_loop};
pub use hooks::{HookCache, HookPoint, HookSpec};
pub use lens::{LensConfig, TunedLens, Unembed};
pub use output::{BatchOutput, Metric};
pub use stats::{LogitStats, ResidualStats};
pub use stream::{ResidualStream, record_residual_stream};
pub use tokenizer::LensTokenizer;
#[cfg(feature = "transformer")]
pub use transformer::GenericTransformer;
