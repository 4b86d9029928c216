// SPDX-License-Identifier: MIT OR Apache-2.0

//! The tuned-lens evaluation loop.
//!
//! [`eval_loop`] runs a model over a shuffled dataset, decodes the hidden
//! state entering every block with both the tuned lens and the plain
//! unembedding, and writes per-batch metrics plus four running
//! accumulators over the full residual stream (final block output
//! included) under `<output or lens>/eval/rank_<rank>/`:
//!
//! - `batch_<n>.safetensors`: one [`BatchOutput`] per batch;
//! - `first_token_stats`, `delta_stats`, `stream_stats`: [`ResidualStats`];
//! - `logit_stats`: [`LogitStats`].

use std::path::{Path, PathBuf};

use candle_core::{Device, IndexOp};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::backend::ModelBackend;
use crate::data::{Batch, TokenDataset};
use crate::dist::DistContext;
use crate::error::{LensError, Result};
use crate::lens::TunedLens;
use crate::metrics::{cross_entropy, entropy, kl_divergence, log_softmax, shift_labels, shift_preds};
use crate::output::{BatchOutput, FINAL_LAYER, Metric};
use crate::stats::{LogitStats, ResidualStats};
use crate::stream::record_residual_stream;

/// File stem of the first-position hidden-state statistics.
pub const FIRST_TOKEN_STATS: &str = "first_token_stats";
/// File stem of the layer-to-layer update statistics.
pub const DELTA_STATS: &str = "delta_stats";
/// File stem of the hidden-state statistics over positions `1..`.
pub const STREAM_STATS: &str = "stream_stats";
/// File stem of the output-distribution statistics.
pub const LOGIT_STATS: &str = "logit_stats";

/// Run configuration.
///
/// Deserializes from partial JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Dataset shuffle seed.
    pub seed: u64,
    /// Rows per batch on each device.
    pub per_gpu_batch_size: usize,
    /// Stop after this many batches. `Some(0)` evaluates nothing.
    pub limit: Option<usize>,
    /// Output root. Falls back to [`lens`](Self::lens). `eval/` is
    /// appended even when this is set, so an explicit root never receives
    /// `rank_<k>` directories directly.
    pub output: Option<PathBuf>,
    /// Lens directory.
    pub lens: PathBuf,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
    /// Track full covariances in the residual statistics.
    pub track_covariance: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            per_gpu_batch_size: 1,
            limit: None,
            output: None,
            lens: PathBuf::from("."),
            show_progress: true,
            track_covariance: true,
        }
    }
}

impl EvalConfig {
    /// `<output or lens>/eval/rank_<rank>`.
    #[must_use]
    pub fn output_dir(&self, rank: usize) -> PathBuf {
        self.output
            .as_deref()
            .unwrap_or(&self.lens)
            .join("eval")
            .join(format!("rank_{rank}"))
    }
}

/// What a run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalReport {
    /// Directory holding every file written.
    pub output_dir: PathBuf,
    /// Number of `batch_<n>` files written.
    pub batches: usize,
}

/// The four accumulators of a run.
struct RunStats {
    first_token: ResidualStats,
    delta: ResidualStats,
    stream: ResidualStats,
    logits: LogitStats,
}

impl RunStats {
    const fn new(track_covariance: bool) -> Self {
        Self {
            first_token: ResidualStats::new(track_covariance),
            delta: ResidualStats::new(track_covariance),
            stream: ResidualStats::new(track_covariance),
            logits: LogitStats::new(),
        }
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let path = |stem: &str| dir.join(format!("{stem}.safetensors"));
        self.first_token.save(&path(FIRST_TOKEN_STATS))?;
        self.delta.save(&path(DELTA_STATS))?;
        self.stream.save(&path(STREAM_STATS))?;
        self.logits.save(&path(LOGIT_STATS))?;
        tracing::info!(
            dir = %dir.display(),
            samples = self.stream.n(),
            "wrote summary statistics"
        );
        Ok(())
    }
}

/// Evaluate `lens` against `model` on this rank's share of the data.
///
/// `model` and `lens` must already live on `device`; each batch is moved
/// there before the forward pass. The data is shuffled by `config.seed`
/// and is expected to be this rank's shard already.
///
/// # Errors
///
/// Returns [`LensError::Lens`] if the model has a different number of
/// blocks than the lens has translators, [`LensError::Data`] for
/// sequences shorter than two tokens, [`LensError::Io`] if the output
/// directory cannot be created, and propagates forward-pass, metric and
/// serialization errors unchanged.
pub fn eval_loop(
    config: &EvalConfig,
    model: &dyn ModelBackend,
    data: &TokenDataset,
    lens: &mut TunedLens,
    dist: &DistContext,
    device: &Device,
) -> Result<EvalReport> {
    let rank = dist.rank();
    let shuffled = data.shuffle(config.seed);
    lens.eval();

    let total = config
        .limit
        .unwrap_or_else(|| shuffled.num_batches(config.per_gpu_batch_size));

    let output_dir = config.output_dir(rank);
    std::fs::create_dir_all(&output_dir)?;

    tracing::info!(
        rank,
        world_size = dist.world_size(),
        rows = shuffled.len(),
        batches = total,
        output_dir = %output_dir.display(),
        "starting evaluation"
    );

    let progress = progress_bar(total, config.show_progress);
    let mut stats = RunStats::new(config.track_covariance);
    let mut written = 0_usize;

    let batches = shuffled
        .batches(config.per_gpu_batch_size)?
        .take(config.limit.unwrap_or(usize::MAX));
    for batch in batches {
        let batch = batch?.to_device(device)?;
        let output = evaluate_batch(model, lens, &batch, &mut stats)?;

        let path = output_dir.join(format!("batch_{written}.safetensors"));
        output.save(&path)?;
        tracing::debug!(batch = written, tensors = output.len(), "wrote batch metrics");

        written += 1;
        progress.inc(1);
    }
    progress.finish_and_clear();

    stats.save(&output_dir)?;
    tracing::info!(rank, batches = written, "evaluation finished");

    Ok(EvalReport {
        output_dir,
        batches: written,
    })
}

/// Metrics for one batch; folds the batch into `stats`.
fn evaluate_batch(
    model: &dyn ModelBackend,
    lens: &TunedLens,
    batch: &Batch,
    stats: &mut RunStats,
) -> Result<BatchOutput> {
    let input_ids = batch.input_ids()?;
    let seq_len = input_ids.dim(1)?;
    if seq_len < 2 {
        return Err(LensError::Data(format!(
            "sequences need at least 2 tokens, got {seq_len}"
        )));
    }

    // Embedding plus every block output; the last one has no translator.
    let (logits, stream) = record_residual_stream(model, input_ids, true)?;
    if stream.len() != lens.len() + 1 {
        return Err(LensError::Lens(format!(
            "model has {} blocks but the lens has {} translators",
            stream.len().saturating_sub(1),
            lens.len()
        )));
    }

    let final_lps = log_softmax(&logits)?;
    let labels = shift_labels(input_ids, 1)?;

    let mut output = BatchOutput::new();
    for (i, (hook, hidden)) in stream.iter().take(lens.len()).enumerate() {
        let name = hook.to_string();
        let lens_lps = log_softmax(&lens.forward(hidden, i)?)?;
        let baseline_lps = log_softmax(&lens.to_logits(hidden)?)?;

        output.insert(
            Metric::BaselineCe,
            name.as_str(),
            cross_entropy(&shift_preds(&baseline_lps, 1)?, &labels)?,
        );
        output.insert(Metric::BaselineEntropy, name.as_str(), entropy(&baseline_lps)?);
        output.insert(
            Metric::LensCe,
            name.as_str(),
            cross_entropy(&shift_preds(&lens_lps, 1)?, &labels)?,
        );
        output.insert(Metric::LensEntropy, name.as_str(), entropy(&lens_lps)?);
        output.insert(Metric::LensKl, name, kl_divergence(&final_lps, &lens_lps)?);
    }

    let first_tokens = stream.map(|h| Ok(h.i((.., 0))?))?;
    let rest = stream.map(|h| Ok(h.narrow(1, 1, seq_len - 1)?))?;

    stats.first_token.update(&first_tokens)?;
    stats.delta.update(&rest.residuals()?)?;
    stats.logits.update(&final_lps, true)?;
    stats.stream.update(&rest)?;

    output.insert(
        Metric::BaselineCe,
        FINAL_LAYER,
        cross_entropy(&shift_preds(&final_lps, 1)?, &labels)?,
    );
    output.insert(Metric::BaselineEntropy, FINAL_LAYER, entropy(&final_lps)?);
    Ok(output)
}

/// A progress bar over `total` batches, or a hidden one.
fn progress_bar(total: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(u64::try_from(total).unwrap_or(u64::MAX));
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})",
    ) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message("Evaluating");
    bar
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EvalConfig::default();
        assert_eq!(config.seed, 42);
        assert_eq!(config.per_gpu_batch_size, 1);
        assert_eq!(config.limit, None);
        assert!(config.show_progress);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EvalConfig =
            serde_json::from_str(r#"{"limit": 3, "lens": "lenses/gpt"}"#).unwrap();
        assert_eq!(config.limit, Some(3));
        assert_eq!(config.seed, 42);
        assert_eq!(config.lens, PathBuf::from("lenses/gpt"));
    }

    #[test]
    fn output_dir_prefers_output_over_lens() {
        let mut config = EvalConfig {
            lens: PathBuf::from("/lens"),
            ..EvalConfig::default()
        };
        assert_eq!(config.output_dir(2), PathBuf::from("/lens/eval/rank_2"));

        config.output = Some(PathBuf::from("/out"));
        assert_eq!(config.output_dir(0), PathBuf::from("/out/eval/rank_0"));
    }
}
