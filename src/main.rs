// SPDX-License-Identifier: MIT OR Apache-2.0

//! `tuned-lens-eval`: evaluate a tuned lens on a token dataset.
//!
//! Launch one process per device with `RANK` / `LOCAL_RANK` /
//! `WORLD_SIZE` set (e.g. by `torchrun`) to split the data across ranks.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use candle_tuned_lens::data::read_texts_jsonl;
use candle_tuned_lens::{
    eval_loop, DistContext, EvalConfig, HookedModel, LensTokenizer, ModelBackend, TokenDataset,
    TunedLens,
};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tuned-lens-eval")]
#[command(about = "Evaluate a tuned lens against a model's final predictions")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (e.g. "Qwen/Qwen2.5-0.5B") or a local snapshot directory
    #[arg(short, long)]
    model: String,

    /// Lens directory (config.json + params.safetensors)
    #[arg(short, long)]
    lens: PathBuf,

    /// JSONL dataset: `{"input_ids": [...]}` per line, or `{"text": "..."}` with --text
    #[arg(short, long)]
    data: PathBuf,

    /// Treat --data as raw text to tokenize with the model's tokenizer
    #[arg(long)]
    text: bool,

    /// Tokens per row when tokenizing text
    #[arg(long, default_value_t = 2048)]
    seq_len: usize,

    /// Output root (defaults to the lens directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dataset shuffle seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Rows per batch on each device
    #[arg(long, default_value_t = 1)]
    per_gpu_batch_size: usize,

    /// Evaluate at most this many batches
    #[arg(long)]
    limit: Option<usize>,

    /// Decode with the model's unembedding only, ignoring --lens weights
    #[arg(long)]
    logit_lens: bool,

    /// Skip full covariance tracking in the residual statistics
    #[arg(long)]
    no_covariance: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dist = DistContext::from_env()?;
    let device = if cli.cpu {
        Device::Cpu
    } else {
        dist.device()?
    };
    info!(
        rank = dist.rank(),
        world_size = dist.world_size(),
        ?device,
        "process context"
    );

    info!("Loading model {}", cli.model);
    let model = HookedModel::from_pretrained(&cli.model, &device)
        .with_context(|| format!("loading model {}", cli.model))?;
    info!(
        "Model: {} layers, {} hidden, {} vocab",
        model.num_layers(),
        model.hidden_size(),
        model.vocab_size()
    );

    let mut lens = if cli.logit_lens {
        TunedLens::from_model(&model, &device, model.dtype())?
    } else {
        TunedLens::load(&cli.lens, &device, model.dtype())
            .with_context(|| format!("loading lens from {}", cli.lens.display()))?
    };

    let data = if cli.text {
        let tokenizer = LensTokenizer::from_pretrained(&cli.model)?;
        let texts = read_texts_jsonl(&cli.data)?;
        TokenDataset::from_texts(&texts, &tokenizer, cli.seq_len)?
    } else {
        TokenDataset::load_jsonl(&cli.data)
            .with_context(|| format!("loading dataset {}", cli.data.display()))?
    };
    let data = data.shard(dist.rank(), dist.world_size())?;
    info!(rows = data.len(), seq_len = data.seq_len(), "dataset shard");

    let config = EvalConfig {
        seed: cli.seed,
        per_gpu_batch_size: cli.per_gpu_batch_size,
        limit: cli.limit,
        output: cli.output,
        lens: cli.lens,
        show_progress: !cli.no_progress,
        track_covariance: !cli.no_covariance,
    };

    let report = eval_loop(&config, &model, &data, &mut lens, &dist, &device)?;
    info!(
        "Wrote {} batch files to {}",
        report.batches,
        report.output_dir.display()
    );
    Ok(())
}
