// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit-lens evaluation of a real checkpoint from the local `HuggingFace`
//! cache.
//!
//! Requires `Qwen/Qwen2.5-0.5B` to be downloaded:
//!
//! ```text
//! cargo test --test validate_lens -- --ignored
//! ```

#![cfg(feature = "transformer")]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    missing_docs
)]

use std::path::PathBuf;

use candle_core::Device;
use candle_tuned_lens::{
    eval_loop, BatchOutput, DistContext, EvalConfig, HookedModel, LensTokenizer, Metric,
    ModelBackend, TokenDataset, TunedLens,
};

const MODEL_ID: &str = "Qwen/Qwen2.5-0.5B";

const TEXTS: &[&str] = &[
    "The quick brown fox jumps over the lazy dog. The dog does not react.",
    "fn main() { println!(\"Hello, world!\"); }",
    "Paris is the capital of France, and Berlin is the capital of Germany.",
];

/// Find the `HuggingFace` cache directory.
fn hf_cache_dir() -> PathBuf {
    if let Ok(cache) = std::env::var("HF_HOME") {
        return PathBuf::from(cache).join("hub");
    }
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".cache").join("huggingface").join("hub");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache").join("huggingface").join("hub");
    }
    PathBuf::from(".cache/huggingface/hub")
}

fn find_snapshot(model_id: &str) -> Option<PathBuf> {
    let model_dir_name = format!("models--{}", model_id.replace('/', "--"));
    let snapshots_dir = hf_cache_dir().join(model_dir_name).join("snapshots");
    let entry = std::fs::read_dir(snapshots_dir).ok()?.next()?.ok()?;
    Some(entry.path())
}

#[test]
#[ignore = "requires Qwen/Qwen2.5-0.5B in the local HuggingFace cache"]
fn logit_lens_on_cached_model() {
    let Some(snapshot) = find_snapshot(MODEL_ID) else {
        eprintln!("SKIP: {MODEL_ID} not in cache");
        return;
    };
    let device = Device::Cpu;

    let model = HookedModel::from_local(&snapshot, &device).unwrap();
    let mut lens = TunedLens::from_model(&model, &device, model.dtype()).unwrap();
    assert_eq!(lens.len(), model.num_layers());

    let tokenizer = LensTokenizer::from_file(snapshot.join("tokenizer.json")).unwrap();
    let data = TokenDataset::from_texts(TEXTS, &tokenizer, 16).unwrap();
    assert!(!data.is_empty());

    let tmp = tempfile::tempdir().unwrap();
    let config = EvalConfig {
        output: Some(tmp.path().to_path_buf()),
        limit: Some(2),
        show_progress: false,
        track_covariance: false,
        ..EvalConfig::default()
    };
    let report = eval_loop(&config, &model, &data, &mut lens, &DistContext::single(), &device)
        .unwrap();
    assert_eq!(report.batches, 2);

    let output = BatchOutput::load(&report.output_dir.join("batch_0.safetensors"), &device).unwrap();
    let ln_v = (model.vocab_size() as f32).ln();
    let final_entropy: Vec<f32> = output
        .get(Metric::BaselineEntropy, "final")
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert!(final_entropy.iter().all(|h| (0.0..=ln_v + 1e-3).contains(h)));

    let kl_layers = output.layers(Metric::LensKl).unwrap();
    assert_eq!(kl_layers.len(), model.num_layers());
    for (layer, kl) in kl_layers {
        let kl: Vec<f32> = kl.flatten_all().unwrap().to_vec1().unwrap();
        assert!(
            kl.iter().all(|v| v.is_finite() && *v >= -1e-3),
            "{layer}: {kl:?}"
        );
    }
}
