// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`ModelBackend`] is the trait every model implements to be evaluated
//! with a lens. [`HookedModel`] wraps a backend with device and dtype
//! metadata and knows how to load the built-in transformer.

use candle_core::{DType, Device, Tensor};

use crate::error::{LensError, Result};
use crate::hooks::{HookCache, HookSpec};
use crate::lens::Unembed;

// ---------------------------------------------------------------------------
// ModelBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for models with a hook-aware forward pass.
///
/// The caller lists the activations it wants in a [`HookSpec`]; the
/// backend returns a [`HookCache`] holding the logits plus those
/// activations. The spec is borrowed for one call only, so a backend
/// never keeps instrumentation around between forward passes.
pub trait ModelBackend: Send + Sync {
    /// Number of transformer blocks.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Forward pass with optional activation capture.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] with logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor operation failures.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Project hidden states to vocabulary logits through the final
    /// norm and LM head.
    ///
    /// # Shapes
    /// - `hidden`: `[..., hidden_size]`
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on shape mismatch.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;

    /// The model's own unembedding (final norm + vocabulary matrix).
    ///
    /// Used to initialise an identity lens from a model.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the backend does not expose it.
    fn unembed(&self) -> Result<Unembed> {
        Err(LensError::Hook(
            "unembed not supported for this backend".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// HookedModel
// ---------------------------------------------------------------------------

/// A backend together with the device and dtype it was loaded with.
pub struct HookedModel {
    // TRAIT_OBJECT: backends are chosen at load time
    backend: Box<dyn ModelBackend>,
    device: Device,
    dtype: DType,
}

impl HookedModel {
    /// Wrap an existing backend.
    #[must_use]
    pub fn new(backend: Box<dyn ModelBackend>, device: Device, dtype: DType) -> Self {
        Self {
            backend,
            device,
            dtype,
        }
    }

    /// Load a model from a `HuggingFace` model ID or a local snapshot
    /// directory onto `device`.
    ///
    /// # `DType` selection
    ///
    /// - **CUDA**: `BF16`
    /// - **CPU**: `F32`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Download`] if the files cannot be fetched,
    /// [`LensError::Config`] for unsupported models, and
    /// [`LensError::Model`] if weight loading fails.
    #[cfg(feature = "transformer")]
    pub fn from_pretrained(model_id: &str, device: &Device) -> Result<Self> {
        let local = std::path::Path::new(model_id);
        if local.is_dir() {
            return Self::from_local(local, device);
        }

        tracing::info!(model = model_id, "fetching model from the HuggingFace hub");
        let api = hf_hub::api::sync::Api::new().map_err(|e| LensError::Download(e.to_string()))?;
        let repo = api.model(model_id.to_string());

        let config_path = repo
            .get("config.json")
            .map_err(|e| LensError::Download(format!("config.json: {e}")))?;

        let weights_paths = match repo.get("model.safetensors.index.json") {
            Ok(index_path) => {
                let shards = shard_names(&index_path)?;
                let mut paths = Vec::with_capacity(shards.len());
                for shard in &shards {
                    let path = repo
                        .get(shard)
                        .map_err(|e| LensError::Download(format!("{shard}: {e}")))?;
                    paths.push(path);
                }
                paths
            }
            Err(_) => vec![repo
                .get("model.safetensors")
                .map_err(|e| LensError::Download(format!("model.safetensors: {e}")))?],
        };

        Self::from_files(&config_path, &weights_paths, device)
    }

    /// Load a model from a local snapshot directory containing
    /// `config.json` and `model.safetensors` (or a sharded index).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if required files are missing or the
    /// model type is unsupported, and [`LensError::Model`] on weight
    /// loading failures.
    #[cfg(feature = "transformer")]
    pub fn from_local(dir: &std::path::Path, device: &Device) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            return Err(LensError::Config(format!(
                "config.json not found in {}",
                dir.display()
            )));
        }

        let single = dir.join("model.safetensors");
        let weights_paths = if single.exists() {
            vec![single]
        } else {
            let index_path = dir.join("model.safetensors.index.json");
            if !index_path.exists() {
                return Err(LensError::Config(format!(
                    "no model.safetensors or index in {}",
                    dir.display()
                )));
            }
            shard_names(&index_path)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        };

        Self::from_files(&config_path, &weights_paths, device)
    }

    #[cfg(feature = "transformer")]
    fn from_files(
        config_path: &std::path::Path,
        weights_paths: &[std::path::PathBuf],
        device: &Device,
    ) -> Result<Self> {
        use crate::config::TransformerConfig;
        use crate::transformer::GenericTransformer;

        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| LensError::Config(format!("read config.json: {e}")))?;
        let json: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| LensError::Config(format!("parse config.json: {e}")))?;
        let config = TransformerConfig::from_hf_config(&json)?;

        tracing::info!(
            layers = config.num_layers,
            hidden = config.hidden_size,
            vocab = config.vocab_size,
            ?dtype,
            "loading transformer weights"
        );

        let vb = create_var_builder(weights_paths, dtype, device)?;
        let transformer = GenericTransformer::load(config, device, dtype, vb)?;

        Ok(Self::new(Box::new(transformer), device.clone(), dtype))
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// The dtype the weights were loaded in.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Access the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &dyn ModelBackend {
        &*self.backend
    }
}

impl ModelBackend for HookedModel {
    fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(input_ids, hooks)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        self.backend.project_to_vocab(hidden)
    }

    fn unembed(&self) -> Result<Unembed> {
        self.backend.unembed()
    }
}

// ---------------------------------------------------------------------------
// Weight loading helpers
// ---------------------------------------------------------------------------

/// Index structure for sharded safetensors models.
#[cfg(feature = "transformer")]
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name to shard filename.
    weight_map: std::collections::HashMap<String, String>,
}

/// Unique, sorted shard filenames listed by a safetensors index.
#[cfg(feature = "transformer")]
fn shard_names(index_path: &std::path::Path) -> Result<Vec<String>> {
    let index_str = std::fs::read_to_string(index_path)?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)
        .map_err(|e| LensError::Config(format!("parse index: {e}")))?;

    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Create a `VarBuilder` from safetensors file paths.
///
/// Buffered (safe) loading by default; the `mmap` feature switches to
/// memory-mapped loading, which also enables sharded checkpoints.
#[cfg(feature = "transformer")]
fn create_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

#[cfg(all(feature = "transformer", not(feature = "mmap")))]
fn buffered_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    if paths.len() > 1 {
        return Err(LensError::Config(
            "sharded models require the `mmap` feature".into(),
        ));
    }
    let path = paths
        .first()
        .ok_or_else(|| LensError::Config("no safetensors files".into()))?;
    let data = std::fs::read(path)?;
    Ok(candle_nn::VarBuilder::from_buffered_safetensors(
        data, dtype, device,
    )?)
}

/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(all(feature = "transformer", feature = "mmap"))]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}
