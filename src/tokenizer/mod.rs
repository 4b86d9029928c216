// SPDX-License-Identifier: MIT OR Apache-2.0

//! `HuggingFace` tokenizer wrapper used to build token datasets from text.
//!
//! [`LensTokenizer`] adds end-of-sequence discovery on top of the
//! `tokenizers` crate, since documents are joined with EOS before being
//! chunked into fixed-length rows.

use std::path::Path;

use crate::error::{LensError, Result};

/// Candidate EOS spellings, tried in order.
const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<eos>",
    "<|im_end|>",
];

/// A `HuggingFace` tokenizer with its end-of-sequence token.
///
/// # Example
///
/// ```no_run
/// use candle_tuned_lens::LensTokenizer;
///
/// # fn main() -> candle_tuned_lens::Result<()> {
/// let tok = LensTokenizer::from_file("tokenizer.json")?;
/// let ids = tok.encode_raw("fn main()")?;
/// assert!(!ids.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct LensTokenizer {
    inner: Box<tokenizers::Tokenizer>,
    eos_token_id: Option<u32>,
}

impl LensTokenizer {
    /// Load a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            LensError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::from_hf(tok))
    }

    /// Load the tokenizer of a model: `tokenizer.json` inside a local
    /// snapshot directory, or fetched from the hub by model ID.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Download`] if the file cannot be fetched and
    /// [`LensError::Tokenizer`] if it cannot be parsed.
    #[cfg(feature = "transformer")]
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let local = Path::new(model_id);
        if local.is_dir() {
            return Self::from_file(local.join("tokenizer.json"));
        }
        let api = hf_hub::api::sync::Api::new().map_err(|e| LensError::Download(e.to_string()))?;
        let path = api
            .model(model_id.to_string())
            .get("tokenizer.json")
            .map_err(|e| LensError::Download(format!("tokenizer.json: {e}")))?;
        Self::from_file(path)
    }

    /// Wrap an already-loaded tokenizer, detecting its EOS token.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|tok| tokenizer.token_to_id(tok));
        Self {
            inner: Box::new(tokenizer),
            eos_token_id,
        }
    }

    /// Override the detected EOS token.
    #[must_use]
    pub fn with_eos_token_id(mut self, id: Option<u32>) -> Self {
        self.eos_token_id = id;
        self
    }

    /// The EOS token, if one was found.
    #[must_use]
    pub const fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// Encode text, adding the tokenizer's configured special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, true)
    }

    /// Encode text **without** special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, false)
    }

    fn encode_with(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| LensError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to a string.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| LensError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Vocabulary size, added tokens included.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl std::fmt::Debug for LensTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("eos_token_id", &self.eos_token_id)
            .finish_non_exhaustive()
    }
}
