// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-length token datasets and their batches.
//!
//! A [`TokenDataset`] holds rows of token IDs, all of one length. It is
//! shuffled deterministically by seed, sharded across ranks, and cut into
//! [`Batch`]es of `input_ids` tensors on the CPU; the evaluation loop moves
//! each batch to its device.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use crate::error::{LensError, Result};
use crate::tokenizer::LensTokenizer;

/// Name of the token-ID field of a batch.
pub const INPUT_IDS: &str = "input_ids";

/// A mapping from field name to tensor.
///
/// Every batch carries [`INPUT_IDS`], a `[batch, seq]` `U32` tensor.
#[derive(Debug, Clone)]
pub struct Batch {
    fields: BTreeMap<String, Tensor>,
}

impl Batch {
    /// A batch holding only `input_ids`.
    #[must_use]
    pub fn new(input_ids: Tensor) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(INPUT_IDS.to_owned(), input_ids);
        Self { fields }
    }

    /// Add or replace a field.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.fields.insert(name.into(), tensor);
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// The `[batch, seq]` token IDs.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Data`] if the field was removed or replaced by
    /// a tensor that is not two-dimensional.
    pub fn input_ids(&self) -> Result<&Tensor> {
        let ids = self
            .fields
            .get(INPUT_IDS)
            .ok_or_else(|| LensError::Data(format!("batch has no {INPUT_IDS}")))?;
        if ids.rank() != 2 {
            return Err(LensError::Data(format!(
                "{INPUT_IDS} must be [batch, seq], got {:?}",
                ids.dims()
            )));
        }
        Ok(ids)
    }

    /// Move every field to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if a transfer fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let fields = self
            .fields
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.to_device(device)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { fields })
    }

    /// Field names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// One line of a JSONL token file.
#[derive(Debug, Deserialize)]
struct Record {
    input_ids: Vec<u32>,
}

/// One line of a JSONL text file.
#[derive(Debug, Deserialize)]
struct TextRecord {
    text: String,
}

/// Parse every non-blank line of a JSONL file as `T`.
fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            LensError::Data(format!("{}:{}: {e}", path.display(), line_no + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Read the `text` field of every line of a JSONL file, for
/// [`TokenDataset::from_texts`].
///
/// # Errors
///
/// Returns [`LensError::Io`] if the file cannot be read and
/// [`LensError::Data`] for lines without a string `text` field.
pub fn read_texts_jsonl(path: &Path) -> Result<Vec<String>> {
    Ok(read_jsonl::<TextRecord>(path)?
        .into_iter()
        .map(|r| r.text)
        .collect())
}

/// Rows of token IDs sharing a single sequence length.
#[derive(Debug, Clone, Default)]
pub struct TokenDataset {
    rows: Vec<Vec<u32>>,
    seq_len: usize,
}

impl TokenDataset {
    /// Build a dataset from pre-tokenized rows.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Data`] if rows differ in length or are shorter
    /// than two tokens (next-token labels need at least one shift).
    pub fn from_rows(rows: Vec<Vec<u32>>) -> Result<Self> {
        let seq_len = rows.first().map_or(0, Vec::len);
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != seq_len) {
            return Err(LensError::Data(format!(
                "row {i} has {} tokens, row 0 has {seq_len}",
                row.len()
            )));
        }
        if !rows.is_empty() && seq_len < 2 {
            return Err(LensError::Data(format!(
                "sequences need at least 2 tokens, got {seq_len}"
            )));
        }
        Ok(Self { rows, seq_len })
    }

    /// Read a JSONL file with one `{"input_ids": [...]}` object per line.
    /// Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Io`] if the file cannot be read and
    /// [`LensError::Data`] for malformed lines or ragged rows.
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let rows: Vec<Vec<u32>> = read_jsonl::<Record>(path)?
            .into_iter()
            .map(|r| r.input_ids)
            .collect();
        tracing::debug!(rows = rows.len(), path = %path.display(), "loaded token rows");
        Self::from_rows(rows)
    }

    /// Tokenize `texts`, join them with the tokenizer's EOS token, and cut
    /// the stream into rows of `seq_len` tokens. The incomplete tail is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Data`] if `seq_len < 2`, or
    /// [`LensError::Tokenizer`] if encoding fails.
    pub fn from_texts<I, S>(texts: I, tokenizer: &LensTokenizer, seq_len: usize) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if seq_len < 2 {
            return Err(LensError::Data(format!(
                "sequences need at least 2 tokens, got {seq_len}"
            )));
        }
        let mut tokens = Vec::new();
        for text in texts {
            tokens.extend(tokenizer.encode_raw(text.as_ref())?);
            if let Some(eos) = tokenizer.eos_token_id() {
                tokens.push(eos);
            }
        }
        let rows: Vec<Vec<u32>> = tokens.chunks_exact(seq_len).map(<[u32]>::to_vec).collect();
        tracing::debug!(
            tokens = tokens.len(),
            rows = rows.len(),
            seq_len,
            "chunked text dataset"
        );
        Ok(Self { rows, seq_len })
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the dataset has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Tokens per row (zero for an empty dataset).
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// The rows, in order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    /// A copy with rows permuted by a `StdRng` seeded with `seed`.
    #[must_use]
    pub fn shuffle(&self, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut rows = self.rows.clone();
        rows.shuffle(&mut rng);
        Self {
            rows,
            seq_len: self.seq_len,
        }
    }

    /// Rows `rank, rank + world_size, ...`. Shards of distinct ranks are
    /// disjoint and together cover the dataset.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `world_size == 0` or
    /// `rank >= world_size`.
    pub fn shard(&self, rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(LensError::Config(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        let rows = self
            .rows
            .iter()
            .skip(rank)
            .step_by(world_size)
            .cloned()
            .collect();
        Ok(Self {
            rows,
            seq_len: self.seq_len,
        })
    }

    /// Number of batches of `batch_size` rows, counting a short last batch.
    #[must_use]
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.rows.len().div_ceil(batch_size)
        }
    }

    /// Iterate over consecutive batches of `batch_size` rows on the CPU.
    /// The last batch may be short.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `batch_size == 0`.
    pub fn batches(&self, batch_size: usize) -> Result<impl Iterator<Item = Result<Batch>> + '_> {
        if batch_size == 0 {
            return Err(LensError::Config("batch size must be positive".into()));
        }
        let seq_len = self.seq_len;
        Ok(self.rows.chunks(batch_size).map(move |chunk| {
            let data: Vec<u32> = chunk.concat();
            let ids = Tensor::from_vec(data, (chunk.len(), seq_len), &Device::Cpu)?;
            Ok(Batch::new(ids))
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::tokenizer::tests::word_tokenizer;

    fn dataset(n: u32) -> TokenDataset {
        TokenDataset::from_rows((0..n).map(|i| vec![i, i + 100, i + 200]).collect()).unwrap()
    }

    fn first_tokens(data: &TokenDataset) -> Vec<u32> {
        data.rows().iter().map(|r| r[0]).collect()
    }

    #[test]
    fn rejects_ragged_and_short_rows() {
        assert!(matches!(
            TokenDataset::from_rows(vec![vec![1, 2, 3], vec![1, 2]]),
            Err(LensError::Data(_))
        ));
        assert!(matches!(
            TokenDataset::from_rows(vec![vec![1]]),
            Err(LensError::Data(_))
        ));
        assert!(TokenDataset::from_rows(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn shuffle_is_deterministic_permutation() {
        let data = dataset(20);
        let a = data.shuffle(42);
        let b = data.shuffle(42);
        assert_eq!(a.rows(), b.rows());
        assert_ne!(first_tokens(&a), first_tokens(&data));

        let mut sorted = first_tokens(&a);
        sorted.sort_unstable();
        assert_eq!(sorted, first_tokens(&data));
    }

    #[test]
    fn shards_are_disjoint_and_cover() {
        let data = dataset(7);
        let shard0 = data.shard(0, 3).unwrap();
        let shard1 = data.shard(1, 3).unwrap();
        let shard2 = data.shard(2, 3).unwrap();
        assert_eq!(first_tokens(&shard0), vec![0, 3, 6]);
        assert_eq!(first_tokens(&shard1), vec![1, 4]);
        assert_eq!(first_tokens(&shard2), vec![2, 5]);
        assert!(data.shard(3, 3).is_err());
    }

    #[test]
    fn batches_keep_order_and_short_tail() {
        let data = dataset(5);
        assert_eq!(data.num_batches(2), 3);

        let batches: Vec<Batch> = data.batches(2).unwrap().map(Result::unwrap).collect();
        assert_eq!(batches.len(), 3);
        let ids = batches[0].input_ids().unwrap();
        assert_eq!(ids.dims(), &[2, 3]);
        assert_eq!(
            ids.to_vec2::<u32>().unwrap(),
            vec![vec![0, 100, 200], vec![1, 101, 201]]
        );
        assert_eq!(batches[2].input_ids().unwrap().dims(), &[1, 3]);
        assert!(data.batches(0).is_err());
    }

    #[test]
    fn jsonl_skips_blank_lines_and_reports_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.jsonl");
        let mut f = std::fs::File::create(&good).unwrap();
        writeln!(f, r#"{{"input_ids": [1, 2, 3]}}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, r#"{{"input_ids": [4, 5, 6], "text": "ignored"}}"#).unwrap();
        drop(f);
        let data = TokenDataset::load_jsonl(&good).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.seq_len(), 3);

        let bad = dir.path().join("bad.jsonl");
        std::fs::write(&bad, "{\"tokens\": [1]}\n").unwrap();
        assert!(matches!(TokenDataset::load_jsonl(&bad), Err(LensError::Data(_))));
    }

    #[test]
    fn text_jsonl_reads_text_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("texts.jsonl");
        std::fs::write(&path, "{\"text\": \"the cat\"}\n{\"text\": \"sat\", \"id\": 7}\n").unwrap();
        assert_eq!(read_texts_jsonl(&path).unwrap(), vec!["the cat", "sat"]);
    }

    #[test]
    fn texts_are_joined_with_eos_and_chunked() {
        let tok = word_tokenizer();
        // the cat </s> sat on mat </s> -> [2, 3, 1, 4, 5, 6, 1]
        let data = TokenDataset::from_texts(["the cat", "sat on mat"], &tok, 3).unwrap();
        assert_eq!(data.rows(), &[vec![2, 3, 1], vec![4, 5, 6]]);
        assert!(TokenDataset::from_texts(["the"], &tok, 1).is_err());
    }

    #[test]
    fn batch_moves_between_devices() {
        let data = dataset(1);
        let batch = data.batches(1).unwrap().next().unwrap().unwrap();
        let moved = batch.to_device(&Device::Cpu).unwrap();
        assert_eq!(moved.names().collect::<Vec<_>>(), vec![INPUT_IDS]);
    }
}
