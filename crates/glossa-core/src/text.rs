//! Tokenized entity descriptions.
//!
//! Descriptions are tokenized once when the store is built and are read-only
//! afterwards, so a single store can be shared (behind an `Arc`) by every
//! split and every prefetch worker.
//!
//! The descriptions file has one record per line:
//!
//! ```text
//! Q42 Douglas Adams: Douglas Noel Adams was an English author ...
//! ```
//!
//! Everything after the entity ID (title and text) is tokenized.

use std::path::Path;

use ndarray::Array2;

use crate::catalog::{read_input, EntityId, GraphCatalog};
use crate::error::{Error, Result};

/// Turns a description into token IDs.
pub trait Tokenize: Send + Sync {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Token used to pad short sequences.
    fn pad_id(&self) -> u32 {
        0
    }
}

impl Tokenize for tokenizers::Tokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .encode(text, true)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn pad_id(&self) -> u32 {
        self.get_padding().map(|p| p.pad_id).unwrap_or(0)
    }
}

/// A padded batch of description tokens, shape `(batch, seq_len)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptionBatch {
    pub token_ids: Array2<u32>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Array2<u32>,
}

impl DescriptionBatch {
    pub fn batch_size(&self) -> usize {
        self.token_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.token_ids.ncols()
    }
}

/// Entity ID -> token sequence table.
#[derive(Debug, Clone)]
pub struct TextStore {
    tokens: Vec<Vec<u32>>,
    max_len: usize,
    pad_id: u32,
}

impl TextStore {
    /// Build from already tokenized sequences, one per entity ID.
    ///
    /// Sequences longer than `max_len` are truncated.
    pub fn from_token_ids(mut tokens: Vec<Vec<u32>>, max_len: usize, pad_id: u32) -> Self {
        for seq in &mut tokens {
            seq.truncate(max_len);
        }
        Self {
            tokens,
            max_len,
            pad_id,
        }
    }

    /// Load and tokenize a descriptions file.
    pub fn load(
        path: impl AsRef<Path>,
        catalog: &GraphCatalog,
        tokenizer: &dyn Tokenize,
        max_len: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = read_input(path)?;
        Self::from_descriptions(&text, catalog, tokenizer, max_len)
    }

    /// Tokenize description records held in memory.
    ///
    /// Records for entities missing from the catalog are skipped; entities
    /// without a record get an empty (padding-only) sequence.
    pub fn from_descriptions(
        text: &str,
        catalog: &GraphCatalog,
        tokenizer: &dyn Tokenize,
        max_len: usize,
    ) -> Result<Self> {
        let mut tokens: Vec<Option<Vec<u32>>> = vec![None; catalog.num_entities()];
        let mut skipped = 0usize;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, description) = line
                .split_once(char::is_whitespace)
                .unwrap_or((line, ""));
            let Some(id) = catalog.entity_id(name) else {
                skipped += 1;
                continue;
            };
            let slot = &mut tokens[id as usize];
            if slot.is_some() {
                tracing::warn!(entity = name, "duplicate description, keeping the first");
                continue;
            }
            *slot = Some(tokenizer.tokenize(description.trim())?);
        }

        if skipped > 0 {
            tracing::warn!(skipped, "descriptions for unknown entities were ignored");
        }
        let missing = tokens.iter().filter(|t| t.is_none()).count();
        tracing::info!(
            entities = catalog.num_entities(),
            missing,
            "tokenized entity descriptions"
        );

        Ok(Self::from_token_ids(
            tokens.into_iter().map(Option::unwrap_or_default).collect(),
            max_len,
            tokenizer.pad_id(),
        ))
    }

    pub fn num_entities(&self) -> usize {
        self.tokens.len()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Stored tokens for one entity.
    pub fn tokens(&self, id: EntityId) -> Option<&[u32]> {
        self.tokens.get(id as usize).map(Vec::as_slice)
    }

    /// Look up and pad descriptions for `ids`.
    ///
    /// The batch is as wide as the longest requested sequence (at least one
    /// column, so an all-empty batch is still a valid padding-only batch).
    pub fn get_entity_descriptions(&self, ids: &[EntityId]) -> Result<DescriptionBatch> {
        let seqs = ids
            .iter()
            .map(|&id| {
                self.tokens(id).ok_or(Error::UnknownEntity {
                    id,
                    num_entities: self.num_entities(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let seq_len = seqs.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
        let mut token_ids = Array2::from_elem((ids.len(), seq_len), self.pad_id);
        let mut attention_mask = Array2::zeros((ids.len(), seq_len));

        for (row, seq) in seqs.iter().enumerate() {
            for (col, &token) in seq.iter().enumerate() {
                token_ids[[row, col]] = token;
                attention_mask[[row, col]] = 1;
            }
        }

        Ok(DescriptionBatch {
            token_ids,
            attention_mask,
        })
    }
}
