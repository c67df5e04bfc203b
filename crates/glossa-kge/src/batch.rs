//! Sampled batches as index tensors.

use candle_core::{Device, Tensor};
use glossa_core::{BatchDescriptions, DescriptionBatch, SampledBatch, Triple};

use crate::error::{Error, Result};

/// Head, tail and relation indices of a list of triples, each shaped `[n]`.
#[derive(Debug, Clone)]
pub struct TripleTensors {
    pub heads: Tensor,
    pub tails: Tensor,
    pub relations: Tensor,
}

impl TripleTensors {
    pub fn new(triples: &[Triple], device: &Device) -> Result<Self> {
        let n = triples.len();
        let heads: Vec<u32> = triples.iter().map(|t| t.head).collect();
        let tails: Vec<u32> = triples.iter().map(|t| t.tail).collect();
        let relations: Vec<u32> = triples.iter().map(|t| t.relation).collect();
        Ok(Self {
            heads: Tensor::from_vec(heads, n, device)?,
            tails: Tensor::from_vec(tails, n, device)?,
            relations: Tensor::from_vec(relations, n, device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.heads.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Description tokens of the entities in a batch.
#[derive(Debug, Clone)]
pub struct DescriptionTensors {
    /// `[U, L]` token IDs.
    pub token_ids: Tensor,
    /// `[U, L]`, 1 for real tokens.
    pub attention_mask: Tensor,
    /// Positives with entity IDs replaced by description rows.
    pub positives: TripleTensors,
    /// Negatives with entity IDs replaced by description rows.
    pub negatives: TripleTensors,
}

/// A [`SampledBatch`] moved onto a device.
#[derive(Debug, Clone)]
pub struct SampledTensors {
    pub positives: TripleTensors,
    pub negatives: TripleTensors,
    pub ratio: usize,
    pub descriptions: Option<DescriptionTensors>,
}

impl SampledTensors {
    pub fn from_batch(batch: &SampledBatch, device: &Device) -> Result<Self> {
        if batch.positives.is_empty() || batch.negatives.is_empty() {
            return Err(Error::BatchShape(format!(
                "batch has {} positives and {} negatives",
                batch.positives.len(),
                batch.negatives.len()
            )));
        }
        let descriptions = batch
            .descriptions
            .as_ref()
            .map(|d| local_descriptions(d, batch, device))
            .transpose()?;
        Ok(Self {
            positives: TripleTensors::new(&batch.positives, device)?,
            negatives: TripleTensors::new(&batch.negatives, device)?,
            ratio: batch.ratio,
            descriptions,
        })
    }
}

/// Token and mask tensors for a padded description batch.
pub fn description_tensors(batch: &DescriptionBatch, device: &Device) -> Result<(Tensor, Tensor)> {
    let shape = (batch.batch_size(), batch.seq_len());
    let ids: Vec<u32> = batch.token_ids.iter().copied().collect();
    let mask: Vec<u32> = batch.attention_mask.iter().copied().collect();
    Ok((
        Tensor::from_vec(ids, shape, device)?,
        Tensor::from_vec(mask, shape, device)?,
    ))
}

fn local_descriptions(
    descriptions: &BatchDescriptions,
    batch: &SampledBatch,
    device: &Device,
) -> Result<DescriptionTensors> {
    let remap = |triples: &[Triple]| -> Result<Vec<Triple>> {
        triples
            .iter()
            .map(|t| {
                let head = row(descriptions, t.head)?;
                let tail = row(descriptions, t.tail)?;
                Ok(Triple::new(head, tail, t.relation))
            })
            .collect()
    };
    let (token_ids, attention_mask) = description_tensors(&descriptions.batch, device)?;
    Ok(DescriptionTensors {
        token_ids,
        attention_mask,
        positives: TripleTensors::new(&remap(&batch.positives)?, device)?,
        negatives: TripleTensors::new(&remap(&batch.negatives)?, device)?,
    })
}

fn row(descriptions: &BatchDescriptions, entity: u32) -> Result<u32> {
    descriptions
        .position(entity)
        .map(|p| p as u32)
        .ok_or_else(|| Error::BatchShape(format!("entity {entity} has no description row in its batch")))
}
