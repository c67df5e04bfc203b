//! Translation-based energy models.
//!
//! Every model scores a triple with `||h + r - t||_p`; they differ in where
//! the entity vectors come from:
//!
//! | Model | Entity vectors | Relation vectors |
//! |-------|----------------|------------------|
//! | [`TransE`] | learned table | learned table |
//! | [`TextTransE`] | projected description encodings | learned table |
//! | [`RelTransE`] | supplied by the caller | learned table |
//!
//! All three share [`EnergyModel`], so trainers and the evaluator accept any
//! of them. Models that need descriptions also implement [`EntityEncoder`],
//! which is what the [`crate::cache`] builder uses to precompute a full entity
//! table before ranking.

mod aligned;
mod text_transe;
mod transe;

pub use aligned::{EntityAligner, RelTransE};
pub use text_transe::TextTransE;
pub use transe::TransE;

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::Init;
use serde::{Deserialize, Serialize};

use crate::batch::{SampledTensors, TripleTensors};
use crate::energy::{energy, margin_ranking_loss, norm, PNorm};
use crate::error::{Error, Result};
use crate::params::ParameterStore;

/// Shape and loss settings shared by all models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding dimension (default: 100).
    pub dim: usize,
    /// Ranking margin (default: 5.0).
    pub margin: f64,
    /// Residual norm (default: L1).
    pub p_norm: PNorm,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 100,
            margin: 5.0,
            p_norm: PNorm::L1,
        }
    }
}

impl ModelConfig {
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_p_norm(mut self, p_norm: PNorm) -> Self {
        self.p_norm = p_norm;
        self
    }

    /// Uniform(-6/sqrt(dim), 6/sqrt(dim)), the TransE initialisation.
    pub(crate) fn uniform_init(&self) -> Init {
        let bound = 6.0 / (self.dim as f64).sqrt();
        Init::Uniform {
            lo: -bound,
            up: bound,
        }
    }
}

/// A learning-rate group: variables that share one optimizer setting.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: String,
    pub vars: Vec<candle_core::Var>,
    pub lr: f64,
}

/// Learning rates handed to [`EnergyModel::param_groups`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    /// Text encoder weights (default: 2e-5).
    pub encoder: f64,
    /// Everything else (default: 1e-4).
    pub head: f64,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            encoder: 2e-5,
            head: 1e-4,
        }
    }
}

/// The capability shared by all translation models.
pub trait EnergyModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    fn num_relations(&self) -> usize;

    /// Parameters updated when training this model.
    fn params(&self) -> &Arc<ParameterStore>;

    /// Learned entity table `[N, dim]`; text models return [`Error::MissingCache`].
    fn entity_table(&self) -> Result<Tensor>;

    /// Relation vectors `[n, dim]` for relation indices `[n]`.
    fn relation_embeddings(&self, relations: &Tensor) -> Result<Tensor>;

    /// Margin ranking loss for a batch.
    ///
    /// `table` overrides where entity vectors come from; without it the model
    /// uses its own source (a learned table or the batch descriptions).
    fn forward(&self, batch: &SampledTensors, table: Option<&Tensor>) -> Result<Tensor>;

    /// Variables grouped by learning rate.
    fn param_groups(&self, rates: &LearningRates) -> Vec<ParamGroup>;

    /// Description encoder, for models whose entity vectors come from text.
    fn entity_encoder(&self) -> Option<&dyn EntityEncoder> {
        None
    }

    fn dim(&self) -> usize {
        self.config().dim
    }

    fn p_norm(&self) -> PNorm {
        self.config().p_norm
    }

    fn margin(&self) -> f64 {
        self.config().margin
    }

    /// Whether ranking needs an [`crate::EntityEmbeddingCache`].
    fn requires_text(&self) -> bool {
        self.entity_encoder().is_some()
    }

    /// Energies `[n]` of triples, looking entities up in `table` or the model's own table.
    fn energy(&self, triples: &TripleTensors, table: Option<&Tensor>) -> Result<Tensor> {
        let owned;
        let table = match table {
            Some(t) => t,
            None => {
                owned = self.entity_table()?;
                &owned
            }
        };
        let heads = table.index_select(&triples.heads, 0)?;
        let tails = table.index_select(&triples.tails, 0)?;
        let relations = self.relation_embeddings(&triples.relations)?;
        energy(&heads, &relations, &tails, self.p_norm())
    }

    /// Energies `[B, C]` of `(h_i, r_i, c_j)` for every candidate row `c_j`.
    fn score_tail_candidates(
        &self,
        heads: &Tensor,
        relations: &Tensor,
        table: &Tensor,
        candidates: &Tensor,
    ) -> Result<Tensor> {
        let translated = table
            .index_select(heads, 0)?
            .add(&self.relation_embeddings(relations)?)?
            .unsqueeze(1)?; // [B, 1, d]
        let residual = translated.broadcast_sub(&candidates.unsqueeze(0)?)?;
        norm(&residual, self.p_norm())
    }

    /// Energies `[B, C]` of `(c_j, r_i, t_i)` for every candidate row `c_j`.
    fn score_head_candidates(
        &self,
        tails: &Tensor,
        relations: &Tensor,
        table: &Tensor,
        candidates: &Tensor,
    ) -> Result<Tensor> {
        let offset = self
            .relation_embeddings(relations)?
            .sub(&table.index_select(tails, 0)?)?
            .unsqueeze(1)?; // [B, 1, d]
        let residual = candidates.unsqueeze(0)?.broadcast_add(&offset)?;
        norm(&residual, self.p_norm())
    }

    /// The `k` most plausible tails for `(head, relation, ?)`, lowest energy first.
    fn predict_tails(
        &self,
        head: u32,
        relation: u32,
        table: &Tensor,
        k: usize,
    ) -> Result<Vec<(u32, f32)>> {
        let device = table.device();
        let energies = self
            .score_tail_candidates(
                &Tensor::new(&[head], device)?,
                &Tensor::new(&[relation], device)?,
                table,
                table,
            )?
            .squeeze(0)?
            .to_vec1::<f32>()?;
        let mut ranked: Vec<(u32, f32)> = energies
            .into_iter()
            .enumerate()
            .map(|(i, e)| (i as u32, e))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked.truncate(k);
        Ok(ranked)
    }
}

/// Turns description tokens into entity vectors.
pub trait EntityEncoder: Send + Sync {
    /// Width of the produced vectors.
    fn embedding_dim(&self) -> usize;

    /// `[B, L]` tokens and mask to `[B, embedding_dim]`.
    fn encode_entities(&self, token_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Parameter version the encodings reflect.
    fn version(&self) -> u64;
}

/// Margin loss of positives against negatives, with entity vectors from `table`.
pub(crate) fn translation_loss<M: EnergyModel + ?Sized>(
    model: &M,
    table: &Tensor,
    positives: &TripleTensors,
    negatives: &TripleTensors,
) -> Result<Tensor> {
    let pos = model.energy(positives, Some(table))?;
    let neg = model.energy(negatives, Some(table))?;
    margin_ranking_loss(&pos, &neg, model.margin())
}

pub(crate) fn missing_table(model: &str) -> Error {
    Error::Unsupported(format!("{model} has no entity table of its own"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_bound_scales_with_dim() {
        let config = ModelConfig::default().with_dim(36);
        match config.uniform_init() {
            Init::Uniform { lo, up } => {
                assert!((up - 1.0).abs() < 1e-12);
                assert!((lo + 1.0).abs() < 1e-12);
            }
            other => panic!("unexpected init {other:?}"),
        }
    }
}
