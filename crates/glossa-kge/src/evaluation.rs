//! Rank-based link prediction evaluation.
//!
//! For every test triple (h, r, t) the evaluator scores all `(h, r, ?)` and
//! `(?, r, t)` candidates and records where the true entity lands:
//!
//! ```text
//! rank = 1 + |{ candidates with strictly lower energy than the true entity }|
//! ```
//!
//! Ties therefore resolve in the true entity's favour.
//!
//! # Raw vs Filtered
//!
//! | Protocol | Candidates compared | Notes |
//! |----------|---------------------|-------|
//! | Raw | all entities | default; other true triples count against the target |
//! | Filtered | all entities minus known true triples | standard benchmark setting |
//!
//! # Metrics
//!
//! | Metric | Range | Description |
//! |--------|-------|-------------|
//! | MRR | (0, 1] | mean of 1/rank |
//! | MR | [1, N] | mean rank |
//! | Hits@k | [0, 1] | fraction with rank <= k |
//!
//! Head and tail ranks are pooled and averaged globally, so the result does
//! not depend on batch size or triple order.

use std::sync::Arc;

use candle_core::Tensor;
use glossa_core::{GraphDataset, Triple, TripleIndex};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::batch::TripleTensors;
use crate::cache::EntityEmbeddingCache;
use crate::error::{Error, Result};
use crate::models::EnergyModel;

/// Rank-based evaluation results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankMetrics {
    /// Mean Reciprocal Rank: E\[1/rank\]
    pub mrr: f64,
    /// Mean Rank: E\[rank\]
    pub mr: f64,
    /// Hits@1: P(rank = 1)
    pub hits_at_1: f64,
    /// Hits@3: P(rank <= 3)
    pub hits_at_3: f64,
    /// Hits@10: P(rank <= 10)
    pub hits_at_10: f64,
    /// Number of ranks (two per evaluated triple).
    pub num_ranks: usize,
}

impl RankMetrics {
    pub fn from_ranks(ranks: &[usize]) -> Self {
        if ranks.is_empty() {
            return Self::default();
        }
        let n = ranks.len() as f64;
        let hits = |k: usize| ranks.iter().filter(|&&r| r <= k).count() as f64 / n;
        Self {
            mrr: ranks.iter().map(|&r| 1.0 / r as f64).sum::<f64>() / n,
            mr: ranks.iter().map(|&r| r as f64).sum::<f64>() / n,
            hits_at_1: hits(1),
            hits_at_3: hits(3),
            hits_at_10: hits(10),
            num_ranks: ranks.len(),
        }
    }

    /// Rank-weighted combination of partial results.
    pub fn merge(metrics: &[Self]) -> Self {
        let total: usize = metrics.iter().map(|m| m.num_ranks).sum();
        if total == 0 {
            return Self::default();
        }
        let weighted = |f: fn(&Self) -> f64| {
            metrics
                .iter()
                .map(|m| f(m) * m.num_ranks as f64)
                .sum::<f64>()
                / total as f64
        };
        Self {
            mrr: weighted(|m| m.mrr),
            mr: weighted(|m| m.mr),
            hits_at_1: weighted(|m| m.hits_at_1),
            hits_at_3: weighted(|m| m.hits_at_3),
            hits_at_10: weighted(|m| m.hits_at_10),
            num_ranks: total,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "MRR: {:.4} | MR: {:.1} | H@1: {:.3} | H@3: {:.3} | H@10: {:.3} (n={})",
            self.mrr, self.mr, self.hits_at_1, self.hits_at_3, self.hits_at_10, self.num_ranks
        )
    }
}

/// `1 +` the number of energies strictly below `target`.
pub fn compute_rank(target: f32, energies: &[f32]) -> usize {
    1 + energies.iter().filter(|&&e| e < target).count()
}

/// Which candidates compete with the true entity.
#[derive(Debug, Clone, Default)]
pub enum RankingProtocol {
    #[default]
    Raw,
    /// Skip candidates that form a known true triple.
    Filtered(Arc<TripleIndex>),
}

/// Evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Test triples scored per step (default: 128).
    pub batch_size: usize,
    /// Candidate entities per scoring call; bounds the `[B, C, dim]` residual (default: 4096).
    pub candidate_chunk: usize,
    /// Stop after this many batches (default: all).
    pub max_batches: Option<usize>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            candidate_chunk: 4096,
            max_batches: None,
        }
    }
}

impl EvalConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_candidate_chunk(mut self, candidate_chunk: usize) -> Self {
        self.candidate_chunk = candidate_chunk;
        self
    }

    pub fn with_max_batches(mut self, max_batches: Option<usize>) -> Self {
        self.max_batches = max_batches;
        self
    }
}

/// Link prediction evaluator.
///
/// # Example
///
/// ```rust,ignore
/// let evaluator = Evaluator::new(EvalConfig::default());
/// let metrics = evaluator.evaluate(&model, &valid, None)?;
/// println!("{}", metrics.summary());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    config: EvalConfig,
    protocol: RankingProtocol,
}

impl Evaluator {
    pub fn new(config: EvalConfig) -> Self {
        Self {
            config,
            protocol: RankingProtocol::Raw,
        }
    }

    pub fn with_protocol(mut self, protocol: RankingProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Rank every triple of `dataset` (up to `max_batches` batches).
    ///
    /// Text models need `cache`, built at the model's current parameter version.
    pub fn evaluate(
        &self,
        model: &dyn EnergyModel,
        dataset: &GraphDataset,
        cache: Option<&EntityEmbeddingCache>,
    ) -> Result<RankMetrics> {
        if dataset.is_empty() {
            return Err(Error::EmptyLoader("evaluation split has no triples".into()));
        }
        if self.config.batch_size == 0 {
            return Err(Error::BatchShape("eval batch_size must be at least 1".into()));
        }
        let table = match cache {
            Some(cache) => cache.validate(model.params().version())?.clone(),
            None => model.entity_table()?,
        };

        let mut ranks = Vec::with_capacity(2 * dataset.len());
        for (i, batch) in dataset.triples().chunks(self.config.batch_size).enumerate() {
            if self.config.max_batches.is_some_and(|max| i >= max) {
                break;
            }
            ranks.extend(self.rank_batch(model, batch, &table)?);
        }
        if ranks.is_empty() {
            return Err(Error::EmptyLoader("no evaluation batches were scored".into()));
        }
        Ok(RankMetrics::from_ranks(&ranks))
    }

    /// Tail ranks followed by head ranks for `triples`.
    pub fn rank_batch(
        &self,
        model: &dyn EnergyModel,
        triples: &[Triple],
        table: &Tensor,
    ) -> Result<Vec<usize>> {
        let (num_entities, _) = table.dims2()?;
        let index = TripleTensors::new(triples, table.device())?;
        let chunk = self.config.candidate_chunk.max(1);

        let mut tail_parts = Vec::new();
        let mut head_parts = Vec::new();
        for start in (0..num_entities).step_by(chunk) {
            let candidates = table.narrow(0, start, chunk.min(num_entities - start))?;
            tail_parts.push(model.score_tail_candidates(
                &index.heads,
                &index.relations,
                table,
                &candidates,
            )?);
            head_parts.push(model.score_head_candidates(
                &index.tails,
                &index.relations,
                table,
                &candidates,
            )?);
        }
        let tail_rows = Tensor::cat(&tail_parts, 1)?.to_vec2::<f32>()?;
        let head_rows = Tensor::cat(&head_parts, 1)?.to_vec2::<f32>()?;

        let tail_ranks = triples
            .par_iter()
            .zip(tail_rows.par_iter())
            .map(|(triple, row)| self.rank(row, triple.tail, |c| triple.with_tail(c)));
        let head_ranks = triples
            .par_iter()
            .zip(head_rows.par_iter())
            .map(|(triple, row)| self.rank(row, triple.head, |c| triple.with_head(c)));
        Ok(tail_ranks.chain(head_ranks).collect())
    }

    fn rank(&self, energies: &[f32], target: u32, corrupt: impl Fn(u32) -> Triple) -> usize {
        let target_energy = energies[target as usize];
        match &self.protocol {
            RankingProtocol::Raw => compute_rank(target_energy, energies),
            RankingProtocol::Filtered(known) => {
                1 + energies
                    .iter()
                    .enumerate()
                    .filter(|&(c, &e)| {
                        let c = c as u32;
                        e < target_energy && c != target && !known.contains(&corrupt(c))
                    })
                    .count()
            }
        }
    }
}
