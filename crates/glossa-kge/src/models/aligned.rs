//! Entity-by-entity alignment of description encodings with summaries.
//!
//! The [`EntityAligner`] builds the whole entity table from fixed summary
//! vectors and splices in one text-derived row at a time. [`RelTransE`] only
//! learns relations and scores triples against that table.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::{linear, Embedding, Linear, Module};

use super::{missing_table, translation_loss, EnergyModel, LearningRates, ModelConfig, ParamGroup};
use crate::batch::SampledTensors;
use crate::encoder::TextEncoder;
use crate::error::{Error, Result};
use crate::params::ParameterStore;

const ALIGNER: &str = "aligner";
const GRAPH: &str = "graph";

/// TransE with learned relations and an externally supplied entity table.
pub struct RelTransE {
    relations: Embedding,
    num_relations: usize,
    config: ModelConfig,
    params: Arc<ParameterStore>,
}

impl RelTransE {
    pub fn new(num_relations: usize, config: ModelConfig, params: Arc<ParameterStore>) -> Result<Self> {
        let vb = params.var_builder().pp(GRAPH);
        let relations = vb.get_with_hints(
            (num_relations, config.dim),
            "relations",
            config.uniform_init(),
        )?;
        Ok(Self {
            relations: Embedding::new(relations, config.dim),
            num_relations,
            config,
            params,
        })
    }
}

impl EnergyModel for RelTransE {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn num_relations(&self) -> usize {
        self.num_relations
    }

    fn params(&self) -> &Arc<ParameterStore> {
        &self.params
    }

    fn entity_table(&self) -> Result<Tensor> {
        Err(missing_table("RelTransE"))
    }

    fn relation_embeddings(&self, relations: &Tensor) -> Result<Tensor> {
        Ok(self.relations.embeddings().index_select(relations, 0)?)
    }

    fn forward(&self, batch: &SampledTensors, table: Option<&Tensor>) -> Result<Tensor> {
        let table = table.ok_or_else(|| missing_table("RelTransE"))?;
        translation_loss(self, table, &batch.positives, &batch.negatives)
    }

    fn param_groups(&self, rates: &LearningRates) -> Vec<ParamGroup> {
        vec![ParamGroup {
            name: GRAPH.into(),
            vars: self.params.vars_with_prefix(GRAPH),
            lr: rates.head,
        }]
    }
}

/// Fuses one entity's description encoding with every entity's summary vector.
pub struct EntityAligner<E> {
    encoder: E,
    text_projection: Linear,
    summary_projection: Linear,
    dim: usize,
    params: Arc<ParameterStore>,
}

impl<E: TextEncoder> EntityAligner<E> {
    /// Path prefix the encoder's variables should be created under.
    pub const ENCODER_PREFIX: &'static str = "aligner.encoder";

    pub fn new(
        encoder: E,
        summary_dim: usize,
        dim: usize,
        params: Arc<ParameterStore>,
    ) -> Result<Self> {
        let vb = params.var_builder().pp(ALIGNER);
        let text_projection = linear(encoder.hidden_size(), dim, vb.pp("text_projection"))?;
        let summary_projection = linear(summary_dim, dim, vb.pp("summary_projection"))?;
        Ok(Self {
            encoder,
            text_projection,
            summary_projection,
            dim,
            params,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Entity table `[N, dim]` in which row `entity` is
    /// `text_projection(encode(tokens)) + summary_projection(summary[entity])` and
    /// every other row is `summary_projection(summary[i])`.
    ///
    /// `token_ids`/`attention_mask` hold the single description `[1, L]`;
    /// `summaries` is `[N, summary_dim]` and is not trained.
    pub fn align(
        &self,
        entity: u32,
        token_ids: &Tensor,
        attention_mask: &Tensor,
        summaries: &Tensor,
    ) -> Result<Tensor> {
        let (n, _) = summaries.dims2()?;
        let e = entity as usize;
        if e >= n {
            return Err(Error::Data(glossa_core::Error::UnknownEntity {
                id: entity,
                num_entities: n,
            }));
        }
        let base = self.summary_projection.forward(summaries)?;
        let text = self
            .text_projection
            .forward(&self.encoder.encode(token_ids, attention_mask)?)?;
        let fused = (text + base.narrow(0, e, 1)?)?;

        let mut rows = Vec::with_capacity(3);
        if e > 0 {
            rows.push(base.narrow(0, 0, e)?);
        }
        rows.push(fused);
        if e + 1 < n {
            rows.push(base.narrow(0, e + 1, n - e - 1)?);
        }
        Ok(Tensor::cat(&rows, 0)?)
    }

    /// Variables of the aligner, encoder included.
    pub fn param_group(&self, lr: f64) -> ParamGroup {
        ParamGroup {
            name: ALIGNER.into(),
            vars: self.params.vars_with_prefix(ALIGNER),
            lr,
        }
    }
}
