use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::Embedding;

use super::{translation_loss, EnergyModel, LearningRates, ModelConfig, ParamGroup};
use crate::batch::SampledTensors;
use crate::error::Result;
use crate::params::ParameterStore;

/// TransE with learned entity and relation tables (Bordes et al., 2013).
pub struct TransE {
    entities: Embedding,
    relations: Embedding,
    num_entities: usize,
    num_relations: usize,
    config: ModelConfig,
    params: Arc<ParameterStore>,
}

impl TransE {
    /// Creates `entities` and `relations` tables inside `params`.
    pub fn new(
        num_entities: usize,
        num_relations: usize,
        config: ModelConfig,
        params: Arc<ParameterStore>,
    ) -> Result<Self> {
        let vb = params.var_builder();
        let init = config.uniform_init();
        let entities = vb.get_with_hints((num_entities, config.dim), "entities", init)?;
        let relations = vb.get_with_hints((num_relations, config.dim), "relations", init)?;
        Ok(Self {
            entities: Embedding::new(entities, config.dim),
            relations: Embedding::new(relations, config.dim),
            num_entities,
            num_relations,
            config,
            params,
        })
    }

    pub fn num_entities(&self) -> usize {
        self.num_entities
    }
}

impl EnergyModel for TransE {
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
        Ok(self.entities.embeddings().clone())
    }

    fn relation_embeddings(&self, relations: &Tensor) -> Result<Tensor> {
        Ok(self.relations.embeddings().index_select(relations, 0)?)
    }

    fn forward(&self, batch: &SampledTensors, table: Option<&Tensor>) -> Result<Tensor> {
        let table = table.unwrap_or(self.entities.embeddings());
        translation_loss(self, table, &batch.positives, &batch.negatives)
    }

    fn param_groups(&self, rates: &LearningRates) -> Vec<ParamGroup> {
        vec![ParamGroup {
            name: "embeddings".into(),
            vars: self.params.all_vars(),
            lr: rates.head,
        }]
    }
}
