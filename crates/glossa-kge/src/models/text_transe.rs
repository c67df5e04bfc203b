use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::{linear, Embedding, Linear, Module};

use super::{
    translation_loss, EnergyModel, EntityEncoder, LearningRates, ModelConfig, ParamGroup,
};
use crate::batch::SampledTensors;
use crate::encoder::TextEncoder;
use crate::error::{Error, Result};
use crate::params::ParameterStore;

const ENCODER: &str = "encoder";
const PROJECTION: &str = "projection";
const RELATIONS: &str = "relations";

/// TransE whose entity vectors are projected description encodings.
///
/// There is no entity table: during training the entities of a batch are
/// encoded from the descriptions attached to it. Ranking against every
/// entity needs a precomputed [`crate::EntityEmbeddingCache`].
pub struct TextTransE<E> {
    encoder: E,
    projection: Linear,
    relations: Embedding,
    num_relations: usize,
    config: ModelConfig,
    params: Arc<ParameterStore>,
}

impl<E: TextEncoder> TextTransE<E> {
    /// Path prefix under which the encoder's variables are expected.
    pub const ENCODER_PREFIX: &'static str = ENCODER;

    /// `encoder` must have been built from `params.var_builder().pp(ENCODER_PREFIX)`
    /// for its weights to land in the encoder learning-rate group.
    pub fn new(
        encoder: E,
        num_relations: usize,
        config: ModelConfig,
        params: Arc<ParameterStore>,
    ) -> Result<Self> {
        let vb = params.var_builder();
        let projection = linear(encoder.hidden_size(), config.dim, vb.pp(PROJECTION))?;
        let relations = vb.get_with_hints(
            (num_relations, config.dim),
            RELATIONS,
            config.uniform_init(),
        )?;
        Ok(Self {
            encoder,
            projection,
            relations: Embedding::new(relations, config.dim),
            num_relations,
            config,
            params,
        })
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}

impl<E: TextEncoder> EntityEncoder for TextTransE<E> {
    fn embedding_dim(&self) -> usize {
        self.config.dim
    }

    fn encode_entities(&self, token_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let hidden = self.encoder.encode(token_ids, attention_mask)?;
        Ok(self.projection.forward(&hidden)?)
    }

    fn version(&self) -> u64 {
        self.params.version()
    }
}

impl<E: TextEncoder> EnergyModel for TextTransE<E> {
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
        Err(Error::MissingCache)
    }

    fn relation_embeddings(&self, relations: &Tensor) -> Result<Tensor> {
        Ok(self.relations.embeddings().index_select(relations, 0)?)
    }

    fn forward(&self, batch: &SampledTensors, table: Option<&Tensor>) -> Result<Tensor> {
        if let Some(table) = table {
            return translation_loss(self, table, &batch.positives, &batch.negatives);
        }
        let descriptions = batch.descriptions.as_ref().ok_or_else(|| {
            Error::BatchShape("text model needs batches with entity descriptions".into())
        })?;
        let encoded =
            self.encode_entities(&descriptions.token_ids, &descriptions.attention_mask)?;
        translation_loss(
            self,
            &encoded,
            &descriptions.positives,
            &descriptions.negatives,
        )
    }

    fn param_groups(&self, rates: &LearningRates) -> Vec<ParamGroup> {
        let mut head = self.params.vars_with_prefix(PROJECTION);
        head.extend(self.params.vars_with_prefix(RELATIONS));
        vec![
            ParamGroup {
                name: ENCODER.into(),
                vars: self.params.vars_with_prefix(ENCODER),
                lr: rates.encoder,
            },
            ParamGroup {
                name: "head".into(),
                vars: head,
                lr: rates.head,
            },
        ]
    }

    fn entity_encoder(&self) -> Option<&dyn EntityEncoder> {
        Some(self)
    }
}
