//! Precomputed entity tables for text-derived embeddings.
//!
//! A text model cannot rank against all entities without encoding every
//! description first. [`EmbeddingCacheBuilder`] does that in ID-ordered
//! chunks, optionally in parallel, and stamps the result with the parameter
//! version it was built from. The evaluator refuses a cache whose version no
//! longer matches the model.

use candle_core::{Device, Tensor};
use glossa_core::TextStore;
use rayon::prelude::*;

use crate::batch::description_tensors;
use crate::encoder::TextEncoder;
use crate::error::{Error, Result};
use crate::models::EntityEncoder;

/// Detached `[N, dim]` entity table plus the parameter version it reflects.
#[derive(Debug, Clone)]
pub struct EntityEmbeddingCache {
    table: Tensor,
    version: u64,
}

impl EntityEmbeddingCache {
    pub fn new(table: Tensor, version: u64) -> Self {
        Self { table, version }
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_entities(&self) -> usize {
        self.table.dims().first().copied().unwrap_or(0)
    }

    /// The table, if it was built at parameter version `current`.
    pub fn validate(&self, current: u64) -> Result<&Tensor> {
        if self.version != current {
            return Err(Error::StaleCache {
                cached: self.version,
                current,
            });
        }
        Ok(&self.table)
    }
}

/// Encodes all descriptions of a [`TextStore`] into an entity table.
#[derive(Debug, Clone)]
pub struct EmbeddingCacheBuilder {
    chunk_size: usize,
    parallel: bool,
}

impl Default for EmbeddingCacheBuilder {
    fn default() -> Self {
        Self {
            chunk_size: 128,
            parallel: true,
        }
    }
}

impl EmbeddingCacheBuilder {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            ..Self::default()
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn build(
        &self,
        encoder: &dyn EntityEncoder,
        text: &TextStore,
        device: &Device,
    ) -> Result<EntityEmbeddingCache> {
        let version = encoder.version();
        let table = self.encode_all(text, device, |ids, mask| {
            encoder.encode_entities(ids, mask)
        })?;
        tracing::debug!(
            entities = text.num_entities(),
            version,
            "built entity embedding cache"
        );
        Ok(EntityEmbeddingCache::new(table, version))
    }

    /// Pooled encoder outputs `[N, hidden_size]` for every description, untrained.
    pub fn summaries<E: TextEncoder + ?Sized>(
        &self,
        encoder: &E,
        text: &TextStore,
        device: &Device,
    ) -> Result<Tensor> {
        self.encode_all(text, device, |ids, mask| encoder.encode(ids, mask))
    }

    fn encode_all<F>(&self, text: &TextStore, device: &Device, encode: F) -> Result<Tensor>
    where
        F: Fn(&Tensor, &Tensor) -> Result<Tensor> + Sync,
    {
        let n = text.num_entities();
        if n == 0 {
            return Err(Error::EmptyLoader("no entity descriptions to encode".into()));
        }
        let ranges: Vec<(u32, u32)> = (0..n)
            .step_by(self.chunk_size)
            .map(|start| (start as u32, (start + self.chunk_size).min(n) as u32))
            .collect();

        let encode_chunk = |&(start, end): &(u32, u32)| -> Result<Tensor> {
            let ids: Vec<u32> = (start..end).collect();
            let batch = text.get_entity_descriptions(&ids)?;
            let (token_ids, attention_mask) = description_tensors(&batch, device)?;
            Ok(encode(&token_ids, &attention_mask)?.detach())
        };

        let chunks: Vec<Tensor> = if self.parallel {
            ranges.par_iter().map(encode_chunk).collect::<Result<_>>()?
        } else {
            ranges.iter().map(encode_chunk).collect::<Result<_>>()?
        };
        let table = Tensor::cat(&chunks, 0)?;
        let rows = table.dims().first().copied().unwrap_or(0);
        if rows != n {
            return Err(Error::BatchShape(format!(
                "encoder returned {rows} rows for {n} entities"
            )));
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncoderConfig, MeanPoolEncoder};
    use crate::models::{ModelConfig, TextTransE};
    use crate::params::ParameterStore;
    use std::sync::Arc;

    fn store(n: usize) -> TextStore {
        TextStore::from_token_ids(
            (0..n).map(|i| vec![(i % 7) as u32 + 1; i % 4 + 1]).collect(),
            6,
            0,
        )
    }

    fn model() -> TextTransE<MeanPoolEncoder> {
        let params = Arc::new(ParameterStore::new(Device::Cpu));
        let encoder = MeanPoolEncoder::new(
            EncoderConfig::new(10).with_hidden_size(4),
            params.var_builder().pp(TextTransE::<MeanPoolEncoder>::ENCODER_PREFIX),
        )
        .unwrap();
        TextTransE::new(encoder, 1, ModelConfig::default().with_dim(3), params).unwrap()
    }

    #[test]
    fn test_chunking_does_not_change_table() {
        let model = model();
        let text = store(11);
        let small = EmbeddingCacheBuilder::new(3)
            .build(&model, &text, &Device::Cpu)
            .unwrap();
        let whole = EmbeddingCacheBuilder::new(64)
            .with_parallel(false)
            .build(&model, &text, &Device::Cpu)
            .unwrap();
        assert_eq!(small.num_entities(), 11);
        let a = small.table().to_vec2::<f32>().unwrap();
        let b = whole.table().to_vec2::<f32>().unwrap();
        for (x, y) in a.iter().flatten().zip(b.iter().flatten()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cache_goes_stale_after_update() {
        let model = model();
        let cache = EmbeddingCacheBuilder::default()
            .build(&model, &store(4), &Device::Cpu)
            .unwrap();
        assert!(cache.validate(0).is_ok());
        crate::models::EnergyModel::params(&model).bump();
        assert!(matches!(
            cache.validate(crate::models::EnergyModel::params(&model).version()),
            Err(Error::StaleCache { cached: 0, current: 1 })
        ));
    }

    #[test]
    fn test_summaries_have_encoder_width() {
        let model = model();
        let summaries = EmbeddingCacheBuilder::new(256)
            .summaries(model.encoder(), &store(5), &Device::Cpu)
            .unwrap();
        assert_eq!(summaries.dims(), &[5, 4]);
    }
}
