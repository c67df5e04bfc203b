//! Graph datasets and negative sampling.
//!
//! A [`GraphDataset`] is one split (train, valid or test) over a shared
//! [`GraphCatalog`]. All shared state sits behind `Arc`s and is never mutated
//! after construction, so the sampling methods only need `&self` and can run
//! on several prefetch workers at once.
//!
//! # Corruption
//!
//! A negative is made by replacing the head or the tail of a positive with a
//! uniformly drawn entity. [`GraphDataset::negative_sampling`] re-draws a
//! corruption that reproduces a known true triple, up to
//! [`SamplerConfig::max_retries`] times; if every retry collides the last draw
//! is kept and counted in [`SampledBatch::collisions`], which bounds the
//! work per negative. [`GraphDataset::graph_negative_sampling`] skips the
//! check entirely.

use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::{load_graph, EntityId, GraphCatalog, Triple, TripleIndex};
use crate::error::{Error, Result};
use crate::text::{DescriptionBatch, TextStore};

/// Which side of a positive gets replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Corruption {
    /// Fair coin per negative.
    #[default]
    CoinFlip,
    /// First half of each positive's negatives replace the head, the rest the tail.
    Split,
}

/// Negative sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Negatives drawn per positive (default: 1).
    pub negatives_per_positive: usize,
    /// Head/tail selection (default: coin flip).
    pub corruption: Corruption,
    /// Re-draws allowed when a corruption is a known triple (default: 10).
    pub max_retries: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            negatives_per_positive: 1,
            corruption: Corruption::CoinFlip,
            max_retries: 10,
        }
    }
}

impl SamplerConfig {
    pub fn with_negatives_per_positive(mut self, n: usize) -> Self {
        self.negatives_per_positive = n;
        self
    }

    pub fn with_corruption(mut self, corruption: Corruption) -> Self {
        self.corruption = corruption;
        self
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Token batch for every distinct entity referenced by a [`SampledBatch`].
#[derive(Debug, Clone)]
pub struct BatchDescriptions {
    /// Sorted, distinct entity IDs; row `i` of `batch` describes `entities[i]`.
    pub entities: Vec<EntityId>,
    pub batch: DescriptionBatch,
}

impl BatchDescriptions {
    /// Row of `id` in the token batch.
    pub fn position(&self, id: EntityId) -> Option<usize> {
        self.entities.binary_search(&id).ok()
    }
}

/// Positives with their corruptions.
#[derive(Debug, Clone)]
pub struct SampledBatch {
    pub positives: Vec<Triple>,
    /// `negatives[i * ratio + j]` is the `j`-th corruption of `positives[i]`.
    pub negatives: Vec<Triple>,
    pub ratio: usize,
    /// Negatives that still matched a known triple after all retries.
    pub collisions: usize,
    /// Present when the dataset carries descriptions.
    pub descriptions: Option<BatchDescriptions>,
}

impl SampledBatch {
    pub fn len(&self) -> usize {
        self.positives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positives.is_empty()
    }

    /// Distinct entity IDs across positives and negatives, sorted.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .positives
            .iter()
            .chain(&self.negatives)
            .flat_map(|t| [t.head, t.tail])
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// One split of a knowledge graph.
#[derive(Debug, Clone)]
pub struct GraphDataset {
    catalog: Arc<GraphCatalog>,
    triples: Arc<Vec<Triple>>,
    known: Arc<TripleIndex>,
    text: Option<Arc<TextStore>>,
    sampler: SamplerConfig,
}

impl GraphDataset {
    /// Build a split whose known-triple lookup is its own triples.
    pub fn new(catalog: Arc<GraphCatalog>, triples: Vec<Triple>) -> Result<Self> {
        validate(&catalog, &triples)?;
        let known = Arc::new(triples.iter().copied().collect());
        Ok(Self {
            catalog,
            triples: Arc::new(triples),
            known,
            text: None,
            sampler: SamplerConfig::default(),
        })
    }

    /// Load the catalog and a training split.
    pub fn load(
        triples_file: impl AsRef<Path>,
        entities_file: impl AsRef<Path>,
        relations_file: impl AsRef<Path>,
    ) -> Result<Self> {
        let (catalog, triples) = load_graph(triples_file, entities_file, relations_file)?;
        tracing::info!(
            entities = catalog.num_entities(),
            relations = catalog.num_relations(),
            triples = triples.len(),
            "loaded training split"
        );
        Self::new(Arc::new(catalog), triples)
    }

    /// Another split over the same catalog, descriptions, sampler and
    /// known-triple lookup.
    pub fn split(&self, triples: Vec<Triple>) -> Result<Self> {
        validate(&self.catalog, &triples)?;
        Ok(Self {
            catalog: Arc::clone(&self.catalog),
            triples: Arc::new(triples),
            known: Arc::clone(&self.known),
            text: self.text.clone(),
            sampler: self.sampler.clone(),
        })
    }

    /// Load another split file against this dataset's catalog.
    pub fn load_split(&self, triples_file: impl AsRef<Path>) -> Result<Self> {
        let triples = self.catalog.load_triples(triples_file.as_ref())?;
        tracing::info!(
            path = %triples_file.as_ref().display(),
            triples = triples.len(),
            "loaded split"
        );
        self.split(triples)
    }

    /// Attach tokenized descriptions; the store must have one row per catalog entity.
    pub fn with_text(mut self, text: Arc<TextStore>) -> Result<Self> {
        let entities = self.catalog.num_entities();
        if text.num_entities() != entities {
            return Err(Error::DescriptionCount {
                descriptions: text.num_entities(),
                entities,
            });
        }
        self.text = Some(text);
        Ok(self)
    }

    /// Drop the description store, e.g. for loops that bring their own entity table.
    pub fn without_text(mut self) -> Self {
        self.text = None;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    /// Replace the known-triple lookup, e.g. with train + valid triples.
    pub fn with_known(mut self, known: Arc<TripleIndex>) -> Self {
        self.known = known;
        self
    }

    pub fn catalog(&self) -> &Arc<GraphCatalog> {
        &self.catalog
    }

    pub fn num_entities(&self) -> usize {
        self.catalog.num_entities()
    }

    pub fn num_relations(&self) -> usize {
        self.catalog.num_relations()
    }

    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    pub fn known(&self) -> &Arc<TripleIndex> {
        &self.known
    }

    pub fn text(&self) -> Option<&Arc<TextStore>> {
        self.text.as_ref()
    }

    pub fn sampler(&self) -> &SamplerConfig {
        &self.sampler
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Triple> {
        self.triples.get(index).copied()
    }

    /// Corrupt each positive `negatives_per_positive` times, avoiding known triples.
    pub fn negative_sampling<R: Rng + ?Sized>(
        &self,
        batch: &[Triple],
        rng: &mut R,
    ) -> Result<SampledBatch> {
        self.corrupt(batch, rng, true)
    }

    /// Unfiltered corruption; negatives may coincide with known triples.
    pub fn graph_negative_sampling<R: Rng + ?Sized>(
        &self,
        batch: &[Triple],
        rng: &mut R,
    ) -> Result<SampledBatch> {
        self.corrupt(batch, rng, false)
    }

    /// Padded description tokens for `ids`.
    pub fn get_entity_descriptions(&self, ids: &[EntityId]) -> Result<DescriptionBatch> {
        self.text
            .as_ref()
            .ok_or(Error::NoDescriptions)?
            .get_entity_descriptions(ids)
    }

    /// Attach description tokens for every entity in `batch`; no-op without a text store.
    pub fn attach_descriptions(&self, batch: &mut SampledBatch) -> Result<()> {
        if let Some(text) = &self.text {
            let entities = batch.entities();
            let tokens = text.get_entity_descriptions(&entities)?;
            batch.descriptions = Some(BatchDescriptions {
                entities,
                batch: tokens,
            });
        }
        Ok(())
    }

    fn corrupt<R: Rng + ?Sized>(
        &self,
        batch: &[Triple],
        rng: &mut R,
        filtered: bool,
    ) -> Result<SampledBatch> {
        let ratio = self.sampler.negatives_per_positive;
        if batch.is_empty() {
            return Err(Error::BatchShape("cannot sample negatives for an empty batch".into()));
        }
        if ratio == 0 {
            return Err(Error::BatchShape("negatives_per_positive must be at least 1".into()));
        }
        let num_entities = self.num_entities() as EntityId;
        if num_entities == 0 {
            return Err(Error::BatchShape("catalog has no entities to sample from".into()));
        }

        let mut negatives = Vec::with_capacity(batch.len() * ratio);
        let mut collisions = 0;

        for &positive in batch {
            for j in 0..ratio {
                let replace_head = match self.sampler.corruption {
                    Corruption::CoinFlip => rng.random_bool(0.5),
                    Corruption::Split => j * 2 < ratio,
                };
                let mut draw = || {
                    let entity = rng.random_range(0..num_entities);
                    if replace_head {
                        positive.with_head(entity)
                    } else {
                        positive.with_tail(entity)
                    }
                };

                let mut candidate = draw();
                if filtered {
                    let mut attempts = 0;
                    while candidate == positive || self.known.contains(&candidate) {
                        if attempts == self.sampler.max_retries {
                            collisions += 1;
                            break;
                        }
                        attempts += 1;
                        candidate = draw();
                    }
                }
                negatives.push(candidate);
            }
        }

        if collisions > 0 {
            tracing::debug!(collisions, "negative sampling exhausted retries");
        }

        Ok(SampledBatch {
            positives: batch.to_vec(),
            negatives,
            ratio,
            collisions,
            descriptions: None,
        })
    }
}

fn validate(catalog: &GraphCatalog, triples: &[Triple]) -> Result<()> {
    let num_entities = catalog.num_entities();
    let num_relations = catalog.num_relations();
    for t in triples {
        for id in [t.head, t.tail] {
            if id as usize >= num_entities {
                return Err(Error::UnknownEntity { id, num_entities });
            }
        }
        if t.relation as usize >= num_relations {
            return Err(Error::UnknownRelation {
                id: t.relation,
                num_relations,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Vocab;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn abc_dataset() -> GraphDataset {
        let catalog = GraphCatalog::new(Vocab::from_names(["A", "B", "C"]), Vocab::from_names(["r"]));
        GraphDataset::new(Arc::new(catalog), vec![Triple::new(0, 1, 0)]).unwrap()
    }

    #[test]
    fn test_single_negative_differs_in_one_position() {
        let dataset = abc_dataset().with_sampler(SamplerConfig::default().with_max_retries(64));
        let positive = Triple::new(0, 1, 0);

        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let batch = dataset.negative_sampling(&[positive], &mut rng).unwrap();
            assert_eq!(batch.negatives.len(), 1);

            let negative = batch.negatives[0];
            assert_ne!(negative, positive);
            assert_eq!(negative.relation, positive.relation);
            let head_changed = negative.head != positive.head;
            let tail_changed = negative.tail != positive.tail;
            assert!(head_changed ^ tail_changed, "{negative:?}");
            assert!(negative.head < 3 && negative.tail < 3);
        }
    }

    #[test]
    fn test_ratio_is_constant() {
        let dataset = abc_dataset()
            .with_sampler(SamplerConfig::default().with_negatives_per_positive(4));
        let mut rng = StdRng::seed_from_u64(7);
        let positives = vec![Triple::new(0, 1, 0), Triple::new(2, 1, 0), Triple::new(1, 1, 0)];
        let batch = dataset.negative_sampling(&positives, &mut rng).unwrap();
        assert_eq!(batch.ratio, 4);
        assert_eq!(batch.negatives.len(), 12);
        for (i, chunk) in batch.negatives.chunks(4).enumerate() {
            for neg in chunk {
                assert_eq!(neg.relation, positives[i].relation);
                assert!(neg.head == positives[i].head || neg.tail == positives[i].tail);
            }
        }
    }

    #[test]
    fn test_split_corruption() {
        let dataset = abc_dataset().with_sampler(
            SamplerConfig::default()
                .with_negatives_per_positive(2)
                .with_corruption(Corruption::Split),
        );
        let mut rng = StdRng::seed_from_u64(3);
        let positive = Triple::new(0, 1, 0);
        let batch = dataset.negative_sampling(&[positive], &mut rng).unwrap();
        assert_eq!(batch.negatives[0].tail, positive.tail);
        assert_eq!(batch.negatives[1].head, positive.head);
    }

    #[test]
    fn test_retries_exhausted_are_counted() {
        // Single entity: every corruption reproduces the positive.
        let catalog = GraphCatalog::new(Vocab::from_names(["A"]), Vocab::from_names(["r"]));
        let dataset = GraphDataset::new(Arc::new(catalog), vec![Triple::new(0, 0, 0)])
            .unwrap()
            .with_sampler(SamplerConfig::default().with_max_retries(3));
        let mut rng = StdRng::seed_from_u64(0);
        let batch = dataset.negative_sampling(&[Triple::new(0, 0, 0)], &mut rng).unwrap();
        assert_eq!(batch.negatives.len(), 1);
        assert_eq!(batch.collisions, 1);
    }

    #[test]
    fn test_graph_negative_sampling_is_unfiltered() {
        let catalog = GraphCatalog::new(Vocab::from_names(["A"]), Vocab::from_names(["r"]));
        let dataset = GraphDataset::new(Arc::new(catalog), vec![Triple::new(0, 0, 0)]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let batch = dataset
            .graph_negative_sampling(&[Triple::new(0, 0, 0)], &mut rng)
            .unwrap();
        assert_eq!(batch.negatives, vec![Triple::new(0, 0, 0)]);
        assert_eq!(batch.collisions, 0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = abc_dataset().negative_sampling(&[], &mut rng).unwrap_err();
        assert!(matches!(err, Error::BatchShape(_)));
    }

    #[test]
    fn test_zero_ratio_rejected() {
        let dataset = abc_dataset()
            .with_sampler(SamplerConfig::default().with_negatives_per_positive(0));
        let mut rng = StdRng::seed_from_u64(0);
        let err = dataset
            .negative_sampling(&[Triple::new(0, 1, 0)], &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::BatchShape(_)));
    }

    #[test]
    fn test_out_of_range_triples_rejected() {
        let catalog = Arc::new(GraphCatalog::new(Vocab::from_names(["A"]), Vocab::from_names(["r"])));
        let err = GraphDataset::new(Arc::clone(&catalog), vec![Triple::new(0, 5, 0)]).unwrap_err();
        assert!(matches!(err, Error::UnknownEntity { id: 5, .. }));
        let err = GraphDataset::new(catalog, vec![Triple::new(0, 0, 2)]).unwrap_err();
        assert!(matches!(err, Error::UnknownRelation { id: 2, .. }));
    }

    #[test]
    fn test_split_shares_training_lookup() {
        let train = abc_dataset();
        let valid = train.split(vec![Triple::new(2, 0, 0)]).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid.get(0), Some(Triple::new(2, 0, 0)));
        assert!(valid.known().contains(&Triple::new(0, 1, 0)));
        assert!(!valid.known().contains(&Triple::new(2, 0, 0)));
    }

    #[test]
    fn test_attach_descriptions() {
        let text = Arc::new(TextStore::from_token_ids(vec![vec![4, 5], vec![6], vec![]], 8, 0));
        let dataset = abc_dataset().with_text(text).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut batch = dataset.negative_sampling(&[Triple::new(0, 1, 0)], &mut rng).unwrap();
        dataset.attach_descriptions(&mut batch).unwrap();

        let descriptions = batch.descriptions.as_ref().unwrap();
        assert_eq!(descriptions.entities, batch.entities());
        assert_eq!(descriptions.batch.batch_size(), descriptions.entities.len());
        assert_eq!(descriptions.position(0), Some(0));
    }

    #[test]
    fn test_text_store_must_match_catalog() {
        let short = Arc::new(TextStore::from_token_ids(vec![vec![4, 5], vec![6]], 8, 0));
        let err = abc_dataset().with_text(short).unwrap_err();
        assert!(matches!(
            err,
            Error::DescriptionCount {
                descriptions: 2,
                entities: 3
            }
        ));
    }

    #[test]
    fn test_wider_known_set_filters_negatives() {
        let train = abc_dataset().with_sampler(SamplerConfig::default().with_max_retries(64));
        let held_out = Triple::new(0, 2, 0);
        let positive = Triple::new(0, 1, 0);

        let draws = |dataset: &GraphDataset| -> Vec<Triple> {
            (0..100)
                .flat_map(|seed| {
                    let mut rng = StdRng::seed_from_u64(seed);
                    dataset.negative_sampling(&[positive], &mut rng).unwrap().negatives
                })
                .collect()
        };
        assert!(draws(&train).contains(&held_out));

        let known: TripleIndex = [positive, held_out].into_iter().collect();
        let train = train.with_known(Arc::new(known));
        assert!(train.known().contains(&held_out));
        assert!(!draws(&train).contains(&held_out));
    }

    #[test]
    fn test_descriptions_require_text_store() {
        let err = abc_dataset().get_entity_descriptions(&[0]).unwrap_err();
        assert!(matches!(err, Error::NoDescriptions));
    }
}
