//! Property-based tests for catalogs and negative sampling.
//!
//! - Loaded triples always index into the catalog
//! - Every negative that is still a known triple is reported as a collision
//! - Negatives keep the relation and change exactly one side

use std::path::Path;
use std::sync::Arc;

use glossa_core::{GraphCatalog, GraphDataset, SamplerConfig, Triple, Vocab};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn catalog(num_entities: usize, num_relations: usize) -> GraphCatalog {
    GraphCatalog::new(
        Vocab::from_names((0..num_entities).map(|i| format!("Q{i}"))),
        Vocab::from_names((0..num_relations).map(|i| format!("P{i}"))),
    )
}

fn arb_graph() -> impl Strategy<Value = (usize, usize, Vec<(usize, usize, usize)>)> {
    (2usize..30, 1usize..5).prop_flat_map(|(ne, nr)| {
        (
            Just(ne),
            Just(nr),
            prop::collection::vec((0..ne, 0..ne, 0..nr), 1..60),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn loaded_triples_are_in_range((ne, nr, raw) in arb_graph()) {
        let catalog = catalog(ne, nr);
        let text: String = raw
            .iter()
            .map(|(h, t, r)| format!("Q{h}\tQ{t}\tP{r}\n"))
            .collect();
        let triples = catalog.parse_triples(&text, Path::new("train.txt")).unwrap();

        prop_assert!(!triples.is_empty());
        prop_assert!(triples.len() <= raw.len());
        for t in &triples {
            prop_assert!((t.head as usize) < catalog.num_entities());
            prop_assert!((t.tail as usize) < catalog.num_entities());
            prop_assert!((t.relation as usize) < catalog.num_relations());
        }
    }

    #[test]
    fn known_negatives_are_exactly_the_collisions(
        (ne, nr, raw) in arb_graph(),
        seed in any::<u64>(),
        ratio in 1usize..4,
    ) {
        let triples: Vec<Triple> = raw
            .iter()
            .map(|&(h, t, r)| Triple::new(h as u32, t as u32, r as u32))
            .collect();
        let dataset = GraphDataset::new(Arc::new(catalog(ne, nr)), triples.clone())
            .unwrap()
            .with_sampler(SamplerConfig::default().with_negatives_per_positive(ratio));

        let mut rng = StdRng::seed_from_u64(seed);
        let batch = dataset.negative_sampling(&triples, &mut rng).unwrap();

        prop_assert_eq!(batch.negatives.len(), triples.len() * ratio);
        let known = batch
            .negatives
            .iter()
            .filter(|n| dataset.known().contains(n))
            .count();
        prop_assert_eq!(known, batch.collisions);

        for (i, neg) in batch.negatives.iter().enumerate() {
            let pos = triples[i / ratio];
            prop_assert_eq!(neg.relation, pos.relation);
            prop_assert!(neg.head == pos.head || neg.tail == pos.tail);
        }
    }
}

#[test]
fn collision_rate_stays_below_one_percent() {
    // Entity 0 is linked to half of the graph, so half of all tail
    // corruptions of its triples are known triples.
    let ne = 40u32;
    let triples: Vec<Triple> = (1..ne / 2).map(|t| Triple::new(0, t, 0)).collect();
    let dataset = GraphDataset::new(Arc::new(catalog(ne as usize, 1)), triples.clone())
        .unwrap()
        .with_sampler(SamplerConfig::default().with_negatives_per_positive(100));

    let mut rng = StdRng::seed_from_u64(2024);
    let batch = dataset.negative_sampling(&triples, &mut rng).unwrap();

    let draws = batch.negatives.len();
    assert_eq!(draws, triples.len() * 100);
    assert!(
        (batch.collisions as f64) / (draws as f64) <= 0.01,
        "collisions: {} of {draws}",
        batch.collisions
    );
}
