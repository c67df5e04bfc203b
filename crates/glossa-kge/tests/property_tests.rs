use std::sync::Arc;

use candle_core::{Device, Tensor};
use glossa_core::{GraphCatalog, GraphDataset, Triple, Vocab};
use glossa_kge::{
    compute_rank, energy, EvalConfig, Evaluator, ModelConfig, PNorm, ParameterStore, TransE,
};
use proptest::prelude::*;

fn tensor(values: &[f32], dim: usize) -> Tensor {
    Tensor::from_slice(values, (values.len() / dim, dim), &Device::Cpu).unwrap()
}

proptest! {
    #[test]
    fn energy_is_non_negative(
        values in prop::collection::vec(-50.0f32..50.0, 3 * 8),
        l2 in any::<bool>(),
    ) {
        let p = if l2 { PNorm::L2 } else { PNorm::L1 };
        let h = tensor(&values[0..8], 4);
        let r = tensor(&values[8..16], 4);
        let t = tensor(&values[16..24], 4);
        let e = energy(&h, &r, &t, p).unwrap().to_vec1::<f32>().unwrap();
        prop_assert_eq!(e.len(), 2);
        prop_assert!(e.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn rank_is_position_in_ascending_order(
        mut energies in prop::collection::hash_set(0u32..10_000, 5)
            .prop_map(|s| s.into_iter().map(|v| v as f32 / 100.0).collect::<Vec<_>>()),
        target in 0usize..5,
    ) {
        let value = energies[target];
        let rank = compute_rank(value, &energies);
        energies.sort_by(f32::total_cmp);
        let position = energies.iter().position(|&e| e == value).unwrap() + 1;
        prop_assert_eq!(rank, position);
    }

    #[test]
    fn tied_energies_share_the_lower_rank(
        low in 0.0f32..1.0,
        others in prop::collection::vec(2.0f32..3.0, 3),
    ) {
        let energies = [low, others[0], low, others[1], others[2]];
        prop_assert_eq!(compute_rank(energies[0], &energies), 1);
        prop_assert_eq!(compute_rank(energies[2], &energies), 1);
        prop_assert_eq!(compute_rank(energies[0], &energies), compute_rank(energies[0], &energies));
    }
}

fn cycle_dataset(n: u32) -> GraphDataset {
    let names: Vec<String> = (0..n).map(|i| format!("e{i}")).collect();
    let catalog = GraphCatalog::new(Vocab::from_names(names), Vocab::from_names(["r0", "r1"]));
    let triples = (0..n)
        .flat_map(|i| [Triple::new(i, (i + 1) % n, 0), Triple::new(i, (i + 3) % n, 1)])
        .collect();
    GraphDataset::new(Arc::new(catalog), triples).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn metrics_do_not_depend_on_triple_order(
        shuffled in Just(cycle_dataset(12).triples().to_vec()).prop_shuffle(),
        batch in 1usize..9,
    ) {
        let dataset = cycle_dataset(12);
        let params = Arc::new(ParameterStore::new(Device::Cpu));
        let model = TransE::new(12, 2, ModelConfig::default().with_dim(8), params).unwrap();
        let reordered = dataset.split(shuffled).unwrap();

        let a = Evaluator::new(EvalConfig::default().with_batch_size(7))
            .evaluate(&model, &dataset, None)
            .unwrap();
        let b = Evaluator::new(EvalConfig::default().with_batch_size(batch).with_candidate_chunk(5))
            .evaluate(&model, &reordered, None)
            .unwrap();
        prop_assert!((a.mrr - b.mrr).abs() < 1e-9);
        prop_assert!((a.hits_at_10 - b.hits_at_10).abs() < 1e-9);
        prop_assert_eq!(a.num_ranks, b.num_ranks);
    }
}
