//! Files on disk through training to ranked predictions.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use candle_core::Device;
use glossa::prelude::*;

fn write_graph(dir: &Path) -> std::io::Result<()> {
    let cities = ["paris", "lyon", "nice", "lille", "brest", "metz"];
    let countries = ["france", "spain"];
    let entities: String = cities
        .iter()
        .chain(&countries)
        .map(|name| format!("{name}\n"))
        .collect();
    let located: Vec<String> = cities
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c} {} located_in", countries[i % 2]))
        .collect();
    let neighbour: Vec<String> = cities
        .windows(2)
        .map(|w| format!("{} {} next_to", w[0], w[1]))
        .collect();

    fs::write(dir.join("entities.txt"), entities)?;
    fs::write(dir.join("relations.txt"), "located_in\nnext_to\n")?;
    fs::write(
        dir.join("train.txt"),
        [&located[..4], &neighbour[..]].concat().join("\n"),
    )?;
    fs::write(dir.join("valid.txt"), located[4].as_str())?;
    fs::write(dir.join("test.txt"), located[5].as_str())?;
    Ok(())
}

#[test]
fn trains_from_files_and_predicts_tails() {
    let dir = tempfile::tempdir().unwrap();
    write_graph(dir.path()).unwrap();
    let data = dir.path();

    let train = GraphDataset::load(
        data.join("train.txt"),
        data.join("entities.txt"),
        data.join("relations.txt"),
    )
    .unwrap();
    assert_eq!(train.num_entities(), 8);
    assert_eq!(train.len(), 9);
    let splits = Splits {
        valid: Arc::new(train.load_split(data.join("valid.txt")).unwrap()),
        test: Arc::new(train.load_split(data.join("test.txt")).unwrap()),
        train: Arc::new(train),
    };

    let params = Arc::new(ParameterStore::new(Device::Cpu));
    let model = TransE::new(8, 2, ModelConfig::default().with_dim(12), params).unwrap();
    let config = TrainingConfig::default()
        .with_max_epochs(2)
        .with_batch_size(3)
        .with_num_workers(1);
    let report = LinkPredictionTrainer::new(RunContext::cpu(), config)
        .fit(&model, &splits)
        .unwrap();
    assert_eq!(report.epochs.len(), 2);
    assert_eq!(report.test.num_ranks, 2);

    let catalog = splits.train.catalog();
    let paris = catalog.entity_id("paris").unwrap();
    let located_in = catalog.relation_id("located_in").unwrap();
    let table = model.entity_table().unwrap();
    let top = model.predict_tails(paris, located_in, &table, 3).unwrap();
    assert_eq!(top.len(), 3);
    assert!(top.windows(2).all(|w| w[0].1 <= w[1].1));
}
