//! Shuffled, prefetched training batches.
//!
//! [`BatchLoader::epoch`] plans one pass over a split: the triple order is
//! shuffled from `(seed, epoch)` and each batch gets its own sampling seed, so
//! the batches of an epoch are identical whether they are assembled inline or
//! on worker threads.
//!
//! With `num_workers > 0`, worker `w` assembles batches `w, w + W, w + 2W, ..`
//! and pushes them into its own bounded channel of depth `prefetch`. The
//! consumer reads the channels round-robin, which keeps delivery in batch
//! order. Workers only read the dataset; dropping the iterator closes the
//! channels and joins the workers.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

use crate::catalog::Triple;
use crate::dataset::{GraphDataset, SampledBatch};
use crate::error::{Error, Result};

/// How a batch of positives becomes a training batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collate {
    /// [`GraphDataset::negative_sampling`].
    Filtered,
    /// [`GraphDataset::graph_negative_sampling`].
    Unfiltered,
}

/// Loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Positives per batch (default: 32).
    pub batch_size: usize,
    /// Shuffle the split every epoch (default: true).
    pub shuffle: bool,
    /// Prefetch threads; 0 assembles batches on the calling thread (default: 4).
    pub num_workers: usize,
    /// Queue depth per worker (default: 2).
    pub prefetch: usize,
    /// Base seed for shuffling and sampling (default: 42).
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            num_workers: 4,
            prefetch: 2,
            seed: 42,
        }
    }
}

impl LoaderConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Produces [`SampledBatch`]es for one split.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    dataset: Arc<GraphDataset>,
    config: LoaderConfig,
    collate: Collate,
}

impl BatchLoader {
    pub fn new(dataset: Arc<GraphDataset>, config: LoaderConfig, collate: Collate) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::BatchShape("batch_size must be at least 1".into()));
        }
        Ok(Self {
            dataset,
            config,
            collate,
        })
    }

    pub fn dataset(&self) -> &Arc<GraphDataset> {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Batches per epoch (the last batch may be short).
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate one epoch.
    pub fn epoch(&self, epoch: u64) -> Batches {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(mix(self.config.seed, epoch));
            order.shuffle(&mut rng);
        }
        let plan = Arc::new(EpochPlan {
            dataset: Arc::clone(&self.dataset),
            order,
            batch_size: self.config.batch_size,
            collate: self.collate,
            seed: mix(self.config.seed, epoch),
        });
        let num_batches = self.len();

        let num_workers = self.config.num_workers.min(num_batches);
        let workers = (0..num_workers)
            .map(|w| spawn_worker(Arc::clone(&plan), w, num_workers, self.config.prefetch))
            .collect();

        Batches {
            plan,
            next: 0,
            num_batches,
            workers,
        }
    }
}

struct EpochPlan {
    dataset: Arc<GraphDataset>,
    order: Vec<usize>,
    batch_size: usize,
    collate: Collate,
    seed: u64,
}

impl EpochPlan {
    fn assemble(&self, index: usize) -> Result<SampledBatch> {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.order.len());
        let triples = self.dataset.triples();
        let positives: Vec<Triple> = self.order[start..end].iter().map(|&i| triples[i]).collect();

        let mut rng = XorShiftRng::seed_from_u64(mix(self.seed, index as u64));
        let mut batch = match self.collate {
            Collate::Filtered => self.dataset.negative_sampling(&positives, &mut rng)?,
            Collate::Unfiltered => self.dataset.graph_negative_sampling(&positives, &mut rng)?,
        };
        self.dataset.attach_descriptions(&mut batch)?;
        Ok(batch)
    }
}

struct Worker {
    rx: Option<Receiver<Result<SampledBatch>>>,
    handle: Option<JoinHandle<()>>,
}

fn spawn_worker(plan: Arc<EpochPlan>, worker: usize, stride: usize, prefetch: usize) -> Worker {
    let (tx, rx) = mpsc::sync_channel(prefetch.max(1));
    let num_batches = plan.order.len().div_ceil(plan.batch_size);
    let handle = std::thread::spawn(move || {
        for index in (worker..num_batches).step_by(stride) {
            if tx.send(plan.assemble(index)).is_err() {
                // Consumer hung up.
                return;
            }
        }
    });
    Worker {
        rx: Some(rx),
        handle: Some(handle),
    }
}

/// Iterator over one epoch of batches.
pub struct Batches {
    plan: Arc<EpochPlan>,
    next: usize,
    num_batches: usize,
    workers: Vec<Worker>,
}

impl Iterator for Batches {
    type Item = Result<SampledBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.num_batches {
            return None;
        }
        let index = self.next;
        self.next += 1;

        if self.workers.is_empty() {
            return Some(self.plan.assemble(index));
        }

        let w = index % self.workers.len();
        let received = self.workers[w].rx.as_ref().map(|rx| rx.recv());
        match received {
            Some(Ok(item)) => Some(item),
            _ => {
                self.next = self.num_batches;
                Some(Err(Error::WorkerPanicked(w)))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches {}

impl Drop for Batches {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.rx.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn mix(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(1)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .rotate_left(17)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GraphCatalog, Vocab};

    fn dataset(n: u32) -> Arc<GraphDataset> {
        let names: Vec<String> = (0..n).map(|i| format!("e{i}")).collect();
        let catalog = GraphCatalog::new(Vocab::from_names(names), Vocab::from_names(["r"]));
        let triples = (0..n).map(|i| Triple::new(i, (i + 1) % n, 0)).collect();
        Arc::new(GraphDataset::new(Arc::new(catalog), triples).unwrap())
    }

    fn collect(loader: &BatchLoader, epoch: u64) -> Vec<SampledBatch> {
        loader.epoch(epoch).collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_len_rounds_up() {
        let loader = BatchLoader::new(
            dataset(10),
            LoaderConfig::default().with_batch_size(4),
            Collate::Filtered,
        )
        .unwrap();
        assert_eq!(loader.len(), 3);
        let batches = collect(&loader, 0);
        let sizes: Vec<usize> = batches.iter().map(SampledBatch::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_epoch_covers_every_triple_once() {
        let ds = dataset(25);
        let loader = BatchLoader::new(
            Arc::clone(&ds),
            LoaderConfig::default().with_batch_size(7),
            Collate::Filtered,
        )
        .unwrap();
        let mut seen: Vec<Triple> = collect(&loader, 3)
            .into_iter()
            .flat_map(|b| b.positives)
            .collect();
        seen.sort();
        let mut expected = ds.triples().to_vec();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_workers_match_inline_assembly() {
        let ds = dataset(40);
        let config = LoaderConfig::default().with_batch_size(6).with_seed(9);
        let threaded = BatchLoader::new(
            Arc::clone(&ds),
            config.clone().with_num_workers(3),
            Collate::Filtered,
        )
        .unwrap();
        let inline =
            BatchLoader::new(ds, config.with_num_workers(0), Collate::Filtered).unwrap();

        let a = collect(&threaded, 1);
        let b = collect(&inline, 1);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.positives, y.positives);
            assert_eq!(x.negatives, y.negatives);
        }
    }

    #[test]
    fn test_shuffle_changes_between_epochs() {
        let loader = BatchLoader::new(
            dataset(50),
            LoaderConfig::default().with_batch_size(50).with_num_workers(0),
            Collate::Unfiltered,
        )
        .unwrap();
        let e0 = collect(&loader, 0).remove(0).positives;
        let e1 = collect(&loader, 1).remove(0).positives;
        assert_ne!(e0, e1);
    }

    #[test]
    fn test_no_shuffle_keeps_file_order() {
        let ds = dataset(5);
        let loader = BatchLoader::new(
            Arc::clone(&ds),
            LoaderConfig::default().with_batch_size(5).with_shuffle(false),
            Collate::Filtered,
        )
        .unwrap();
        assert_eq!(collect(&loader, 0)[0].positives, ds.triples());
    }

    #[test]
    fn test_early_drop_joins_workers() {
        let loader = BatchLoader::new(
            dataset(100),
            LoaderConfig::default().with_batch_size(2).with_prefetch(1),
            Collate::Filtered,
        )
        .unwrap();
        let mut batches = loader.epoch(0);
        assert!(batches.next().is_some());
        drop(batches);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = BatchLoader::new(
            dataset(3),
            LoaderConfig::default().with_batch_size(0),
            Collate::Filtered,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BatchShape(_)));
    }
}
