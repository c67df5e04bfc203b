//! Training loops.
//!
//! [`LinkPredictionTrainer`] runs the standard margin-ranking schedule for any
//! [`EnergyModel`]:
//!
//! 1. For every epoch, iterate shuffled batches with filtered negatives.
//! 2. Step AdamW (one rate per parameter group, linear warmup) on the loss.
//! 3. After each epoch, rank a training sample and the validation split.
//! 4. After the last epoch, rank the test split once.
//!
//! [`AlignmentTrainer`] instead walks entities one at a time. For entity `e` it
//! builds the table in which only row `e` is text-derived, runs a full pass of
//! unfiltered batches through [`RelTransE`], sums the gradients, and applies a
//! single optimizer step.
//!
//! # Example
//!
//! ```rust,ignore
//! use glossa_kge::{LinkPredictionTrainer, RunContext, TrainingConfig};
//!
//! let config = TrainingConfig::default().with_max_epochs(5);
//! let trainer = LinkPredictionTrainer::new(RunContext::cpu(), config);
//! let report = trainer.fit(&model, &splits)?;
//! println!("{}", report.test.summary());
//! ```

use std::ops::Range;
use std::sync::Arc;

use candle_core::Tensor;
use glossa_core::{Batches, BatchLoader, Collate, EntityId, GraphDataset, LoaderConfig, SamplerConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::{description_tensors, SampledTensors};
use crate::cache::{EmbeddingCacheBuilder, EntityEmbeddingCache};
use crate::context::RunContext;
use crate::encoder::TextEncoder;
use crate::error::{Error, Result};
use crate::evaluation::{EvalConfig, Evaluator, RankMetrics, RankingProtocol};
use crate::models::{EnergyModel, EntityAligner, LearningRates, RelTransE};
use crate::optim::{GradientAccumulator, GroupedOptimizer, LinearWarmup};

/// Link prediction training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs (default: 15).
    pub max_epochs: usize,
    /// Positives per training batch (default: 32).
    pub batch_size: usize,
    /// Triples per evaluation batch (default: 128).
    pub eval_batch_size: usize,
    /// Per-group learning rates (default: encoder 2e-5, head 1e-4).
    pub learning_rates: LearningRates,
    /// Fraction of all steps spent in linear warmup (default: 0.2).
    pub warmup_fraction: f64,
    /// Prefetch threads for the training loader (default: 4).
    pub num_workers: usize,
    /// Batches between progress lines (default: 200).
    pub log_every: usize,
    /// Base seed for shuffling and sampling (default: 42).
    pub seed: u64,
    /// Negative sampling settings.
    pub sampler: SamplerConfig,
    /// Rank a training sample after every epoch (default: true).
    pub eval_train_sample: bool,
    /// Filter known triples when ranking (default: false).
    pub filtered_ranking: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_epochs: 15,
            batch_size: 32,
            eval_batch_size: 128,
            learning_rates: LearningRates::default(),
            warmup_fraction: 0.2,
            num_workers: 4,
            log_every: 200,
            seed: 42,
            sampler: SamplerConfig::default(),
            eval_train_sample: true,
            filtered_ranking: false,
        }
    }
}

impl TrainingConfig {
    pub fn with_max_epochs(mut self, epochs: usize) -> Self {
        self.max_epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_eval_batch_size(mut self, batch_size: usize) -> Self {
        self.eval_batch_size = batch_size;
        self
    }

    pub fn with_learning_rates(mut self, rates: LearningRates) -> Self {
        self.learning_rates = rates;
        self
    }

    pub fn with_warmup_fraction(mut self, fraction: f64) -> Self {
        self.warmup_fraction = fraction;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_eval_train_sample(mut self, enabled: bool) -> Self {
        self.eval_train_sample = enabled;
        self
    }

    pub fn with_filtered_ranking(mut self, filtered: bool) -> Self {
        self.filtered_ranking = filtered;
        self
    }
}

/// Train, validation and test splits over one catalog.
#[derive(Debug, Clone)]
pub struct Splits {
    pub train: Arc<GraphDataset>,
    pub valid: Arc<GraphDataset>,
    pub test: Arc<GraphDataset>,
}

/// Metrics of one epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub train: Option<RankMetrics>,
    pub valid: RankMetrics,
}

/// Outcome of [`LinkPredictionTrainer::fit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    pub test: RankMetrics,
    pub steps: usize,
}

/// Supervised link prediction training.
#[derive(Debug, Clone)]
pub struct LinkPredictionTrainer {
    ctx: RunContext,
    config: TrainingConfig,
}

impl LinkPredictionTrainer {
    pub fn new(ctx: RunContext, config: TrainingConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn fit(&self, model: &dyn EnergyModel, splits: &Splits) -> Result<TrainingReport> {
        let config = &self.config;
        let train = Arc::new(
            GraphDataset::clone(&splits.train).with_sampler(config.sampler.clone()),
        );
        let loader = BatchLoader::new(
            train,
            LoaderConfig::default()
                .with_batch_size(config.batch_size)
                .with_num_workers(config.num_workers)
                .with_seed(config.seed),
            Collate::Filtered,
        )?;
        if loader.is_empty() {
            return Err(Error::EmptyLoader("training split has no triples".into()));
        }

        let total_steps = loader.len() * config.max_epochs;
        let mut optimizer = GroupedOptimizer::new(
            model.param_groups(&config.learning_rates),
            Some(LinearWarmup::new(total_steps, config.warmup_fraction)),
        )?;
        let evaluator = self.evaluator(splits, None);
        // The training sample is as large as the validation split.
        let sample_batches = splits.valid.len().div_ceil(config.eval_batch_size.max(1));
        let sample_evaluator = self.evaluator(splits, Some(sample_batches));

        info!(
            triples = splits.train.len(),
            batches = loader.len(),
            total_steps,
            parameters = model.params().num_parameters(),
            "starting link prediction training"
        );

        let mut epochs = Vec::with_capacity(config.max_epochs);
        for epoch in 1..=config.max_epochs {
            let train_loss = self.train_epoch(model, &mut optimizer, loader.epoch(epoch as u64), epoch)?;
            self.ctx.log_scalar("train_loss", train_loss, Some(epoch));
            info!(epoch, train_loss, "epoch finished");

            let cache = self.build_cache(model, &splits.train)?;
            let train_metrics = if config.eval_train_sample {
                info!("evaluating on a sample of the training set");
                let sampled = sample_evaluator.evaluate(model, &splits.train, cache.as_ref())?;
                self.log_metrics("train", &sampled, epoch);
                Some(sampled)
            } else {
                None
            };
            info!("evaluating on the validation set");
            let valid = evaluator.evaluate(model, &splits.valid, cache.as_ref())?;
            self.log_metrics("valid", &valid, epoch);
            drop(cache);

            epochs.push(EpochReport {
                epoch,
                train_loss,
                train: train_metrics,
                valid,
            });
        }

        info!("evaluating on the test set");
        let cache = self.build_cache(model, &splits.test)?;
        let test = evaluator.evaluate(model, &splits.test, cache.as_ref())?;
        self.log_metrics("test", &test, config.max_epochs);

        Ok(TrainingReport {
            epochs,
            test,
            steps: optimizer.num_steps(),
        })
    }

    fn train_epoch(
        &self,
        model: &dyn EnergyModel,
        optimizer: &mut GroupedOptimizer,
        batches: Batches,
        epoch: usize,
    ) -> Result<f64> {
        let num_batches = batches.len();
        if num_batches == 0 {
            return Err(Error::EmptyLoader(format!("epoch {epoch} has no batches")));
        }
        let device = model.params().device().clone();
        let mut total = 0.0f64;
        for (step, batch) in batches.enumerate() {
            let batch = batch?;
            let tensors = SampledTensors::from_batch(&batch, &device)?;
            let loss = model.forward(&tensors, None)?;
            let value = loss.to_scalar::<f32>()?;
            ensure_finite(value, || format!("epoch {epoch}, batch {step}"))?;

            optimizer.backward_step(&loss)?;
            model.params().bump();
            total += f64::from(value);

            if step % self.config.log_every.max(1) == 0 {
                info!(epoch, step, loss = value, collisions = batch.collisions, "training");
                self.ctx
                    .log_scalar("batch_loss", f64::from(value), Some(optimizer.num_steps()));
            }
        }
        Ok(total / num_batches as f64)
    }

    fn evaluator(&self, splits: &Splits, max_batches: Option<usize>) -> Evaluator {
        let config = EvalConfig::default()
            .with_batch_size(self.config.eval_batch_size)
            .with_max_batches(max_batches);
        let evaluator = Evaluator::new(config);
        if self.config.filtered_ranking {
            evaluator.with_protocol(RankingProtocol::Filtered(Arc::clone(splits.train.known())))
        } else {
            evaluator
        }
    }

    /// Entity table for text models, built at the current parameter version.
    fn build_cache(
        &self,
        model: &dyn EnergyModel,
        dataset: &GraphDataset,
    ) -> Result<Option<EntityEmbeddingCache>> {
        let Some(encoder) = model.entity_encoder() else {
            return Ok(None);
        };
        let text = dataset.text().ok_or(glossa_core::Error::NoDescriptions)?;
        let cache = EmbeddingCacheBuilder::new(self.config.eval_batch_size).build(
            encoder,
            text,
            model.params().device(),
        )?;
        Ok(Some(cache))
    }

    fn log_metrics(&self, split: &str, metrics: &RankMetrics, epoch: usize) {
        info!(split, "{}", metrics.summary());
        self.ctx
            .log_scalar(&format!("{split}_valid_mrr"), metrics.mrr, Some(epoch));
        self.ctx
            .log_scalar(&format!("{split}_valid_hits@10"), metrics.hits_at_10, Some(epoch));
    }
}

fn ensure_finite(value: f32, context: impl FnOnce() -> String) -> Result<()> {
    if value.is_finite() {
        return Ok(());
    }
    Err(Error::NumericDivergence {
        context: context(),
        value,
    })
}

/// Alignment training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Positives per inner batch (default: 256).
    pub batch_size: usize,
    /// Learning rate for aligner and relations (default: 1e-5).
    pub lr: f64,
    /// Prefetch threads for the inner pass (default: 4).
    pub num_workers: usize,
    /// Inner batches between debug lines (default: 100).
    pub log_every: usize,
    /// Base seed (default: 42).
    pub seed: u64,
    /// Entities to align (default: all).
    pub entities: Option<Range<EntityId>>,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            lr: 1e-5,
            num_workers: 4,
            log_every: 100,
            seed: 42,
            entities: None,
        }
    }
}

impl AlignmentConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_entities(mut self, entities: Range<EntityId>) -> Self {
        self.entities = Some(entities);
        self
    }
}

/// The two-level iteration of alignment: entities outside, full graph passes inside.
pub struct AlignmentSchedule {
    loader: BatchLoader,
    entities: Range<EntityId>,
}

impl AlignmentSchedule {
    pub fn new(dataset: Arc<GraphDataset>, config: &AlignmentConfig) -> Result<Self> {
        let num_entities = dataset.num_entities() as EntityId;
        let entities = config.entities.clone().unwrap_or(0..num_entities);
        if entities.end > num_entities {
            return Err(Error::Data(glossa_core::Error::UnknownEntity {
                id: entities.end - 1,
                num_entities: num_entities as usize,
            }));
        }
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig::default()
                .with_batch_size(config.batch_size)
                .with_num_workers(config.num_workers)
                .with_seed(config.seed),
            Collate::Unfiltered,
        )?;
        Ok(Self { loader, entities })
    }

    pub fn entities(&self) -> Range<EntityId> {
        self.entities.clone()
    }

    /// Batches of the inner pass for `entity`.
    pub fn inner_pass(&self, entity: EntityId) -> Batches {
        self.loader.epoch(u64::from(entity))
    }

    pub fn batches_per_entity(&self) -> usize {
        self.loader.len()
    }
}

/// Per-entity outcome of alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedEntity {
    pub entity: EntityId,
    pub mean_loss: f64,
    pub grad_min: f32,
    pub grad_max: f32,
}

/// Outcome of [`AlignmentTrainer::fit`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub entities: Vec<AlignedEntity>,
}

/// Entity-by-entity alignment of description encodings with summary vectors.
#[derive(Debug, Clone)]
pub struct AlignmentTrainer {
    ctx: RunContext,
    config: AlignmentConfig,
}

impl AlignmentTrainer {
    pub fn new(ctx: RunContext, config: AlignmentConfig) -> Self {
        Self { ctx, config }
    }

    /// `dataset` must carry descriptions; `summaries` is `[N, summary_dim]`.
    pub fn fit<E: TextEncoder>(
        &self,
        aligner: &EntityAligner<E>,
        graph_model: &RelTransE,
        dataset: &GraphDataset,
        summaries: &Tensor,
    ) -> Result<AlignmentReport> {
        let text = dataset
            .text()
            .cloned()
            .ok_or(glossa_core::Error::NoDescriptions)?;
        // The inner pass brings its own entity table.
        let graph = Arc::new(dataset.clone().without_text());
        let schedule = AlignmentSchedule::new(graph, &self.config)?;
        if schedule.batches_per_entity() == 0 {
            return Err(Error::EmptyLoader("alignment graph has no triples".into()));
        }

        let mut groups = vec![aligner.param_group(self.config.lr)];
        groups.extend(graph_model.param_groups(&LearningRates {
            encoder: self.config.lr,
            head: self.config.lr,
        }));
        let mut optimizer = GroupedOptimizer::new(groups, None)?;
        let mut accumulator = GradientAccumulator::new(optimizer.vars());
        let device = graph_model.params().device().clone();

        info!(
            entities = schedule.entities().len(),
            batches_per_entity = schedule.batches_per_entity(),
            "starting alignment"
        );

        let mut report = AlignmentReport::default();
        for entity in schedule.entities() {
            accumulator.reset();
            let description = text.get_entity_descriptions(&[entity])?;
            let (token_ids, attention_mask) = description_tensors(&description, &device)?;
            let table = aligner.align(entity, &token_ids, &attention_mask, summaries)?;

            let mut total = 0.0f64;
            for (step, batch) in schedule.inner_pass(entity).enumerate() {
                let batch = batch?;
                let tensors = SampledTensors::from_batch(&batch, &device)?;
                let loss = graph_model.forward(&tensors, Some(&table))?;
                let value = loss.to_scalar::<f32>()?;
                ensure_finite(value, || format!("entity {entity}, batch {step}"))?;
                accumulator.accumulate(loss.backward()?)?;
                total += f64::from(value);
                if step % self.config.log_every.max(1) == 0 {
                    debug!(entity, step, loss = value, "alignment pass");
                }
            }

            let (grad_min, grad_max) = accumulator.extrema()?.unwrap_or((0.0, 0.0));
            info!(entity, grad_min, grad_max, "accumulated gradients");
            if let Some(grads) = accumulator.grads() {
                optimizer.step(grads)?;
                graph_model.params().bump();
            }

            let mean_loss = total / accumulator.passes().max(1) as f64;
            self.ctx
                .log_scalar("align_loss", mean_loss, Some(entity as usize));
            report.entities.push(AlignedEntity {
                entity,
                mean_loss,
                grad_min,
                grad_max,
            });
        }
        Ok(report)
    }
}
