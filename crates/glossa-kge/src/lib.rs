//! Translation-based knowledge graph embeddings with candle.
//!
//! | Module | Role |
//! |--------|------|
//! | [`energy`] | `||h + r - t||_p` and the margin ranking loss |
//! | [`models`] | [`TransE`], [`TextTransE`], [`RelTransE`] and [`EntityAligner`] |
//! | [`encoder`] | the [`TextEncoder`] seam and a mean-pooling encoder |
//! | [`cache`] | full entity tables for text models, versioned |
//! | [`evaluation`] | raw and filtered ranking, MRR / MR / Hits@k |
//! | [`optim`] | grouped AdamW, linear warmup, gradient accumulation |
//! | [`training`] | link prediction and alignment loops |
//! | [`context`] | device and metric sinks |
//!
//! Graph loading, description tokens and negative sampling live in
//! `glossa-core`; this crate turns those batches into tensors.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use glossa_kge::{LinkPredictionTrainer, ModelConfig, ParameterStore, RunContext, Splits, TrainingConfig, TransE};
//!
//! let ctx = RunContext::cpu();
//! let params = Arc::new(ParameterStore::new(ctx.device.clone()));
//! let model = TransE::new(num_entities, num_relations, ModelConfig::default(), params)?;
//!
//! let trainer = LinkPredictionTrainer::new(ctx, TrainingConfig::default());
//! let report = trainer.fit(&model, &splits)?;
//! ```

pub mod batch;
pub mod cache;
pub mod context;
pub mod encoder;
pub mod energy;
mod error;
pub mod evaluation;
pub mod models;
pub mod optim;
pub mod params;
pub mod training;

pub use batch::{description_tensors, DescriptionTensors, SampledTensors, TripleTensors};
pub use cache::{EmbeddingCacheBuilder, EntityEmbeddingCache};
pub use context::{JsonlSink, MemorySink, MetricsSink, RunContext, Scalar, TracingSink};
pub use encoder::{EncoderConfig, MeanPoolEncoder, TextEncoder};
pub use energy::{energy, margin_ranking_loss, PNorm};
pub use error::{Error, Result};
pub use evaluation::{compute_rank, EvalConfig, Evaluator, RankMetrics, RankingProtocol};
pub use models::{
    EnergyModel, EntityAligner, EntityEncoder, LearningRates, ModelConfig, ParamGroup, RelTransE,
    TextTransE, TransE,
};
pub use optim::{GradientAccumulator, GroupedOptimizer, LinearWarmup};
pub use params::ParameterStore;
pub use training::{
    AlignedEntity, AlignmentConfig, AlignmentReport, AlignmentSchedule, AlignmentTrainer,
    EpochReport, LinkPredictionTrainer, Splits, TrainingConfig, TrainingReport,
};
