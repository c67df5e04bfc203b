//! `glossa` trains translation-based knowledge graph embeddings whose entity
//! vectors can come from a learned table or from encoded entity descriptions.
//!
//! The work is split across two crates, re-exported here:
//!
//! - [`data`] (`glossa-core`): catalogs, description tokens, negative sampling, loaders
//! - [`kge`] (`glossa-kge`): candle models, ranking evaluation, training loops
//!
//! Most programs only need the [`prelude`].

pub use glossa_core as data;
pub use glossa_kge as kge;

pub mod prelude {
    pub use glossa_core::{
        BatchLoader, Collate, Corruption, GraphCatalog, GraphDataset, LoaderConfig, SamplerConfig,
        TextStore, Tokenize, Triple,
    };
    pub use glossa_kge::{
        AlignmentConfig, AlignmentTrainer, EmbeddingCacheBuilder, EncoderConfig, EnergyModel,
        EntityAligner, EvalConfig, Evaluator, LinkPredictionTrainer, MeanPoolEncoder, ModelConfig,
        PNorm, ParameterStore, RankMetrics, RelTransE, RunContext, Splits, TextTransE,
        TrainingConfig, TransE,
    };
}
