//! Graph inputs for text-augmented knowledge graph embeddings.
//!
//! This crate owns everything that happens before tensors exist:
//!
//! | Module | Role |
//! |--------|------|
//! | [`catalog`] | entity/relation ID tables, triple parsing, known-triple lookup |
//! | [`text`] | tokenized entity descriptions and padded token batches |
//! | [`dataset`] | one split of the graph, negative sampling |
//! | [`loader`] | shuffled epochs, bounded prefetch on worker threads |
//!
//! Every structure here is immutable once built and shared through `Arc`,
//! which is what lets prefetch workers sample without locks.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use glossa_core::{BatchLoader, Collate, GraphDataset, LoaderConfig};
//!
//! let train = GraphDataset::load("train.txt", "entities.txt", "relations.txt")?;
//! let valid = train.load_split("valid.txt")?;
//!
//! let loader = BatchLoader::new(Arc::new(train), LoaderConfig::default(), Collate::Filtered)?;
//! for batch in loader.epoch(0) {
//!     let batch = batch?;
//!     assert_eq!(batch.negatives.len(), batch.positives.len() * batch.ratio);
//! }
//! ```

pub mod catalog;
pub mod dataset;
mod error;
pub mod loader;
pub mod text;

pub use catalog::{load_graph, EntityId, GraphCatalog, RelationId, Triple, TripleIndex, Vocab};
pub use dataset::{BatchDescriptions, Corruption, GraphDataset, SampledBatch, SamplerConfig};
pub use error::{Error, Result};
pub use loader::{BatchLoader, Batches, Collate, LoaderConfig};
pub use text::{DescriptionBatch, TextStore, Tokenize};
