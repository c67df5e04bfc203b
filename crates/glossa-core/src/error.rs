use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading graph inputs or assembling batches.
#[derive(Error, Debug)]
pub enum Error {
    /// An input file does not exist.
    #[error("missing input file: {}", .0.display())]
    MissingFile(PathBuf),
    /// An input file exists but could not be read.
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A line in an input file is malformed or references an unknown ID.
    #[error("schema error at {}:{line}: {message}", path.display())]
    Schema {
        path: PathBuf,
        line: usize,
        message: String,
    },
    /// An entity ID outside `[0, num_entities)` was requested.
    #[error("entity id {id} out of range (num_entities = {num_entities})")]
    UnknownEntity { id: u32, num_entities: usize },
    /// A relation ID outside `[0, num_relations)` was referenced.
    #[error("relation id {id} out of range (num_relations = {num_relations})")]
    UnknownRelation { id: u32, num_relations: usize },
    /// A batch does not have the shape the consumer expects.
    #[error("batch shape error: {0}")]
    BatchShape(String),
    /// A description store sized for a different catalog.
    #[error("description store covers {descriptions} entities, catalog has {entities}")]
    DescriptionCount { descriptions: usize, entities: usize },
    /// The dataset was built without a description store.
    #[error("dataset has no entity descriptions attached")]
    NoDescriptions,
    /// The tokenizer rejected a description.
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    /// A prefetch worker panicked before delivering its batches.
    #[error("prefetch worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Result type alias for glossa-core.
pub type Result<T> = std::result::Result<T, Error>;
