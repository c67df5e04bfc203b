use thiserror::Error;

/// Errors that can occur while training or evaluating embedding models.
#[derive(Error, Debug)]
pub enum Error {
    /// Graph input or batch assembly failed.
    #[error(transparent)]
    Data(#[from] glossa_core::Error),
    /// Tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    /// IO error (metrics files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A batch has only positives, only negatives, or mismatched counts.
    #[error("batch shape error: {0}")]
    BatchShape(String),
    /// A loop that divides by its batch count saw no batches.
    #[error("empty loader: {0}")]
    EmptyLoader(String),
    /// The loss became NaN or infinite.
    #[error("numeric divergence at {context}: loss = {value}")]
    NumericDivergence { context: String, value: f32 },
    /// An entity embedding cache was built from older parameters.
    #[error("stale embedding cache: built at parameter version {cached}, model is at {current}")]
    StaleCache { cached: u64, current: u64 },
    /// A text model was asked to rank without a precomputed entity table.
    #[error("model derives entity embeddings from text; build an embedding cache first")]
    MissingCache,
    /// The model cannot do what was asked.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type alias for glossa-kge.
pub type Result<T> = std::result::Result<T, Error>;
