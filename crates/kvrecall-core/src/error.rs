use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("config error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("vocabulary exhausted: found {found} of {requested} single-token strings")]
    VocabularyExhausted { requested: usize, found: usize },

    #[error("validation failed: {kept} tokens survived filtering, {requested} required")]
    ValidationFailed { requested: usize, kept: usize },

    #[error("sequence space exhausted: no unused {k}-token sequence after {attempts} attempts")]
    SequenceExhausted { k: usize, attempts: usize },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("batch {batch_id} still pending after {waited_secs}s")]
    TimedOut { batch_id: String, waited_secs: u64 },

    #[error("batch {batch_id} failed: {reason}")]
    BatchFailed {
        batch_id: String,
        reason: String,
        error_file: Option<PathBuf>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used by callers to decide what a failure aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid parameters. Fatal, never retried.
    Configuration,
    /// Vocabulary or sequence space too small. Fatal for one unit only.
    Capacity,
    /// Transport, timeout or remote job failure.
    Provider,
    Internal,
}

impl KvError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Template(_) => ErrorCategory::Configuration,
            Self::VocabularyExhausted { .. }
            | Self::ValidationFailed { .. }
            | Self::SequenceExhausted { .. } => ErrorCategory::Capacity,
            Self::Provider(_) | Self::TimedOut { .. } | Self::BatchFailed { .. } => {
                ErrorCategory::Provider
            }
            Self::Tokenizer(_) | Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorCategory::Internal
            }
        }
    }

    pub fn is_capacity(&self) -> bool {
        self.category() == ErrorCategory::Capacity
    }
}

pub type KvResult<T> = Result<T, KvError>;
