//! Provider capabilities consumed by the scheduler and the batch orchestrator.
//!
//! Every provider answers single prompts synchronously. Providers with a bulk
//! submission API additionally expose [`BatchProvider`] through
//! [`Provider::as_batch`]; callers pick the path by that capability check,
//! never by concrete type.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KvResult;
use crate::tokenizer::Tokenizer;

/// Prefix of the response text recorded when a query or batch item fails.
pub const ERROR_PREFIX: &str = "ERROR: ";

pub fn error_response(detail: impl fmt::Display) -> String {
    format!("{ERROR_PREFIX}{detail}")
}

pub fn is_error_response(text: &str) -> bool {
    text.starts_with(ERROR_PREFIX)
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: None,
            timeout: None,
        }
    }
}

pub trait Provider: Send + Sync {
    fn provider_id(&self) -> &str;
    fn model_name(&self) -> &str;
    /// Hard completion cap the remote model accepts.
    fn max_tokens(&self) -> u32;
    fn tokenizer(&self) -> &dyn Tokenizer;
    fn query(&self, prompt: &str, params: &QueryParams) -> KvResult<String>;

    fn count_tokens(&self, text: &str) -> KvResult<usize> {
        self.tokenizer().count_tokens(text)
    }

    fn as_batch(&self) -> Option<&dyn BatchProvider> {
        None
    }
}

/// One request line of a bulk submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl BatchState {
    /// Map a remote status string onto the orchestrator's states.
    pub fn from_remote(status: &str) -> Self {
        match status {
            "validating" | "queued" => Self::Pending,
            "in_progress" | "finalizing" | "cancelling" => Self::Running,
            "completed" => Self::Completed,
            "expired" => Self::Expired,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchStatus {
    pub batch_id: String,
    pub state: BatchState,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// Answer extracted from one line of a batch output file. Failed items carry
/// an [`error_response`] text so reconciliation never drops them.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAnswer {
    pub custom_id: Option<String>,
    pub text: String,
}

pub trait BatchProvider: Provider {
    /// Serialize requests into the exact bytes that would be uploaded.
    fn encode_payload(&self, requests: &[BatchRequest]) -> KvResult<Vec<u8>>;
    /// Upload a payload and start a remote job. Returns the job id.
    fn submit(&self, payload: Vec<u8>) -> KvResult<String>;
    fn status(&self, batch_id: &str) -> KvResult<BatchStatus>;
    fn download(&self, file_id: &str) -> KvResult<Vec<u8>>;
    fn parse_output(&self, bytes: &[u8]) -> KvResult<Vec<BatchAnswer>>;
}
