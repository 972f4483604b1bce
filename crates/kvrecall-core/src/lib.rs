pub mod artifact;
pub mod diff;
pub mod error;
pub mod facts;
pub mod grading;
pub mod hf_tokenizer;
pub mod provider;
pub mod registry;
pub mod template;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod tokenizer;
pub mod vocabulary;

pub use artifact::{TrialRecord, UnitArtifact, UnitKey, UnitSummary};
pub use diff::TokenDiff;
pub use error::{ErrorCategory, KvError, KvResult};
pub use facts::{Fact, FactSet, Instance, InstanceGenerator};
pub use grading::{FormatFlaw, Grade};
pub use hf_tokenizer::HfTokenizer;
pub use provider::{
    BatchAnswer, BatchProvider, BatchRequest, BatchState, BatchStatus, Provider, QueryParams,
};
pub use registry::{ProviderRegistry, ProviderSettings};
pub use template::{JinjaTemplate, PromptRenderer, RenderedPrompt};
pub use tokenizer::Tokenizer;
pub use vocabulary::{AlphaSpec, TrimOptions, Vocabulary};
