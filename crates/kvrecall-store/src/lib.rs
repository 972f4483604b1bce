pub mod cache;
pub mod layout;
pub mod store;
pub mod vocab_file;

pub use cache::VocabularyCache;
pub use layout::{atomic_write, list_runs, RunDir};
pub use store::ArtifactStore;
pub use vocab_file::{load_vocabulary, save_vocabulary};
