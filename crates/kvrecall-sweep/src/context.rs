//! Explicitly owned per-run state: the results root and the vocabulary
//! cache. Opened once by the caller, passed by reference, closed at the end.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use kvrecall_core::vocabulary::{self, trim, TrimOptions};
use kvrecall_core::{KvError, KvResult, Tokenizer, Vocabulary};
use kvrecall_store::{ArtifactStore, VocabularyCache};

pub struct RunContext {
    root: PathBuf,
    vocabularies: VocabularyCache,
}

impl RunContext {
    /// Create the results root if needed.
    pub fn open(root: impl Into<PathBuf>) -> KvResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| KvError::Storage(format!("cannot create {}: {e}", root.display())))?;
        debug!(root = %root.display(), "run context opened");
        Ok(Self {
            root,
            vocabularies: VocabularyCache::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self, prompt_id: &str, provider: &str) -> KvResult<ArtifactStore> {
        ArtifactStore::open(&self.root, prompt_id, provider)
    }

    pub fn vocabularies(&self) -> &VocabularyCache {
        &self.vocabularies
    }

    /// Build, trim and size-check a vocabulary for `tokenizer`, at most once
    /// per (pool, tokenizer, trim options) for the life of this context.
    pub fn vocabulary<S: AsRef<str>>(
        &self,
        pool: &[S],
        tokenizer: &dyn Tokenizer,
        trim_options: &TrimOptions,
    ) -> KvResult<Arc<Vocabulary>> {
        self.vocabularies.get_or_build(pool, tokenizer.name(), trim_options, || {
            let built = vocabulary::build(pool.iter(), tokenizer)?;
            trim(&built, tokenizer, trim_options)
        })
    }

    pub fn close(self) -> KvResult<()> {
        info!(
            root = %self.root.display(),
            vocabularies = self.vocabularies.len(),
            "run context closed"
        );
        self.vocabularies.clear();
        Ok(())
    }
}
