//! Process-local vocabulary cache keyed by (pool digest, tokenizer, trim
//! options).
//!
//! Owned by whoever builds the run; nothing here is global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::debug;

use kvrecall_core::{KvError, KvResult, TrimOptions, Vocabulary};

type CacheKey = (String, String, String);

#[derive(Default)]
pub struct VocabularyCache {
    entries: Mutex<HashMap<CacheKey, Arc<Vocabulary>>>,
}

/// Order-sensitive digest of a candidate pool.
pub fn pool_digest<S: AsRef<str>>(pool: &[S]) -> String {
    let mut hasher = Sha256::new();
    for item in pool {
        hasher.update(item.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

fn trim_key(opts: &TrimOptions) -> String {
    format!(
        "{:?}/{}/{}/{}",
        opts.separator, opts.require_surround_single, opts.max_sequence_length, opts.min_tokens
    )
}

impl VocabularyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached vocabulary for (`pool`, `tokenizer`, `trim`), or
    /// build and cache it with `build`. Build errors are not cached.
    pub fn get_or_build<S, F>(
        &self,
        pool: &[S],
        tokenizer: &str,
        trim: &TrimOptions,
        build: F,
    ) -> KvResult<Arc<Vocabulary>>
    where
        S: AsRef<str>,
        F: FnOnce() -> KvResult<Vocabulary>,
    {
        let key = (pool_digest(pool), tokenizer.to_string(), trim_key(trim));
        if let Some(hit) = self.lock()?.get(&key) {
            debug!(tokenizer, "vocabulary cache hit");
            return Ok(hit.clone());
        }
        let vocab = Arc::new(build()?);
        self.lock()?.insert(key, vocab.clone());
        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn lock(&self) -> KvResult<std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<Vocabulary>>>> {
        self.entries
            .lock()
            .map_err(|_| KvError::Storage("vocabulary cache poisoned".into()))
    }
}
