use std::path::Path;

use tokenizers::Tokenizer as Inner;

use crate::error::{KvError, KvResult};
use crate::tokenizer::Tokenizer;

/// Adapter over a Hugging Face `tokenizer.json`.
pub struct HfTokenizer {
    name: String,
    inner: Inner,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> KvResult<Self> {
        let inner = Inner::from_file(path)
            .map_err(|e| KvError::Tokenizer(format!("cannot load {}: {e}", path.display())))?;
        Ok(Self {
            name: path.display().to_string(),
            inner,
        })
    }

    /// Download `tokenizer.json` from a hub repository (e.g. `deepseek-ai/DeepSeek-V3`).
    #[cfg(feature = "hub")]
    pub fn from_pretrained(repo: &str) -> KvResult<Self> {
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| KvError::Tokenizer(format!("hub client: {e}")))?;
        let path = api
            .model(repo.to_string())
            .get("tokenizer.json")
            .map_err(|e| KvError::Tokenizer(format!("cannot fetch {repo}: {e}")))?;
        let mut tok = Self::from_file(&path)?;
        tok.name = repo.to_string();
        Ok(tok)
    }

    /// Resolve a tokenizer reference: an existing file path, or a hub repo id
    /// when the `hub` feature is enabled.
    pub fn resolve(reference: &str) -> KvResult<Self> {
        let path = Path::new(reference);
        if path.is_file() {
            return Self::from_file(path);
        }
        #[cfg(feature = "hub")]
        {
            Self::from_pretrained(reference)
        }
        #[cfg(not(feature = "hub"))]
        {
            Err(KvError::Config(format!(
                "tokenizer file not found: {reference} (enable the `hub` feature to fetch by repo id)"
            )))
        }
    }
}

impl Tokenizer for HfTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> KvResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| KvError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> KvResult<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| KvError::Tokenizer(e.to_string()))
    }

    fn vocab_pieces(&self) -> Vec<String> {
        self.inner.get_vocab(false).into_keys().collect()
    }
}
