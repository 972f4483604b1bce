use std::fs;
use std::path::Path;

use tracing::debug;

use kvrecall_core::{KvError, KvResult, Vocabulary};

use crate::layout::atomic_write;

/// Read a vocabulary file (JSON array of strings) built for `tokenizer`.
pub fn load_vocabulary(path: &Path, tokenizer: &str) -> KvResult<Vocabulary> {
    let json = fs::read_to_string(path).map_err(|e| {
        KvError::Storage(format!("cannot read vocabulary {}: {e}", path.display()))
    })?;
    let vocab = Vocabulary::from_json(tokenizer, &json)?;
    debug!(path = %path.display(), tokens = vocab.len(), "loaded vocabulary");
    Ok(vocab)
}

/// Write `vocab` as a sorted, pretty-printed JSON array.
pub fn save_vocabulary(path: &Path, vocab: &Vocabulary) -> KvResult<()> {
    let json = serde_json::to_string_pretty(vocab.tokens())?;
    atomic_write(path, json.as_bytes())?;
    debug!(path = %path.display(), tokens = vocab.len(), "saved vocabulary");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_sorted_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vocab.json");
        let vocab = Vocabulary::new("tok", ["pear", "apple", "fig", "apple"]);
        save_vocabulary(&path, &vocab).unwrap();

        let raw: Vec<String> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, vec!["apple", "fig", "pear"]);

        let loaded = load_vocabulary(&path, "tok").unwrap();
        assert_eq!(loaded, vocab);
    }

    #[test]
    fn test_missing_file_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let err = load_vocabulary(&dir.path().join("nope.json"), "tok").unwrap_err();
        assert!(matches!(err, KvError::Storage(_)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{\"a\": 1}").unwrap();
        assert!(matches!(
            load_vocabulary(&path, "tok"),
            Err(KvError::Serialization(_))
        ));
    }
}
