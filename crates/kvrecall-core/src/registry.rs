//! Static provider registry: identifier to constructor, filled by explicit
//! `register` calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{KvError, KvResult};
use crate::provider::Provider;

/// Everything a provider constructor may need. Unset fields fall back to the
/// provider's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Tokenizer file path or hub repository.
    pub tokenizer: Option<String>,
    pub max_tokens: Option<u32>,
    /// Enable the bulk path when the provider supports one.
    pub batch: bool,
}

pub type Constructor = fn(&ProviderSettings) -> KvResult<Box<dyn Provider>>;

#[derive(Default)]
pub struct ProviderRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, constructor: Constructor) -> KvResult<()> {
        if self.constructors.contains_key(id) {
            return Err(KvError::Config(format!("provider '{id}' registered twice")));
        }
        self.constructors.insert(id.to_string(), constructor);
        Ok(())
    }

    pub fn create(&self, id: &str, settings: &ProviderSettings) -> KvResult<Box<dyn Provider>> {
        let constructor = self.constructors.get(id).ok_or_else(|| {
            KvError::Config(format!(
                "unknown provider '{id}' (available: {})",
                self.ids().join(", ")
            ))
        })?;
        constructor(settings)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PieceTokenizer, ScriptedProvider};

    fn scripted(_: &ProviderSettings) -> KvResult<Box<dyn Provider>> {
        Ok(Box::new(ScriptedProvider::oracle(PieceTokenizer::new(["a"]))))
    }

    #[test]
    fn test_register_and_create() {
        let mut reg = ProviderRegistry::new();
        reg.register("scripted", scripted).unwrap();
        assert!(reg.contains("scripted"));
        let p = reg.create("scripted", &ProviderSettings::default()).unwrap();
        assert_eq!(p.provider_id(), "scripted");
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut reg = ProviderRegistry::new();
        reg.register("x", scripted).unwrap();
        assert!(matches!(reg.register("x", scripted), Err(KvError::Config(_))));
    }

    #[test]
    fn test_unknown_lists_available() {
        let mut reg = ProviderRegistry::new();
        reg.register("b", scripted).unwrap();
        reg.register("a", scripted).unwrap();
        assert_eq!(reg.ids(), vec!["a", "b"]);
        let err = reg.create("zzz", &ProviderSettings::default()).err().unwrap();
        assert!(err.to_string().contains("a, b"));
    }
}
