//! Concrete providers. Each is registered under a fixed id by
//! [`register_builtin`]; nothing is discovered at runtime.

pub mod http;
pub mod ollama;
pub mod openai;

use kvrecall_core::{KvResult, ProviderRegistry};

pub use ollama::OllamaProvider;
pub use openai::{ChatConfig, OpenAiCompatible};

pub const OPENAI: &str = "openai";
pub const DEEPSEEK: &str = "deepseek";
pub const OLLAMA: &str = "ollama";

pub fn register_builtin(registry: &mut ProviderRegistry) -> KvResult<()> {
    registry.register(OPENAI, openai::create_openai)?;
    registry.register(DEEPSEEK, openai::create_deepseek)?;
    registry.register(OLLAMA, ollama::create)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids() {
        let mut reg = ProviderRegistry::new();
        register_builtin(&mut reg).unwrap();
        assert_eq!(reg.ids(), vec![DEEPSEEK, OLLAMA, OPENAI]);
        assert!(register_builtin(&mut reg).is_err());
    }
}
