use crate::error::KvResult;

pub trait Tokenizer: Send + Sync {
    /// Stable identifier. Part of every vocabulary cache key.
    fn name(&self) -> &str;
    fn encode(&self, text: &str) -> KvResult<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> KvResult<String>;

    fn count_tokens(&self, text: &str) -> KvResult<usize> {
        Ok(self.encode(text)?.len())
    }

    /// Raw piece table, for tokenizers that expose one.
    fn vocab_pieces(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A string is single-token when it encodes to one id and that id decodes
/// back to the same string.
pub fn is_single_token(tokenizer: &dyn Tokenizer, text: &str) -> KvResult<bool> {
    let ids = tokenizer.encode(text)?;
    if ids.len() != 1 {
        return Ok(false);
    }
    Ok(tokenizer.decode(&ids)? == text)
}
