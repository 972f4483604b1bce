use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use kvrecall_core::{KvError, KvResult, Provider, ProviderSettings, QueryParams, Tokenizer};

use crate::http::{self, agent, check, join_url};

const DEFAULT_HOST: &str = "http://localhost:11434";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Local models served by Ollama's `/api/generate`. No bulk path.
pub struct OllamaProvider {
    model: String,
    host: String,
    max_tokens: u32,
    tokenizer: Box<dyn Tokenizer>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub fn create(settings: &ProviderSettings) -> KvResult<Box<dyn Provider>> {
    let tokenizer = http::load_tokenizer(settings, "NousResearch/Meta-Llama-3-8B-Instruct")?;
    Ok(Box::new(OllamaProvider::new(
        settings.model.clone().unwrap_or_else(|| "llama3.2".into()),
        settings.base_url.clone().unwrap_or_else(|| DEFAULT_HOST.into()),
        settings.max_tokens.unwrap_or(8_192),
        tokenizer,
    )))
}

impl OllamaProvider {
    pub fn new(model: String, host: String, max_tokens: u32, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            model,
            host,
            max_tokens,
            tokenizer,
            agent: agent(Some(DEFAULT_TIMEOUT)),
        }
    }
}

pub fn generate_body(model: &str, prompt: &str, params: &QueryParams) -> Value {
    let mut options = json!({ "temperature": params.temperature });
    if let Some(max_tokens) = params.max_tokens {
        options["num_predict"] = json!(max_tokens);
    }
    json!({
        "model": model,
        "prompt": prompt,
        "stream": false,
        "options": options,
    })
}

impl Provider for OllamaProvider {
    fn provider_id(&self) -> &str {
        crate::OLLAMA
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    fn query(&self, prompt: &str, params: &QueryParams) -> KvResult<String> {
        let mut req = self.agent.post(&join_url(&self.host, "api/generate"));
        if let Some(timeout) = params.timeout {
            req = req.timeout(timeout);
        }
        let resp = check(req.send_json(generate_body(&self.model, prompt, params)))?;
        let body: GenerateResponse = resp
            .into_json()
            .map_err(|e| KvError::Provider(format!("invalid generate response: {e}")))?;
        Ok(body.response.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvrecall_core::testing::PieceTokenizer;

    #[test]
    fn test_generate_body() {
        let params = QueryParams {
            temperature: 0.0,
            max_tokens: Some(64),
            timeout: None,
        };
        let body = generate_body("llama3.2", "p", &params);
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 64);
        let body = generate_body("llama3.2", "p", &QueryParams::default());
        assert!(body["options"].get("num_predict").is_none());
    }

    #[test]
    fn test_no_batch_capability() {
        let p = OllamaProvider::new(
            "m".into(),
            DEFAULT_HOST.into(),
            100,
            Box::new(PieceTokenizer::new(["a"])),
        );
        assert!(p.as_batch().is_none());
        assert_eq!(p.provider_id(), "ollama");
        assert_eq!(p.count_tokens("aa").unwrap(), 2);
    }
}
