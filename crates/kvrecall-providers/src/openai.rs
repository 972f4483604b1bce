//! OpenAI-compatible chat completions, plus the OpenAI batch API.
//!
//! DeepSeek speaks the same chat protocol but has no `/batches` endpoint, so
//! it is built from the same type with batching switched off.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use kvrecall_core::provider::error_response;
use kvrecall_core::{
    BatchAnswer, BatchProvider, BatchRequest, BatchState, BatchStatus, KvError, KvResult, Provider,
    ProviderSettings, QueryParams, Tokenizer,
};

use crate::http::{self, agent, check, join_url, multipart_body, read_bytes, read_json};

const CHAT_PATH: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";
const MULTIPART_BOUNDARY: &str = "kvrecall-batch-7f3a9c2e41d8";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub provider_id: String,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub batch: bool,
}

pub struct OpenAiCompatible {
    config: ChatConfig,
    tokenizer: Box<dyn Tokenizer>,
    agent: ureq::Agent,
}

pub fn create_openai(settings: &ProviderSettings) -> KvResult<Box<dyn Provider>> {
    let config = ChatConfig {
        provider_id: crate::OPENAI.into(),
        model: settings.model.clone().unwrap_or_else(|| "gpt-4o-mini".into()),
        base_url: settings
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".into()),
        api_key: http::api_key(settings, "OPENAI_API_KEY")?,
        max_tokens: settings.max_tokens.unwrap_or(16_384),
        batch: settings.batch,
    };
    let tokenizer = http::load_tokenizer(settings, "Xenova/gpt-4o")?;
    Ok(Box::new(OpenAiCompatible::new(config, tokenizer)))
}

pub fn create_deepseek(settings: &ProviderSettings) -> KvResult<Box<dyn Provider>> {
    let config = ChatConfig {
        provider_id: crate::DEEPSEEK.into(),
        model: settings.model.clone().unwrap_or_else(|| "deepseek-chat".into()),
        base_url: settings
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.deepseek.com".into()),
        api_key: http::api_key(settings, "DEEPSEEK_API_KEY")?,
        max_tokens: settings.max_tokens.unwrap_or(8_192),
        batch: false,
    };
    let tokenizer = http::load_tokenizer(settings, "deepseek-ai/DeepSeek-V3")?;
    Ok(Box::new(OpenAiCompatible::new(config, tokenizer)))
}

impl OpenAiCompatible {
    pub fn new(config: ChatConfig, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            config,
            tokenizer,
            agent: agent(Some(DEFAULT_REQUEST_TIMEOUT)),
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.config.api_key)
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    fn get_json(&self, path: &str) -> KvResult<Value> {
        let resp = check(
            self.agent
                .get(&self.url(path))
                .set("Authorization", &self.bearer())
                .call(),
        )?;
        read_json(resp)
    }

    fn post_json(&self, path: &str, body: &Value) -> KvResult<Value> {
        let resp = check(
            self.agent
                .post(&self.url(path))
                .set("Authorization", &self.bearer())
                .send_json(body),
        )?;
        read_json(resp)
    }

    fn upload_batch_file(&self, payload: &[u8]) -> KvResult<String> {
        let body = multipart_body(
            MULTIPART_BOUNDARY,
            &[("purpose", "batch")],
            "file",
            "batch_input.jsonl",
            payload,
        );
        let resp = check(
            self.agent
                .post(&self.url("files"))
                .set("Authorization", &self.bearer())
                .set(
                    "Content-Type",
                    &format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
                )
                .send_bytes(&body),
        )?;
        string_field(&read_json(resp)?, "id")
    }
}

impl Provider for OpenAiCompatible {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn max_tokens(&self) -> u32 {
        self.config.max_tokens
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    fn query(&self, prompt: &str, params: &QueryParams) -> KvResult<String> {
        let body = chat_body(&self.config.model, prompt, params.temperature, params.max_tokens);
        let mut req = self
            .agent
            .post(&self.url("chat/completions"))
            .set("Authorization", &self.bearer());
        if let Some(timeout) = params.timeout {
            req = req.timeout(timeout);
        }
        let resp = check(req.send_json(&body))?;
        extract_chat_content(&read_json(resp)?)
    }

    fn as_batch(&self) -> Option<&dyn BatchProvider> {
        if self.config.batch {
            Some(self)
        } else {
            None
        }
    }
}

impl BatchProvider for OpenAiCompatible {
    fn encode_payload(&self, requests: &[BatchRequest]) -> KvResult<Vec<u8>> {
        let mut out = Vec::new();
        for req in requests {
            serde_json::to_writer(&mut out, &batch_line(&self.config.model, req))?;
            out.push(b'\n');
        }
        Ok(out)
    }

    fn submit(&self, payload: Vec<u8>) -> KvResult<String> {
        let file_id = self.upload_batch_file(&payload)?;
        debug!(file_id = %file_id, bytes = payload.len(), "uploaded batch input");
        let batch = self.post_json(
            "batches",
            &json!({
                "input_file_id": file_id,
                "endpoint": CHAT_PATH,
                "completion_window": COMPLETION_WINDOW,
            }),
        )?;
        let batch_id = string_field(&batch, "id")?;
        info!(batch_id = %batch_id, provider = %self.config.provider_id, "batch created");
        Ok(batch_id)
    }

    fn status(&self, batch_id: &str) -> KvResult<BatchStatus> {
        parse_batch_status(&self.get_json(&format!("batches/{batch_id}"))?)
    }

    fn download(&self, file_id: &str) -> KvResult<Vec<u8>> {
        let resp = check(
            self.agent
                .get(&self.url(&format!("files/{file_id}/content")))
                .set("Authorization", &self.bearer())
                .call(),
        )?;
        read_bytes(resp)
    }

    fn parse_output(&self, bytes: &[u8]) -> KvResult<Vec<BatchAnswer>> {
        let text = String::from_utf8_lossy(bytes);
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| -> KvResult<BatchAnswer> {
                let value: Value = serde_json::from_str(line)?;
                Ok(extract_batch_answer(&value))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

pub fn chat_body(model: &str, prompt: &str, temperature: f32, max_tokens: Option<u32>) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [{ "role": "user", "content": prompt }],
        "temperature": temperature,
    });
    if let Some(max_tokens) = max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

pub fn extract_chat_content(resp: &Value) -> KvResult<String> {
    resp.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| KvError::Provider("response has no choices[0].message.content".into()))
}

/// One JSONL request line of the batch input file.
pub fn batch_line(model: &str, req: &BatchRequest) -> Value {
    json!({
        "custom_id": req.custom_id,
        "method": "POST",
        "url": CHAT_PATH,
        "body": chat_body(model, &req.prompt, req.temperature, Some(req.max_tokens)),
    })
}

/// Answer text of one batch output line; failures become sentinel texts.
pub fn extract_batch_answer(line: &Value) -> BatchAnswer {
    let custom_id = line
        .get("custom_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let text = match line.get("error") {
        Some(err) if !err.is_null() => error_response(err),
        _ => {
            let resp = line.get("response").unwrap_or(&Value::Null);
            let code = resp.get("status_code").and_then(Value::as_u64);
            if code != Some(200) {
                let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                let body = resp.get("body").unwrap_or(&Value::Null);
                error_response(format!("status {code} – {body}"))
            } else {
                match resp.get("body").map(extract_chat_content) {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => error_response(format!("malformed completion – {e}")),
                    None => error_response("malformed completion – missing body"),
                }
            }
        }
    };
    BatchAnswer { custom_id, text }
}

pub fn parse_batch_status(batch: &Value) -> KvResult<BatchStatus> {
    let batch_id = string_field(batch, "id")?;
    let remote = batch.get("status").and_then(Value::as_str).unwrap_or("unknown");
    let failure_reason = batch
        .pointer("/errors/data")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|s| !s.is_empty())
        .or_else(|| {
            batch
                .get("failed_reason")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    Ok(BatchStatus {
        batch_id,
        state: BatchState::from_remote(remote),
        output_file_id: optional_string(batch, "output_file_id"),
        error_file_id: optional_string(batch, "error_file_id"),
        failure_reason,
    })
}

fn string_field(value: &Value, field: &str) -> KvResult<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| KvError::Provider(format!("response missing '{field}'")))
}

fn optional_string(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvrecall_core::provider::is_error_response;
    use kvrecall_core::testing::PieceTokenizer;

    fn provider(batch: bool) -> OpenAiCompatible {
        OpenAiCompatible::new(
            ChatConfig {
                provider_id: "openai".into(),
                model: "gpt-test".into(),
                base_url: "http://127.0.0.1:9".into(),
                api_key: "sk-test".into(),
                max_tokens: 1000,
                batch,
            },
            Box::new(PieceTokenizer::new(["ab"])),
        )
    }

    #[test]
    fn test_chat_body() {
        let body = chat_body("m", "hi", 0.0, Some(120));
        assert_eq!(body["model"], "m");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["max_tokens"], 120);
        assert!(chat_body("m", "hi", 0.0, None).get("max_tokens").is_none());
    }

    #[test]
    fn test_extract_chat_content() {
        let ok = json!({"choices": [{"message": {"content": "  ab|cd\n"}}]});
        assert_eq!(extract_chat_content(&ok).unwrap(), "ab|cd");
        assert!(extract_chat_content(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_batch_answer_success() {
        let line = json!({
            "custom_id": "01J",
            "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "x|y"}}]}}
        });
        let ans = extract_batch_answer(&line);
        assert_eq!(ans.custom_id.as_deref(), Some("01J"));
        assert_eq!(ans.text, "x|y");
    }

    #[test]
    fn test_batch_answer_sentinels() {
        let top = extract_batch_answer(&json!({"custom_id": "a", "error": {"code": "x"}}));
        assert!(is_error_response(&top.text));

        let status = extract_batch_answer(&json!({
            "custom_id": "b",
            "response": {"status_code": 429, "body": {"error": "slow down"}}
        }));
        assert!(status.text.starts_with("ERROR: status 429 – "));

        let malformed = extract_batch_answer(&json!({
            "custom_id": "c",
            "response": {"status_code": 200, "body": {"choices": []}}
        }));
        assert!(malformed.text.starts_with("ERROR: malformed completion – "));

        let null_error = extract_batch_answer(&json!({
            "custom_id": "d",
            "error": null,
            "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "ok"}}]}}
        }));
        assert_eq!(null_error.text, "ok");
    }

    #[test]
    fn test_parse_batch_status() {
        let done = parse_batch_status(&json!({
            "id": "batch_1", "status": "completed", "output_file_id": "file-o", "error_file_id": null
        }))
        .unwrap();
        assert_eq!(done.state, BatchState::Completed);
        assert_eq!(done.output_file_id.as_deref(), Some("file-o"));
        assert!(done.error_file_id.is_none());

        let failed = parse_batch_status(&json!({
            "id": "batch_2", "status": "failed",
            "errors": {"data": [{"message": "bad line 3"}, {"message": "bad line 9"}]}
        }))
        .unwrap();
        assert_eq!(failed.state, BatchState::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("bad line 3; bad line 9"));
    }

    #[test]
    fn test_encode_payload_lines() {
        let p = provider(true);
        let reqs = vec![
            BatchRequest { custom_id: "a".into(), prompt: "p1".into(), temperature: 0.0, max_tokens: 10 },
            BatchRequest { custom_id: "b".into(), prompt: "p2".into(), temperature: 0.0, max_tokens: 20 },
        ];
        let bytes = p.encode_payload(&reqs).unwrap();
        let lines: Vec<Value> = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["custom_id"], "b");
        assert_eq!(lines[1]["url"], CHAT_PATH);
        assert_eq!(lines[1]["body"]["max_tokens"], 20);
    }

    #[test]
    fn test_parse_output_keeps_every_line() {
        let p = provider(true);
        let out = b"{\"custom_id\":\"a\",\"response\":{\"status_code\":200,\"body\":{\"choices\":[{\"message\":{\"content\":\"v\"}}]}}}\n\n{\"custom_id\":\"b\",\"error\":\"boom\"}\n";
        let answers = p.parse_output(out).unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].text, "v");
        assert_eq!(answers[1].text, "ERROR: \"boom\"");
    }

    #[test]
    fn test_batch_capability_is_configured() {
        assert!(provider(true).as_batch().is_some());
        assert!(provider(false).as_batch().is_none());
    }
}
