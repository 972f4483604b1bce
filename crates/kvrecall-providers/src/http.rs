use std::io::Read;
use std::time::Duration;

use kvrecall_core::{HfTokenizer, KvError, KvResult, ProviderSettings, Tokenizer};

/// Longest body excerpt kept in an error message.
const ERROR_BODY_LIMIT: usize = 500;

pub fn agent(timeout: Option<Duration>) -> ureq::Agent {
    let mut builder = ureq::AgentBuilder::new();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

/// Map a ureq outcome to a response or a `Provider` error carrying the
/// status code and the head of the body.
pub fn check(result: Result<ureq::Response, ureq::Error>) -> KvResult<ureq::Response> {
    match result {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            Err(KvError::Provider(format!(
                "status {code} – {}",
                truncate(&body, ERROR_BODY_LIMIT)
            )))
        }
        Err(ureq::Error::Transport(t)) => Err(KvError::Provider(format!("transport: {t}"))),
    }
}

pub fn read_json(resp: ureq::Response) -> KvResult<serde_json::Value> {
    resp.into_json()
        .map_err(|e| KvError::Provider(format!("invalid JSON response: {e}")))
}

pub fn read_bytes(resp: ureq::Response) -> KvResult<Vec<u8>> {
    let mut out = Vec::new();
    resp.into_reader()
        .read_to_end(&mut out)
        .map_err(|e| KvError::Provider(format!("read body: {e}")))?;
    Ok(out)
}

pub fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// API key from the configured env var, or `default_env`.
pub fn api_key(settings: &ProviderSettings, default_env: &str) -> KvResult<String> {
    let var = settings.api_key_env.as_deref().unwrap_or(default_env);
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(KvError::Config(format!("environment variable {var} is not set"))),
    }
}

pub fn load_tokenizer(settings: &ProviderSettings, default_ref: &str) -> KvResult<Box<dyn Tokenizer>> {
    let reference = settings.tokenizer.as_deref().unwrap_or(default_ref);
    Ok(Box::new(HfTokenizer::resolve(reference)?))
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// `multipart/form-data` body with plain text fields followed by one file.
pub fn multipart_body(
    boundary: &str,
    fields: &[(&str, &str)],
    file_field: &str,
    file_name: &str,
    file: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(file.len() + 512);
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{file_field}\"; filename=\"{file_name}\"\r\nContent-Type: application/jsonl\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(file);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://x/v1/", "/files"), "https://x/v1/files");
        assert_eq!(join_url("http://h:1", "api/generate"), "http://h:1/api/generate");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }

    #[test]
    fn test_multipart_layout() {
        let body = multipart_body("B", &[("purpose", "batch")], "file", "in.jsonl", b"{}\n");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--B\r\nContent-Disposition: form-data; name=\"purpose\"\r\n\r\nbatch\r\n"));
        assert!(text.contains("filename=\"in.jsonl\""));
        assert!(text.ends_with("{}\n\r\n--B--\r\n"));
    }

    #[test]
    fn test_missing_api_key() {
        let settings = ProviderSettings {
            api_key_env: Some("KVRECALL_TEST_SURELY_UNSET_KEY".into()),
            ..Default::default()
        };
        assert!(matches!(api_key(&settings, "X"), Err(KvError::Config(_))));
    }
}
