//! Deterministic stand-ins for tokenizers and providers, for tests in this
//! workspace. Enabled with the `test-support` feature.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{KvError, KvResult};
use crate::provider::{
    error_response, BatchAnswer, BatchProvider, BatchRequest, BatchState, BatchStatus, Provider,
    QueryParams,
};
use crate::tokenizer::Tokenizer;

const UNKNOWN_BASE: u32 = 1_000_000;

// ---------------------------------------------------------------------------
// PieceTokenizer
// ---------------------------------------------------------------------------

/// Greedy longest-match tokenizer over an explicit piece table. Text that
/// matches no piece falls back to one id per character.
pub struct PieceTokenizer {
    name: String,
    pieces: Vec<String>,
    ids: HashMap<String, u32>,
    max_piece_chars: usize,
}

impl PieceTokenizer {
    pub fn new<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table: Vec<String> = Vec::new();
        let mut ids = HashMap::new();
        for piece in pieces {
            let piece = piece.into();
            if piece.is_empty() || ids.contains_key(&piece) {
                continue;
            }
            ids.insert(piece.clone(), table.len() as u32);
            table.push(piece);
        }
        let max_piece_chars = table.iter().map(|p| p.chars().count()).max().unwrap_or(1);
        Self {
            name: "piece-tokenizer".into(),
            pieces: table,
            ids,
            max_piece_chars,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Tokenizer for PieceTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> KvResult<Vec<u32>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            let ends = rest
                .char_indices()
                .skip(1)
                .map(|(i, _)| i)
                .chain(std::iter::once(rest.len()))
                .take(self.max_piece_chars);
            let mut best = None;
            for end in ends {
                if let Some(id) = self.ids.get(&rest[..end]) {
                    best = Some((end, *id));
                }
            }
            match best {
                Some((len, id)) => {
                    out.push(id);
                    pos += len;
                }
                None => {
                    let Some(c) = rest.chars().next() else { break };
                    out.push(UNKNOWN_BASE + c as u32);
                    pos += c.len_utf8();
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, ids: &[u32]) -> KvResult<String> {
        let mut out = String::new();
        for &id in ids {
            if id >= UNKNOWN_BASE {
                let c = char::from_u32(id - UNKNOWN_BASE)
                    .ok_or_else(|| KvError::Tokenizer(format!("bad id {id}")))?;
                out.push(c);
            } else {
                let piece = self
                    .pieces
                    .get(id as usize)
                    .ok_or_else(|| KvError::Tokenizer(format!("bad id {id}")))?;
                out.push_str(piece);
            }
        }
        Ok(out)
    }

    fn vocab_pieces(&self) -> Vec<String> {
        self.pieces.clone()
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

pub type Responder = Box<dyn Fn(&str) -> KvResult<String> + Send + Sync>;

/// Answers every question in a rendered prompt correctly, by reading the
/// `KEY => VALUE` lines and then each key line that follows.
pub fn oracle_answer(prompt: &str) -> String {
    let mut facts: HashMap<&str, &str> = HashMap::new();
    let mut answers = Vec::new();
    for line in prompt.lines().map(str::trim) {
        if let Some((key, value)) = line.split_once(" => ") {
            facts.insert(key, value);
        } else if let Some(value) = facts.get(line) {
            answers.push(*value);
        }
    }
    answers.join("\n")
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Complete,
    Fail {
        reason: String,
        error_body: Option<String>,
    },
    /// Never leaves the running state.
    Hang,
}

struct BatchScript {
    polls_before_done: usize,
    outcome: BatchOutcome,
    submissions: Vec<Vec<BatchRequest>>,
    polls: HashMap<String, usize>,
}

pub struct ScriptedProvider {
    provider_id: String,
    model: String,
    tokenizer: PieceTokenizer,
    responder: Responder,
    prompts: Mutex<Vec<String>>,
    batch: Option<Mutex<BatchScript>>,
}

impl ScriptedProvider {
    pub fn new(tokenizer: PieceTokenizer, responder: Responder) -> Self {
        Self {
            provider_id: "scripted".into(),
            model: "scripted-model".into(),
            tokenizer,
            responder,
            prompts: Mutex::new(Vec::new()),
            batch: None,
        }
    }

    pub fn oracle(tokenizer: PieceTokenizer) -> Self {
        Self::new(tokenizer, Box::new(|prompt| Ok(oracle_answer(prompt))))
    }

    pub fn with_batch(mut self, outcome: BatchOutcome, polls_before_done: usize) -> Self {
        self.batch = Some(Mutex::new(BatchScript {
            polls_before_done,
            outcome,
            submissions: Vec::new(),
            polls: HashMap::new(),
        }));
        self
    }

    /// Prompts received by `query`, in call order.
    pub fn queries(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Requests of each submitted batch, in submission order.
    pub fn submissions(&self) -> Vec<Vec<BatchRequest>> {
        match &self.batch {
            Some(script) => script
                .lock()
                .map(|s| s.submissions.clone())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn script(&self) -> KvResult<std::sync::MutexGuard<'_, BatchScript>> {
        self.batch
            .as_ref()
            .ok_or_else(|| KvError::Provider("batch not scripted".into()))?
            .lock()
            .map_err(|_| KvError::Provider("batch script poisoned".into()))
    }

    fn batch_index(batch_id: &str) -> KvResult<usize> {
        batch_id
            .rsplit('_')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| KvError::Provider(format!("unknown batch {batch_id}")))
    }
}

impl Provider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_tokens(&self) -> u32 {
        4096
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn query(&self, prompt: &str, _params: &QueryParams) -> KvResult<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        (self.responder)(prompt)
    }

    fn as_batch(&self) -> Option<&dyn BatchProvider> {
        if self.batch.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl BatchProvider for ScriptedProvider {
    fn encode_payload(&self, requests: &[BatchRequest]) -> KvResult<Vec<u8>> {
        let mut out = Vec::new();
        for req in requests {
            out.extend(serde_json::to_vec(req)?);
            out.push(b'\n');
        }
        Ok(out)
    }

    fn submit(&self, payload: Vec<u8>) -> KvResult<String> {
        let text = String::from_utf8_lossy(&payload);
        let requests = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<BatchRequest>, _>>()?;
        let mut script = self.script()?;
        script.submissions.push(requests);
        Ok(format!("batch_{}", script.submissions.len() - 1))
    }

    fn status(&self, batch_id: &str) -> KvResult<BatchStatus> {
        let mut guard = self.script()?;
        let script = &mut *guard;
        let polls = script.polls.entry(batch_id.to_string()).or_insert(0);
        *polls += 1;
        let done = *polls > script.polls_before_done;

        let mut status = BatchStatus {
            batch_id: batch_id.to_string(),
            state: BatchState::Running,
            output_file_id: None,
            error_file_id: None,
            failure_reason: None,
        };
        if !done {
            return Ok(status);
        }
        match &script.outcome {
            BatchOutcome::Complete => {
                status.state = BatchState::Completed;
                status.output_file_id = Some(format!("out_{batch_id}"));
            }
            BatchOutcome::Fail { reason, error_body } => {
                status.state = BatchState::Failed;
                status.failure_reason = Some(reason.clone());
                if error_body.is_some() {
                    status.error_file_id = Some(format!("err_{batch_id}"));
                }
            }
            BatchOutcome::Hang => {}
        }
        Ok(status)
    }

    fn download(&self, file_id: &str) -> KvResult<Vec<u8>> {
        let script = self.script()?;
        if let Some(batch_id) = file_id.strip_prefix("err_") {
            return match &script.outcome {
                BatchOutcome::Fail {
                    error_body: Some(body),
                    ..
                } => Ok(body.clone().into_bytes()),
                _ => Err(KvError::Provider(format!("no error file for {batch_id}"))),
            };
        }
        let batch_id = file_id
            .strip_prefix("out_")
            .ok_or_else(|| KvError::Provider(format!("unknown file {file_id}")))?;
        let requests = script
            .submissions
            .get(Self::batch_index(batch_id)?)
            .ok_or_else(|| KvError::Provider(format!("unknown batch {batch_id}")))?;

        let mut out = Vec::new();
        for req in requests {
            let answer = (self.responder)(&req.prompt).unwrap_or_else(|e| error_response(e));
            let line = serde_json::json!({ "custom_id": req.custom_id, "answer": answer });
            out.extend(serde_json::to_vec(&line)?);
            out.push(b'\n');
        }
        Ok(out)
    }

    fn parse_output(&self, bytes: &[u8]) -> KvResult<Vec<BatchAnswer>> {
        let text = String::from_utf8_lossy(bytes);
        let mut answers = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let value: serde_json::Value = serde_json::from_str(line)?;
            answers.push(BatchAnswer {
                custom_id: value
                    .get("custom_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                text: value
                    .get("answer")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(answers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_longest_match() {
        let tok = PieceTokenizer::new(["a", "ab", "abc", "|"]);
        assert_eq!(tok.encode("abc").unwrap().len(), 1);
        assert_eq!(tok.encode("abab").unwrap().len(), 2);
        assert_eq!(tok.encode("|abcx|").unwrap().len(), 4);
        let ids = tok.encode("|abcx|").unwrap();
        assert_eq!(tok.decode(&ids).unwrap(), "|abcx|");
    }

    #[test]
    fn test_oracle_answer() {
        let prompt = "Facts:\nab|cd => ef|gh\nij|kl => mn|op\n\nQuestions:\nij|kl\nab|cd\n";
        assert_eq!(oracle_answer(prompt), "mn|op\nef|gh");
    }

    #[test]
    fn test_scripted_batch_roundtrip() {
        let provider = ScriptedProvider::oracle(PieceTokenizer::new(["a"]))
            .with_batch(BatchOutcome::Complete, 1);
        let batch = provider.as_batch().unwrap();
        let reqs = vec![BatchRequest {
            custom_id: "one".into(),
            prompt: "x => y\nx".into(),
            temperature: 0.0,
            max_tokens: 10,
        }];
        let id = batch.submit(batch.encode_payload(&reqs).unwrap()).unwrap();
        assert_eq!(batch.status(&id).unwrap().state, BatchState::Running);
        let status = batch.status(&id).unwrap();
        assert_eq!(status.state, BatchState::Completed);
        let bytes = batch.download(&status.output_file_id.unwrap()).unwrap();
        let answers = batch.parse_output(&bytes).unwrap();
        assert_eq!(answers[0].text, "y");
        assert_eq!(answers[0].custom_id.as_deref(), Some("one"));
    }
}
