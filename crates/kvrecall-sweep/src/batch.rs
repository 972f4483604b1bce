//! Batch orchestration: buffer prepared trials, submit them as bulk jobs
//! under the payload limit, poll until terminal, then reconcile answers back
//! onto their trials and persist every unit whose trials are all in.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use kvrecall_core::provider::error_response;
use kvrecall_core::{
    BatchAnswer, BatchProvider, BatchRequest, BatchState, BatchStatus, KvError, KvResult,
    TrialRecord, UnitArtifact, UnitKey,
};
use kvrecall_store::ArtifactStore;

use crate::trial::{complete_trial, PreparedTrial};

const MISSING_ANSWER: &str = "missing from batch output";

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Trials buffered before a submission is triggered.
    pub batch_size: usize,
    /// Upper bound on one uploaded payload.
    pub max_payload_bytes: usize,
    pub poll_interval: Duration,
    /// Give up on a job still pending after this long.
    pub timeout: Duration,
    pub temperature: f32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_payload_bytes: 100 * 1024 * 1024,
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3600),
            temperature: 0.0,
        }
    }
}

struct QueuedTrial {
    custom_id: String,
    prepared: PreparedTrial,
}

#[derive(Default)]
struct PendingUnit {
    expected: usize,
    records: Vec<TrialRecord>,
}

pub struct BatchOrchestrator<'a> {
    provider: &'a dyn BatchProvider,
    store: &'a ArtifactStore,
    prompt_id: String,
    separator: String,
    options: BatchOptions,
    queue: Vec<QueuedTrial>,
    pending: BTreeMap<UnitKey, PendingUnit>,
    written: Vec<(UnitKey, PathBuf)>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        provider: &'a dyn BatchProvider,
        store: &'a ArtifactStore,
        prompt_id: &str,
        separator: &str,
        options: BatchOptions,
    ) -> Self {
        Self {
            provider,
            store,
            prompt_id: prompt_id.to_string(),
            separator: separator.to_string(),
            options,
            queue: Vec::new(),
            pending: BTreeMap::new(),
            written: Vec::new(),
        }
    }

    /// Queue every trial of one unit, submitting whenever the buffer fills.
    pub fn enqueue_unit(&mut self, key: UnitKey, trials: Vec<PreparedTrial>) -> KvResult<()> {
        if trials.is_empty() {
            return Ok(());
        }
        self.pending.entry(key).or_default().expected += trials.len();
        for prepared in trials {
            self.queue.push(QueuedTrial {
                custom_id: Ulid::new().to_string(),
                prepared,
            });
            if self.queue.len() >= self.options.batch_size.max(1) {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Submit what is still buffered and return the units written overall.
    pub fn finish(mut self) -> KvResult<Vec<(UnitKey, PathBuf)>> {
        self.flush()?;
        for (key, unit) in &self.pending {
            warn!(
                unit = %key,
                expected = unit.expected,
                received = unit.records.len(),
                "unit left incomplete by batch run"
            );
        }
        Ok(self.written)
    }

    fn flush(&mut self) -> KvResult<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let queued = std::mem::take(&mut self.queue);
        let requests: Vec<BatchRequest> = queued
            .iter()
            .map(|q| BatchRequest {
                custom_id: q.custom_id.clone(),
                prompt: q.prepared.prompt.text.clone(),
                temperature: self.options.temperature,
                max_tokens: q.prepared.max_tokens,
            })
            .collect();

        let provider = self.provider;
        let chunks = split_for_submission(&requests, self.options.max_payload_bytes, |chunk| {
            provider.encode_payload(chunk)
        })?;
        if chunks.len() > 1 {
            info!(requests = requests.len(), chunks = chunks.len(), "payload split to fit size limit");
        }

        for (range, payload) in chunks {
            let batch_id = self.provider.submit(payload)?;
            info!(%batch_id, requests = range.len(), "batch submitted");
            let status = self.wait(&batch_id)?;
            let answers = self.collect(&status)?;
            let ids: Vec<&str> = queued[range.clone()]
                .iter()
                .map(|q| q.custom_id.as_str())
                .collect();
            let texts = reconcile_answers(&ids, answers);
            for (q, text) in queued[range].iter().zip(texts) {
                let record = complete_trial(
                    &q.prepared,
                    &text,
                    None,
                    self.provider.tokenizer(),
                    &self.separator,
                )?;
                self.record(q.prepared.key, record)?;
            }
        }
        Ok(())
    }

    /// Poll until the job is terminal or the timeout passes.
    fn wait(&self, batch_id: &str) -> KvResult<BatchStatus> {
        let started = Instant::now();
        let mut last_state = None;
        loop {
            let status = self.provider.status(batch_id)?;
            if last_state != Some(status.state) {
                debug!(batch_id, state = %status.state, "batch state");
                last_state = Some(status.state);
            }
            match status.state {
                BatchState::Completed => return Ok(status),
                BatchState::Failed | BatchState::Expired | BatchState::Cancelled => {
                    return Err(self.failed(status));
                }
                BatchState::Pending | BatchState::Running => {}
            }
            let waited = started.elapsed();
            if waited >= self.options.timeout {
                return Err(KvError::TimedOut {
                    batch_id: batch_id.to_string(),
                    waited_secs: waited.as_secs(),
                });
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    fn failed(&self, status: BatchStatus) -> KvError {
        let error_file = status
            .error_file_id
            .as_deref()
            .and_then(|file_id| self.save_error_file(&status.batch_id, file_id));
        KvError::BatchFailed {
            reason: status
                .failure_reason
                .unwrap_or_else(|| status.state.to_string()),
            batch_id: status.batch_id,
            error_file,
        }
    }

    fn save_error_file(&self, batch_id: &str, file_id: &str) -> Option<PathBuf> {
        let saved = self
            .provider
            .download(file_id)
            .and_then(|bytes| self.store.save_error_file(batch_id, &bytes));
        match saved {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(batch_id, file_id, error = %e, "could not retrieve batch error file");
                None
            }
        }
    }

    fn collect(&self, status: &BatchStatus) -> KvResult<Vec<BatchAnswer>> {
        if let Some(file_id) = &status.error_file_id {
            self.save_error_file(&status.batch_id, file_id);
        }
        let Some(output_id) = &status.output_file_id else {
            return Err(KvError::BatchFailed {
                batch_id: status.batch_id.clone(),
                reason: "completed without an output file".into(),
                error_file: None,
            });
        };
        let bytes = self.provider.download(output_id)?;
        let saved = self.store.save_batch_output(&bytes, Utc::now())?;
        debug!(batch_id = %status.batch_id, path = %saved.display(), "batch output saved");
        self.provider.parse_output(&bytes)
    }

    fn record(&mut self, key: UnitKey, record: TrialRecord) -> KvResult<()> {
        let Some(unit) = self.pending.get_mut(&key) else {
            warn!(unit = %key, "answer for a unit that is not pending");
            return Ok(());
        };
        unit.records.push(record);
        if unit.records.len() < unit.expected {
            return Ok(());
        }
        if let Some(mut unit) = self.pending.remove(&key) {
            unit.records.sort_by_key(|r| r.trial);
            let artifact = UnitArtifact::new(
                &self.prompt_id,
                self.provider.provider_id(),
                self.provider.model_name(),
                key,
                unit.records,
                Utc::now(),
            );
            let path = self.store.write_unit(&artifact)?;
            info!(unit = %key, path = %path.display(), "unit written");
            self.written.push((key, path));
        }
        Ok(())
    }
}

/// Split `items` into contiguous chunks whose encoding fits `max_bytes`,
/// halving any chunk that is too large. Returns each chunk's range with its
/// encoded payload.
pub fn split_for_submission<T, F>(
    items: &[T],
    max_bytes: usize,
    encode: F,
) -> KvResult<Vec<(Range<usize>, Vec<u8>)>>
where
    F: Fn(&[T]) -> KvResult<Vec<u8>>,
{
    let mut out = Vec::new();
    if !items.is_empty() {
        split_range(items, 0..items.len(), max_bytes, &encode, &mut out)?;
    }
    Ok(out)
}

fn split_range<T, F>(
    items: &[T],
    range: Range<usize>,
    max_bytes: usize,
    encode: &F,
    out: &mut Vec<(Range<usize>, Vec<u8>)>,
) -> KvResult<()>
where
    F: Fn(&[T]) -> KvResult<Vec<u8>>,
{
    let payload = encode(&items[range.clone()])?;
    if payload.len() <= max_bytes {
        out.push((range, payload));
        return Ok(());
    }
    if range.len() == 1 {
        return Err(KvError::Config(format!(
            "a single batch request encodes to {} bytes, over the {max_bytes} byte limit",
            payload.len()
        )));
    }
    let mid = range.start + range.len() / 2;
    split_range(items, range.start..mid, max_bytes, encode, out)?;
    split_range(items, mid..range.end, max_bytes, encode, out)
}

/// Order answers like `custom_ids`. Answers are matched by id first; any
/// left over fill their own position if it is still empty. Unanswered slots
/// get an error text.
pub fn reconcile_answers(custom_ids: &[&str], answers: Vec<BatchAnswer>) -> Vec<String> {
    let index: HashMap<&str, usize> = custom_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    let mut slots: Vec<Option<String>> = vec![None; custom_ids.len()];
    let mut unmatched = Vec::new();

    for (pos, answer) in answers.into_iter().enumerate() {
        let matched = answer
            .custom_id
            .as_deref()
            .and_then(|id| index.get(id).copied());
        match matched {
            Some(i) if slots[i].is_none() => slots[i] = Some(answer.text),
            _ => unmatched.push((pos, answer.text)),
        }
    }
    for (pos, text) in unmatched {
        match slots.get_mut(pos) {
            Some(slot) if slot.is_none() => *slot = Some(text),
            _ => debug!(position = pos, "dropping unmatched batch answer"),
        }
    }
    slots
        .into_iter()
        .map(|s| s.unwrap_or_else(|| error_response(MISSING_ANSWER)))
        .collect()
}
