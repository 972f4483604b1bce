use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::grading::Grade;

pub const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// One graded trial, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial: usize,
    pub sequence_accuracy: f64,
    pub token_accuracy: f64,
    pub major_format_flaw: bool,
    pub response_time_ms: Option<f64>,
    pub prompt_tokens: Option<usize>,
    pub prompt_text: String,
    pub response_text: String,
    pub response_token_count: usize,
    pub expected_response_text: String,
    pub expected_token_count: usize,
}

impl TrialRecord {
    pub fn from_grade(
        trial: usize,
        grade: &Grade,
        prompt_text: String,
        response_text: String,
        expected_response_text: String,
    ) -> Self {
        Self {
            trial,
            sequence_accuracy: grade.sequence_accuracy,
            token_accuracy: grade.token_accuracy,
            major_format_flaw: grade.is_flawed(),
            response_time_ms: None,
            prompt_tokens: None,
            prompt_text,
            response_text,
            response_token_count: grade.response_token_count,
            expected_response_text,
            expected_token_count: grade.expected_token_count,
        }
    }

    pub fn with_timing(mut self, response_time_ms: Option<f64>) -> Self {
        self.response_time_ms = response_time_ms;
        self
    }

    pub fn with_prompt_tokens(mut self, prompt_tokens: Option<usize>) -> Self {
        self.prompt_tokens = prompt_tokens;
        self
    }
}

/// Grid coordinates of an experiment unit: facts per prompt and tokens per
/// key/value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub num_facts: usize,
    pub k: usize,
}

impl UnitKey {
    pub fn new(num_facts: usize, k: usize) -> Self {
        Self { num_facts, k }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}N_{}K", self.num_facts, self.k)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitArtifact {
    pub id: String,
    pub prompt_id: String,
    pub provider: String,
    pub model: String,
    pub num_facts: usize,
    pub k: usize,
    pub trials: Vec<TrialRecord>,
}

impl UnitArtifact {
    pub fn new(
        prompt_id: &str,
        provider: &str,
        model: &str,
        key: UnitKey,
        trials: Vec<TrialRecord>,
        stamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: unit_stem(model, key, stamp),
            prompt_id: prompt_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            num_facts: key.num_facts,
            k: key.k,
            trials,
        }
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.num_facts, self.k)
    }

    pub fn summary(&self) -> UnitSummary {
        UnitSummary::from_trials(self.key(), &self.trials)
    }
}

/// Model names may carry path separators (`org/model`); file names cannot.
pub fn file_safe_model(model: &str) -> String {
    model.replace(['/', '\\'], "_")
}

/// `<model>_<N>N_<K>K_<stamp>`, the artifact file stem and id.
pub fn unit_stem(model: &str, key: UnitKey, stamp: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        file_safe_model(model),
        key,
        stamp.format(STAMP_FORMAT)
    )
}

/// Inverse of [`unit_stem`] for a known model. Returns `None` for stems of
/// other models or that do not follow the pattern.
pub fn parse_unit_stem(model: &str, stem: &str) -> Option<UnitKey> {
    let rest = stem.strip_prefix(&file_safe_model(model))?.strip_prefix('_')?;
    let mut parts = rest.splitn(3, '_');
    let n = parts.next()?.strip_suffix('N')?.parse().ok()?;
    let k = parts.next()?.strip_suffix('K')?.parse().ok()?;
    parts.next()?;
    Some(UnitKey::new(n, k))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UnitSummary {
    pub key: UnitKey,
    pub trials: usize,
    pub flaw_ratio: f64,
    pub mean_sequence_accuracy: f64,
    pub mean_token_accuracy: f64,
}

impl UnitSummary {
    pub fn from_trials(key: UnitKey, trials: &[TrialRecord]) -> Self {
        let count = trials.len();
        let mean = |f: fn(&TrialRecord) -> f64| {
            if count == 0 {
                0.0
            } else {
                trials.iter().map(f).sum::<f64>() / count as f64
            }
        };
        Self {
            key,
            trials: count,
            flaw_ratio: mean(|t| if t.major_format_flaw { 1.0 } else { 0.0 }),
            mean_sequence_accuracy: mean(|t| t.sequence_accuracy),
            mean_token_accuracy: mean(|t| t.token_accuracy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).unwrap()
    }

    fn record(trial: usize, seq: f64, flaw: bool) -> TrialRecord {
        TrialRecord {
            trial,
            sequence_accuracy: seq,
            token_accuracy: seq,
            major_format_flaw: flaw,
            response_time_ms: None,
            prompt_tokens: Some(10),
            prompt_text: "p".into(),
            response_text: "r".into(),
            response_token_count: 1,
            expected_response_text: "e".into(),
            expected_token_count: 1,
        }
    }

    #[test]
    fn test_unit_stem_format() {
        let stem = unit_stem("gpt-4o_mini", UnitKey::new(3, 2), stamp());
        assert_eq!(stem, "gpt-4o_mini_3N_2K_20250309T140507");
        assert_eq!(parse_unit_stem("gpt-4o_mini", &stem), Some(UnitKey::new(3, 2)));
    }

    #[test]
    fn test_parse_rejects_foreign_stems() {
        assert_eq!(parse_unit_stem("m", "other_3N_2K_20250309T140507"), None);
        assert_eq!(parse_unit_stem("m", "m_3N_2K"), None);
        assert_eq!(parse_unit_stem("m", "m_xN_2K_1"), None);
        assert_eq!(parse_unit_stem("m", "mm_3N_2K_1"), None);
    }

    #[test]
    fn test_model_with_slash() {
        let stem = unit_stem("org/model", UnitKey::new(1, 1), stamp());
        assert!(stem.starts_with("org_model_1N_1K_"));
        assert_eq!(parse_unit_stem("org/model", &stem), Some(UnitKey::new(1, 1)));
    }

    #[test]
    fn test_artifact_json_fields() {
        let art = UnitArtifact::new("tpl_x", "openai", "m", UnitKey::new(3, 2), vec![record(0, 1.0, false)], stamp());
        let json = serde_json::to_value(&art).unwrap();
        for field in ["id", "prompt_id", "provider", "model", "num_facts", "k", "trials"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        let trial = &json["trials"][0];
        assert!(trial["response_time_ms"].is_null());
        assert_eq!(trial["major_format_flaw"], false);
        assert_eq!(json["id"], "m_3N_2K_20250309T140507");
    }

    #[test]
    fn test_summary() {
        let trials = vec![record(0, 1.0, false), record(1, 0.0, true)];
        let s = UnitSummary::from_trials(UnitKey::new(2, 2), &trials);
        assert_eq!(s.trials, 2);
        assert_eq!(s.flaw_ratio, 0.5);
        assert_eq!(s.mean_sequence_accuracy, 0.5);
        assert_eq!(UnitSummary::from_trials(UnitKey::new(1, 1), &[]).flaw_ratio, 0.0);
    }
}
