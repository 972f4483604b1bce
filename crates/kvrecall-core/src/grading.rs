//! Grading of raw model output against the expected values.
//!
//! Everything here is a pure function of its inputs. A format flaw zeroes
//! both accuracies without scoring the lines.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::KvResult;
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatFlaw {
    /// A response line repeats an earlier one verbatim.
    RepeatedLine,
    /// Response is materially shorter than expected in tokens.
    Truncated,
    /// First or last character is not part of a token.
    GarbledBoundary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    pub sequence_accuracy: f64,
    pub token_accuracy: f64,
    pub format_flaw: Option<FormatFlaw>,
    pub expected_token_count: usize,
    pub response_token_count: usize,
}

impl Grade {
    pub fn is_flawed(&self) -> bool {
        self.format_flaw.is_some()
    }
}

/// Trim every line, drop blank ones, rejoin with `\n`.
pub fn normalize_response(raw: &str) -> String {
    response_lines(raw).join("\n")
}

fn response_lines(raw: &str) -> Vec<&str> {
    raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect()
}

/// Grade `raw` against the values of `ordered_keys`, in that order.
///
/// Token counts are taken per line with `tokenizer` and summed. Keys absent
/// from `key_values` are skipped.
pub fn grade(
    raw: &str,
    ordered_keys: &[String],
    key_values: &HashMap<String, String>,
    tokenizer: &dyn Tokenizer,
    separator: &str,
) -> KvResult<Grade> {
    let expected: Vec<&str> = ordered_keys
        .iter()
        .filter_map(|k| key_values.get(k).map(String::as_str))
        .collect();
    let response = response_lines(raw);

    let expected_token_count = count_lines(&expected, tokenizer)?;
    let response_token_count = count_lines(&response, tokenizer)?;

    let format_flaw = detect_flaw(
        raw,
        &response,
        expected_token_count,
        response_token_count,
        separator,
    );
    let (sequence_accuracy, token_accuracy) = match format_flaw {
        Some(_) => (0.0, 0.0),
        None => score_lines(&response, &expected, separator),
    };

    Ok(Grade {
        sequence_accuracy,
        token_accuracy,
        format_flaw,
        expected_token_count,
        response_token_count,
    })
}

fn count_lines(lines: &[&str], tokenizer: &dyn Tokenizer) -> KvResult<usize> {
    let mut total = 0;
    for line in lines {
        total += tokenizer.count_tokens(line)?;
    }
    Ok(total)
}

fn detect_flaw(
    raw: &str,
    response: &[&str],
    expected_tokens: usize,
    response_tokens: usize,
    separator: &str,
) -> Option<FormatFlaw> {
    let mut seen = HashSet::with_capacity(response.len());
    if response.iter().any(|line| !seen.insert(*line)) {
        return Some(FormatFlaw::RepeatedLine);
    }

    let shortfall = expected_tokens as f64 - response_tokens as f64;
    if shortfall > f64::max(3.0, expected_tokens as f64 * 0.25) {
        return Some(FormatFlaw::Truncated);
    }

    let first_ok = raw.chars().next().is_some_and(char::is_alphabetic);
    let last_ok = raw.chars().next_back().is_some_and(char::is_alphabetic)
        || (!separator.is_empty() && raw.ends_with(separator));
    if !first_ok || !last_ok {
        return Some(FormatFlaw::GarbledBoundary);
    }
    None
}

/// Positional comparison of response lines against expected lines.
///
/// Returns `(sequence_accuracy, token_accuracy)`. Only the first
/// `min(response, expected)` lines are compared, and within a line only the
/// first `min` tokens; both ratios are 0 on an empty denominator.
pub fn score_lines(response: &[&str], expected: &[&str], separator: &str) -> (f64, f64) {
    let compared = response.len().min(expected.len());
    let mut matched_lines = 0usize;
    let mut matched_tokens = 0usize;
    let mut token_total = 0usize;

    for (resp, exp) in response.iter().zip(expected.iter()) {
        let resp_tokens: Vec<&str> = resp.trim().split(separator).collect();
        let exp_tokens: Vec<&str> = exp.trim().split(separator).collect();
        if resp_tokens == exp_tokens {
            matched_lines += 1;
        }
        matched_tokens += resp_tokens
            .iter()
            .zip(exp_tokens.iter())
            .filter(|(r, e)| r == e)
            .count();
        token_total += resp_tokens.len().min(exp_tokens.len());
    }

    (ratio(matched_lines, compared), ratio(matched_tokens, token_total))
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
