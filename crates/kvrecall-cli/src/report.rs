//! Text rendering for `report` and `inspect`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use kvrecall_core::diff::{diff_response, render_diff};
use kvrecall_core::{TrialRecord, UnitArtifact, UnitKey, UnitSummary};

/// One summary per (N, K). Artifacts sharing a key are pooled.
pub fn summarize(units: &[UnitArtifact]) -> Vec<UnitSummary> {
    let mut pooled: BTreeMap<UnitKey, Vec<TrialRecord>> = BTreeMap::new();
    for unit in units {
        pooled
            .entry(unit.key())
            .or_default()
            .extend(unit.trials.iter().cloned());
    }
    pooled
        .into_iter()
        .map(|(key, trials)| UnitSummary::from_trials(key, &trials))
        .collect()
}

/// N rows by K columns of mean sequence accuracy. Cells with any flawed
/// trial are marked `*`; missing cells show `-`.
pub fn render_grid(summaries: &[UnitSummary]) -> String {
    let ns: BTreeSet<usize> = summaries.iter().map(|s| s.key.num_facts).collect();
    let ks: BTreeSet<usize> = summaries.iter().map(|s| s.key.k).collect();
    let cells: BTreeMap<UnitKey, &UnitSummary> = summaries.iter().map(|s| (s.key, s)).collect();

    let mut out = String::new();
    let _ = write!(out, "{:>6}", "N\\K");
    for k in &ks {
        let _ = write!(out, " {k:>7}");
    }
    out.push('\n');
    for n in &ns {
        let _ = write!(out, "{n:>6}");
        for k in &ks {
            match cells.get(&UnitKey::new(*n, *k)) {
                Some(s) => {
                    let mark = if s.flaw_ratio > 0.0 { "*" } else { " " };
                    let _ = write!(out, " {:>6.2}{mark}", s.mean_sequence_accuracy);
                }
                None => {
                    let _ = write!(out, " {:>6} ", "-");
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Per-line token diff of one trial, one rendered line per expected line.
pub fn render_trial(trial: &TrialRecord, separator: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "trial {}  seq={:.2}  tok={:.2}  flaw={}  tokens={}/{}",
        trial.trial,
        trial.sequence_accuracy,
        trial.token_accuracy,
        trial.major_format_flaw,
        trial.response_token_count,
        trial.expected_token_count,
    );
    let lines = diff_response(&trial.expected_response_text, &trial.response_text, separator);
    for (i, diffs) in lines.iter().enumerate() {
        let marker = if diffs.iter().all(|d| d.is_match()) { ' ' } else { '!' };
        let _ = writeln!(out, "  {marker} {:>3}  {}", i + 1, render_diff(diffs, separator));
    }
    out
}
