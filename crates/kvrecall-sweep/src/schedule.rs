use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use kvrecall_core::{KvError, KvResult, UnitKey};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    /// Every N crossed with every K.
    #[default]
    Explicit,
    /// From (min N, min K), multiply both by `factor` while within the maxima.
    Staircase { factor: usize },
}

/// Cross product in N-major order. Duplicates are dropped.
pub fn explicit_pairs(facts_sizes: &[usize], token_sizes: &[usize]) -> Vec<UnitKey> {
    let mut seen = BTreeSet::new();
    let mut pairs = Vec::new();
    for &n in facts_sizes {
        for &k in token_sizes {
            let key = UnitKey::new(n, k);
            if seen.insert(key) {
                pairs.push(key);
            }
        }
    }
    pairs
}

/// `(n0, k0), (n0*f, k0*f), ...` while `n <= n_max && k <= k_max`.
pub fn staircase(n0: usize, k0: usize, n_max: usize, k_max: usize, factor: usize) -> KvResult<Vec<UnitKey>> {
    if n0 == 0 || k0 == 0 {
        return Err(KvError::Config(format!(
            "staircase must start from positive sizes, got ({n0}, {k0})"
        )));
    }
    if factor < 2 {
        return Err(KvError::Config(format!("staircase factor must be >= 2, got {factor}")));
    }
    let mut steps = Vec::new();
    let (mut n, mut k) = (n0, k0);
    while n <= n_max && k <= k_max {
        steps.push(UnitKey::new(n, k));
        match (n.checked_mul(factor), k.checked_mul(factor)) {
            (Some(next_n), Some(next_k)) => (n, k) = (next_n, next_k),
            _ => break,
        }
    }
    Ok(steps)
}

/// Units to execute: the requested grid minus `completed`, in grid order.
pub fn plan(
    mode: GridMode,
    facts_sizes: &[usize],
    token_sizes: &[usize],
    completed: &BTreeSet<UnitKey>,
) -> KvResult<Vec<UnitKey>> {
    let requested = requested_units(mode, facts_sizes, token_sizes)?;
    Ok(requested.into_iter().filter(|k| !completed.contains(k)).collect())
}

pub fn requested_units(mode: GridMode, facts_sizes: &[usize], token_sizes: &[usize]) -> KvResult<Vec<UnitKey>> {
    if facts_sizes.is_empty() || token_sizes.is_empty() {
        return Err(KvError::Config("facts and token sizes must not be empty".into()));
    }
    if facts_sizes.contains(&0) || token_sizes.contains(&0) {
        return Err(KvError::Config("facts and token sizes must be positive".into()));
    }
    match mode {
        GridMode::Explicit => Ok(explicit_pairs(facts_sizes, token_sizes)),
        GridMode::Staircase { factor } => {
            let (n0, n_max) = min_max(facts_sizes);
            let (k0, k_max) = min_max(token_sizes);
            staircase(n0, k0, n_max, k_max, factor)
        }
    }
}

fn min_max(values: &[usize]) -> (usize, usize) {
    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    (min, max)
}
