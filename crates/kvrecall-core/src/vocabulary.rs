//! Single-token vocabularies.
//!
//! A [`Vocabulary`] holds strings that each encode to exactly one token under
//! one tokenizer. [`trim`] narrows it further so tokens also stay single when
//! wrapped in separators and when several are joined into a sequence:
//!
//! | Rule      | Test string          | Expected token count        |
//! |-----------|----------------------|-----------------------------|
//! | alone     | `t`                  | `1`                         |
//! | surround  | `sep t sep`          | `1 + 2*len(sep)`            |
//! | sequence  | `sep t1 sep .. tL sep` | `L + (L+1)*len(sep)`      |
//!
//! The sequence rule is checked over every combination of size `2..=L`, so
//! its cost grows combinatorially; `L` is capped at [`MAX_SEQUENCE_LENGTH`].

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{KvError, KvResult};
use crate::tokenizer::{is_single_token, Tokenizer};

pub const DEFAULT_SEPARATOR: &str = "|";
pub const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";
pub const MAX_SEQUENCE_LENGTH: usize = 4;
/// Upper bound on combinations examined by one mismatch pass.
pub const MAX_TRIM_COMBINATIONS: u128 = 50_000_000;

const TOP_UP_SEED: u64 = 42;
const TOP_UP_EXTRA_LEN: usize = 3;
const MIN_TOP_UP_ATTEMPTS: usize = 100_000;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    tokenizer: String,
    tokens: Vec<String>,
}

impl Vocabulary {
    /// Tokens are sorted and deduplicated.
    pub fn new<I, S>(tokenizer: impl Into<String>, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = tokens.into_iter().map(Into::into).collect();
        Self {
            tokenizer: tokenizer.into(),
            tokens: set.into_iter().collect(),
        }
    }

    /// Parse a vocabulary file: a JSON array of strings.
    pub fn from_json(tokenizer: impl Into<String>, json: &str) -> KvResult<Self> {
        let tokens: Vec<String> = serde_json::from_str(json)?;
        Ok(Self::new(tokenizer, tokens))
    }

    pub fn to_json(&self) -> KvResult<String> {
        Ok(serde_json::to_string(&self.tokens)?)
    }

    pub fn tokenizer(&self) -> &str {
        &self.tokenizer
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.binary_search_by(|t| t.as_str().cmp(token)).is_ok()
    }

    /// Fail with `ValidationFailed` when fewer than `requested` tokens remain.
    pub fn ensure_size(&self, requested: usize) -> KvResult<()> {
        if self.len() < requested {
            return Err(KvError::ValidationFailed {
                requested,
                kept: self.len(),
            });
        }
        Ok(())
    }
}

/// Keep only the pool strings that are a single token on their own.
pub fn build<I, S>(pool: I, tokenizer: &dyn Tokenizer) -> KvResult<Vocabulary>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut kept = Vec::new();
    let mut rejected = 0usize;
    for candidate in pool {
        let candidate = candidate.as_ref();
        if is_single_token(tokenizer, candidate)? {
            kept.push(candidate.to_string());
        } else {
            rejected += 1;
        }
    }
    let vocab = Vocabulary::new(tokenizer.name(), kept);
    info!(
        tokenizer = tokenizer.name(),
        kept = vocab.len(),
        rejected,
        "built single-token vocabulary"
    );
    Ok(vocab)
}

/// Re-check a stored vocabulary against `tokenizer`. One entry that is no
/// longer a single token fails the whole set with `ValidationFailed`.
pub fn verify(vocab: &Vocabulary, tokenizer: &dyn Tokenizer) -> KvResult<()> {
    let rebuilt = build(vocab.tokens(), tokenizer)?;
    if rebuilt.len() != vocab.len() {
        warn!(
            tokenizer = tokenizer.name(),
            entries = vocab.len(),
            single = rebuilt.len(),
            "vocabulary has multi-token entries"
        );
        return Err(KvError::ValidationFailed {
            requested: vocab.len(),
            kept: rebuilt.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Trimming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrimOptions {
    pub separator: String,
    /// Drop tokens that merge with a separator on either side.
    pub require_surround_single: bool,
    /// Longest joined sequence checked by the sequence rule.
    pub max_sequence_length: usize,
    /// Fail with `ValidationFailed` if fewer tokens survive. 0 disables.
    pub min_tokens: usize,
}

impl Default for TrimOptions {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.into(),
            require_surround_single: true,
            max_sequence_length: 2,
            min_tokens: 0,
        }
    }
}

/// Narrow `vocab` to tokens that survive the surround and sequence rules.
///
/// The sequence rule removes the heaviest offenders first (tokens whose
/// violation count exceeds the minimum count), recomputes once, then purges
/// every token still involved in a violation. The result is safe but not
/// necessarily the largest safe subset.
pub fn trim(vocab: &Vocabulary, tokenizer: &dyn Tokenizer, opts: &TrimOptions) -> KvResult<Vocabulary> {
    validate_trim(vocab, tokenizer, opts)?;

    let sep = opts.separator.as_str();
    let sep_len = tokenizer.count_tokens(sep)?;
    let mut tokens: Vec<String> = vocab.tokens().to_vec();

    if opts.require_surround_single {
        let before = tokens.len();
        let expected = 1 + 2 * sep_len;
        let mut kept = Vec::with_capacity(tokens.len());
        for t in tokens {
            if tokenizer.count_tokens(&format!("{sep}{t}{sep}"))? == expected {
                kept.push(t);
            }
        }
        tokens = kept;
        debug!(before, after = tokens.len(), "surround rule applied");
    }

    if opts.max_sequence_length > 1 {
        let stats = mismatch_stats(&tokens, tokenizer, sep, sep_len, opts.max_sequence_length)?;
        if let Some(&floor) = stats.values().min() {
            let heavy: BTreeSet<usize> = stats
                .iter()
                .filter(|(_, count)| **count > floor)
                .map(|(idx, _)| *idx)
                .collect();
            tokens = retain_indices(tokens, |idx| !heavy.contains(&idx));
            debug!(removed = heavy.len(), "heaviest sequence offenders removed");

            let stats = mismatch_stats(&tokens, tokenizer, sep, sep_len, opts.max_sequence_length)?;
            tokens = retain_indices(tokens, |idx| !stats.contains_key(&idx));
            debug!(removed = stats.len(), "remaining sequence offenders purged");
        }
    }

    let trimmed = Vocabulary::new(vocab.tokenizer(), tokens);
    info!(
        before = vocab.len(),
        after = trimmed.len(),
        separator = sep,
        "trimmed vocabulary"
    );
    if opts.min_tokens > 0 {
        trimmed.ensure_size(opts.min_tokens)?;
    }
    Ok(trimmed)
}

fn validate_trim(vocab: &Vocabulary, tokenizer: &dyn Tokenizer, opts: &TrimOptions) -> KvResult<()> {
    if opts.separator.is_empty() {
        return Err(KvError::Config("separator must not be empty".into()));
    }
    if opts.max_sequence_length > MAX_SEQUENCE_LENGTH {
        return Err(KvError::Config(format!(
            "max sequence length {} exceeds the limit of {MAX_SEQUENCE_LENGTH}",
            opts.max_sequence_length
        )));
    }
    if vocab.tokenizer() != tokenizer.name() {
        return Err(KvError::Config(format!(
            "vocabulary was built for tokenizer {}, not {}",
            vocab.tokenizer(),
            tokenizer.name()
        )));
    }
    let total: u128 = (2..=opts.max_sequence_length)
        .map(|l| binomial(vocab.len(), l))
        .fold(0u128, u128::saturating_add);
    if total > MAX_TRIM_COMBINATIONS {
        return Err(KvError::Config(format!(
            "{total} combinations for {} tokens up to length {} is intractable (limit {MAX_TRIM_COMBINATIONS})",
            vocab.len(),
            opts.max_sequence_length
        )));
    }
    Ok(())
}

fn retain_indices(tokens: Vec<String>, keep: impl Fn(usize) -> bool) -> Vec<String> {
    tokens
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| keep(*idx))
        .map(|(_, t)| t)
        .collect()
}

/// Violation count per token index, over every combination of size
/// `2..=max_len`. Tokens with no violation are absent.
fn mismatch_stats(
    tokens: &[String],
    tokenizer: &dyn Tokenizer,
    sep: &str,
    sep_len: usize,
    max_len: usize,
) -> KvResult<HashMap<usize, usize>> {
    let mut stats: HashMap<usize, usize> = HashMap::new();
    for len in 2..=max_len {
        let expected = len + (len + 1) * sep_len;
        for combo in Combinations::new(tokens.len(), len) {
            let joined: Vec<&str> = combo.iter().map(|&i| tokens[i].as_str()).collect();
            let test = format!("{sep}{}{sep}", joined.join(sep));
            if tokenizer.count_tokens(&test)? != expected {
                for &i in &combo {
                    *stats.entry(i).or_insert(0) += 1;
                }
            }
        }
    }
    Ok(stats)
}

/// Lexicographic `k`-combinations of `0..n`.
struct Combinations {
    n: usize,
    indices: Vec<usize>,
    started: bool,
    done: bool,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            indices: (0..k).collect(),
            started: false,
            done: k > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.indices.clone());
        }
        let k = self.indices.len();
        let mut i = k;
        loop {
            if i == 0 {
                self.done = true;
                return None;
            }
            i -= 1;
            if self.indices[i] != i + self.n - k {
                break;
            }
        }
        self.indices[i] += 1;
        for j in i + 1..k {
            self.indices[j] = self.indices[j - 1] + 1;
        }
        Some(self.indices.clone())
    }
}

fn binomial(n: usize, k: usize) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u128 = 1;
    for i in 0..k {
        acc = acc.saturating_mul((n - i) as u128) / (i as u128 + 1);
    }
    acc
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Shape of generated candidate strings.
#[derive(Debug, Clone)]
pub struct AlphaSpec {
    pub alphabet: String,
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for AlphaSpec {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.into(),
            min_len: 2,
            max_len: 10,
        }
    }
}

impl AlphaSpec {
    fn validate(&self) -> KvResult<Vec<char>> {
        let alphabet: Vec<char> = self.alphabet.chars().collect::<BTreeSet<_>>().into_iter().collect();
        if alphabet.is_empty() {
            return Err(KvError::Config("alphabet must not be empty".into()));
        }
        if self.min_len == 0 || self.min_len > self.max_len {
            return Err(KvError::Config(format!(
                "invalid length range {}..={}",
                self.min_len, self.max_len
            )));
        }
        Ok(alphabet)
    }
}

/// Find `count` alphabet-only strings that are each a single token.
///
/// Sweeps every string of length `min_len`, then `min_len + 1`, and so on.
/// If the sweep ends short of `count`, samples random strings with a fixed
/// seed, giving up with `VocabularyExhausted` after a bounded number of tries.
pub fn generate_alpha_tokens(
    count: usize,
    tokenizer: &dyn Tokenizer,
    spec: &AlphaSpec,
) -> KvResult<BTreeSet<String>> {
    let alphabet = spec.validate()?;
    let mut found = BTreeSet::new();
    if count == 0 {
        return Ok(found);
    }

    for len in spec.min_len..=spec.max_len {
        let mut odometer = vec![0usize; len];
        loop {
            let candidate: String = odometer.iter().map(|&i| alphabet[i]).collect();
            if is_single_token(tokenizer, &candidate)? {
                found.insert(candidate);
                if found.len() >= count {
                    info!(count, len, "alpha sweep reached target");
                    return Ok(found);
                }
            }
            if !advance(&mut odometer, alphabet.len()) {
                break;
            }
        }
    }

    debug!(found = found.len(), count, "sweep exhausted, sampling randomly");
    let mut rng = StdRng::seed_from_u64(TOP_UP_SEED);
    let attempts = count.saturating_mul(1000).max(MIN_TOP_UP_ATTEMPTS);
    for _ in 0..attempts {
        let len = rng.gen_range(spec.min_len..=spec.max_len + TOP_UP_EXTRA_LEN);
        let candidate: String = (0..len)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect();
        if is_single_token(tokenizer, &candidate)? {
            found.insert(candidate);
            if found.len() >= count {
                return Ok(found);
            }
        }
    }

    Err(KvError::VocabularyExhausted {
        requested: count,
        found: found.len(),
    })
}

/// Increment a base-`radix` odometer. Returns false after the last value.
fn advance(odometer: &mut [usize], radix: usize) -> bool {
    for digit in odometer.iter_mut().rev() {
        *digit += 1;
        if *digit < radix {
            return true;
        }
        *digit = 0;
    }
    false
}

/// Pull `count` candidates straight from the tokenizer's own piece table.
///
/// Word-boundary markers (`▁` for SentencePiece, `Ġ` for byte-level BPE) are
/// stripped before checking the core against `spec`.
pub fn alpha_tokens_from_vocab(
    count: usize,
    tokenizer: &dyn Tokenizer,
    spec: &AlphaSpec,
) -> KvResult<BTreeSet<String>> {
    let alphabet: BTreeSet<char> = spec.validate()?.into_iter().collect();
    let mut pieces = tokenizer.vocab_pieces();
    pieces.sort();

    let mut found = BTreeSet::new();
    for piece in &pieces {
        let core = piece.trim_start_matches(['\u{2581}', '\u{0120}']);
        let len = core.chars().count();
        if len < spec.min_len || len > spec.max_len {
            continue;
        }
        if !core.chars().all(|c| alphabet.contains(&c)) {
            continue;
        }
        if found.contains(core) || !is_single_token(tokenizer, core)? {
            continue;
        }
        found.insert(core.to_string());
        if found.len() >= count {
            return Ok(found);
        }
    }

    Err(KvError::VocabularyExhausted {
        requested: count,
        found: found.len(),
    })
}
