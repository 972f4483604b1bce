use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KvError, KvResult};
use crate::vocabulary::Vocabulary;

/// Tries allowed per sequence before the space counts as exhausted.
pub const MAX_SEQUENCE_ATTEMPTS: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
}

impl Fact {
    pub fn line(&self) -> String {
        format!("{} => {}", self.key, self.value)
    }
}

#[derive(Debug, Clone)]
pub struct FactSet {
    pub facts: Vec<Fact>,
    pub key_values: HashMap<String, String>,
}

/// Draw `n` facts whose keys and values are `k`-token sequences. Every key
/// and every value string is unique across the whole set.
///
/// `SequenceExhausted` means the vocabulary is too small for `n * k`.
pub fn generate_facts<R: Rng + ?Sized>(
    n: usize,
    k: usize,
    vocab: &Vocabulary,
    separator: &str,
    rng: &mut R,
) -> KvResult<FactSet> {
    if n == 0 || k == 0 {
        return Err(KvError::Config(format!(
            "facts and tokens per fact must be positive (N={n}, K={k})"
        )));
    }
    let needed = n.saturating_mul(k).saturating_mul(2);
    if vocab.len() < needed {
        debug!(
            vocab = vocab.len(),
            needed,
            "vocabulary smaller than 2*N*K, sequences may repeat tokens"
        );
    }

    let pool = vocab.tokens();
    let cap = n.min(pool.len());
    let mut used: HashSet<String> = HashSet::with_capacity(cap.saturating_mul(2));
    let mut facts = Vec::with_capacity(cap);
    let mut key_values = HashMap::with_capacity(cap);

    for _ in 0..n {
        let key = unique_sequence(k, pool, separator, &mut used, rng)?;
        let value = unique_sequence(k, pool, separator, &mut used, rng)?;
        key_values.insert(key.clone(), value.clone());
        facts.push(Fact { key, value });
    }

    Ok(FactSet { facts, key_values })
}

fn unique_sequence<R: Rng + ?Sized>(
    k: usize,
    pool: &[String],
    separator: &str,
    used: &mut HashSet<String>,
    rng: &mut R,
) -> KvResult<String> {
    if k > pool.len() {
        return Err(KvError::SequenceExhausted { k, attempts: 0 });
    }
    for _ in 0..MAX_SEQUENCE_ATTEMPTS {
        let chosen: Vec<&str> = pool.choose_multiple(rng, k).map(String::as_str).collect();
        let seq = chosen.join(separator);
        if !used.contains(&seq) {
            used.insert(seq.clone());
            return Ok(seq);
        }
    }
    Err(KvError::SequenceExhausted {
        k,
        attempts: MAX_SEQUENCE_ATTEMPTS,
    })
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One trial's problem: the facts plus the order keys are asked in.
#[derive(Debug, Clone)]
pub struct Instance {
    pub num_facts: usize,
    pub k: usize,
    pub facts: Vec<Fact>,
    pub key_values: HashMap<String, String>,
    pub query_order: Vec<String>,
}

impl Instance {
    pub fn fact_lines(&self) -> Vec<String> {
        self.facts.iter().map(Fact::line).collect()
    }

    /// Values in query order, i.e. the perfect answer line by line.
    pub fn expected_lines(&self) -> Vec<&str> {
        self.query_order
            .iter()
            .filter_map(|key| self.key_values.get(key).map(String::as_str))
            .collect()
    }

    pub fn expected_text(&self) -> String {
        self.expected_lines().join("\n")
    }
}

/// Seeded source of instances over one shared vocabulary.
pub struct InstanceGenerator {
    vocab: Arc<Vocabulary>,
    separator: String,
    rng: StdRng,
}

impl InstanceGenerator {
    /// A fixed `seed` reproduces the same sequence of instances.
    pub fn new(vocab: Arc<Vocabulary>, separator: impl Into<String>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            vocab,
            separator: separator.into(),
            rng,
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn generate(&mut self, n: usize, k: usize) -> KvResult<Instance> {
        let set = generate_facts(n, k, &self.vocab, &self.separator, &mut self.rng)?;
        let mut query_order: Vec<String> = set.facts.iter().map(|f| f.key.clone()).collect();
        query_order.shuffle(&mut self.rng);
        Ok(Instance {
            num_facts: n,
            k,
            facts: set.facts,
            key_values: set.key_values,
            query_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vocab(size: usize) -> Vocabulary {
        Vocabulary::new("t", (0..size).map(|i| format!("tok{i:04}")))
    }

    fn all_unique(set: &FactSet) -> bool {
        let mut seen = HashSet::new();
        set.facts
            .iter()
            .all(|f| seen.insert(f.key.clone()) && seen.insert(f.value.clone()))
    }

    #[test]
    fn test_huge_sizes_report_exhaustion() {
        let mut rng = StdRng::seed_from_u64(7);
        let err = generate_facts(usize::MAX, usize::MAX, &vocab(20), "|", &mut rng).unwrap_err();
        assert!(matches!(err, KvError::SequenceExhausted { attempts: 0, .. }));
    }

    #[test]
    fn test_fact_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let set = generate_facts(3, 2, &vocab(20), "|", &mut rng).unwrap();
        assert_eq!(set.facts.len(), 3);
        for fact in &set.facts {
            assert_eq!(fact.key.split('|').count(), 2);
            assert_eq!(fact.value.split('|').count(), 2);
            assert_eq!(set.key_values[&fact.key], fact.value);
            assert_eq!(fact.line(), format!("{} => {}", fact.key, fact.value));
        }
        assert!(all_unique(&set));
    }

    #[test]
    fn test_seed_reproduces_instance() {
        let v = Arc::new(vocab(50));
        let a = InstanceGenerator::new(v.clone(), "|", Some(11)).generate(5, 3).unwrap();
        let b = InstanceGenerator::new(v.clone(), "|", Some(11)).generate(5, 3).unwrap();
        let c = InstanceGenerator::new(v, "|", Some(12)).generate(5, 3).unwrap();
        assert_eq!(a.facts, b.facts);
        assert_eq!(a.query_order, b.query_order);
        assert_ne!(a.facts, c.facts);
    }

    #[test]
    fn test_query_order_is_permutation() {
        let mut generator = InstanceGenerator::new(Arc::new(vocab(40)), "|", Some(3));
        let inst = generator.generate(6, 2).unwrap();
        let mut keys: Vec<_> = inst.facts.iter().map(|f| f.key.clone()).collect();
        let mut order = inst.query_order.clone();
        keys.sort();
        order.sort();
        assert_eq!(keys, order);
        assert_eq!(inst.expected_lines().len(), 6);
        assert_eq!(inst.expected_text().lines().count(), 6);
    }

    #[test]
    fn test_exhaustion_is_capacity_error() {
        // Two tokens give exactly two ordered 1-token sequences.
        let mut rng = StdRng::seed_from_u64(1);
        let err = generate_facts(2, 1, &vocab(2), "|", &mut rng).unwrap_err();
        assert!(matches!(err, KvError::SequenceExhausted { k: 1, .. }));
        assert!(err.is_capacity());
    }

    #[test]
    fn test_k_larger_than_vocab() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = generate_facts(1, 5, &vocab(3), "|", &mut rng).unwrap_err();
        assert!(matches!(err, KvError::SequenceExhausted { k: 5, attempts: 0 }));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            generate_facts(0, 2, &vocab(10), "|", &mut rng),
            Err(KvError::Config(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_facts_unique_when_vocab_large(n in 1usize..12, k in 1usize..4, seed in any::<u64>()) {
            let v = vocab(2 * n * k + 8);
            let mut rng = StdRng::seed_from_u64(seed);
            let set = generate_facts(n, k, &v, "|", &mut rng).unwrap();
            prop_assert_eq!(set.facts.len(), n);
            prop_assert!(all_unique(&set));
        }
    }
}
