//! The generate/render and grade/record halves of one trial, shared by the
//! synchronous loop and batch reconciliation so both paths produce
//! identical records.

use kvrecall_core::grading::{grade, normalize_response};
use kvrecall_core::template::render_instance;
use kvrecall_core::{
    Instance, InstanceGenerator, KvResult, PromptRenderer, Provider, RenderedPrompt, Tokenizer,
    TrialRecord, UnitKey,
};

/// Completion cap for one query: `N*K*multiplier + 100`, bounded by the
/// provider's own limit.
pub fn max_token_cap(key: UnitKey, multiplier: usize, provider_max: u32) -> u32 {
    let wanted = key
        .num_facts
        .saturating_mul(key.k)
        .saturating_mul(multiplier)
        .saturating_add(100);
    u32::try_from(wanted).unwrap_or(u32::MAX).min(provider_max)
}

/// A generated, rendered trial waiting for its answer.
#[derive(Debug, Clone)]
pub struct PreparedTrial {
    pub key: UnitKey,
    pub trial: usize,
    pub instance: Instance,
    pub prompt: RenderedPrompt,
    pub max_tokens: u32,
    pub prompt_tokens: Option<usize>,
}

pub fn prepare_trial(
    generator: &mut InstanceGenerator,
    renderer: &dyn PromptRenderer,
    provider: &dyn Provider,
    key: UnitKey,
    trial: usize,
    multiplier: usize,
) -> KvResult<PreparedTrial> {
    let instance = generator.generate(key.num_facts, key.k)?;
    let prompt = render_instance(renderer, &instance)?;
    let prompt_tokens = provider.count_tokens(&prompt.text).ok();
    Ok(PreparedTrial {
        key,
        trial,
        instance,
        prompt,
        max_tokens: max_token_cap(key, multiplier, provider.max_tokens()),
        prompt_tokens,
    })
}

/// Normalize and grade `raw`, then build the persisted record.
pub fn complete_trial(
    prepared: &PreparedTrial,
    raw: &str,
    response_time_ms: Option<f64>,
    tokenizer: &dyn Tokenizer,
    separator: &str,
) -> KvResult<TrialRecord> {
    let answer = normalize_response(raw);
    let graded = grade(
        &answer,
        &prepared.prompt.keys,
        &prepared.instance.key_values,
        tokenizer,
        separator,
    )?;
    Ok(TrialRecord::from_grade(
        prepared.trial,
        &graded,
        prepared.prompt.text.clone(),
        answer,
        prepared.instance.expected_text(),
    )
    .with_timing(response_time_ms)
    .with_prompt_tokens(prepared.prompt_tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvrecall_core::testing::{oracle_answer, PieceTokenizer, ScriptedProvider};
    use kvrecall_core::{JinjaTemplate, Vocabulary};
    use std::sync::Arc;

    #[test]
    fn test_max_token_cap() {
        assert_eq!(max_token_cap(UnitKey::new(3, 2), 2, 4096), 112);
        assert_eq!(max_token_cap(UnitKey::new(1000, 10), 2, 4096), 4096);
    }

    #[test]
    fn test_prepare_then_complete_with_oracle() {
        let tokens: Vec<String> = ["aa", "bb", "cc", "dd", "ee", "ff", "gg", "hh"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut pieces = tokens.clone();
        pieces.push("|".into());
        let provider = ScriptedProvider::oracle(PieceTokenizer::new(pieces));
        let vocab = Arc::new(Vocabulary::new("piece-tokenizer", tokens));
        let mut generator = InstanceGenerator::new(vocab, "|", Some(9));
        let renderer = JinjaTemplate::builtin("|").unwrap();

        let prepared = prepare_trial(&mut generator, &renderer, &provider, UnitKey::new(2, 2), 0, 2).unwrap();
        assert_eq!(prepared.max_tokens, 108);
        assert!(prepared.prompt_tokens.is_some());

        let raw = format!("  {}\n\n", oracle_answer(&prepared.prompt.text));
        let record = complete_trial(&prepared, &raw, Some(3.0), provider.tokenizer(), "|").unwrap();
        assert_eq!(record.sequence_accuracy, 1.0);
        assert!(!record.major_format_flaw);
        assert_eq!(record.response_text, record.expected_response_text);
        assert_eq!(record.response_time_ms, Some(3.0));
    }
}
