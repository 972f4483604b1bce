//! Configuration loading from TOML files.
//!
//! Lookup order:
//! 1. `$KVRECALL_CONFIG` environment variable
//! 2. `~/.config/kvrecall/config.toml`
//! 3. Built-in defaults (everything is optional)

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kvrecall_core::vocabulary::{DEFAULT_ALPHABET, DEFAULT_SEPARATOR};
use kvrecall_core::{AlphaSpec, ProviderSettings, TrimOptions};
use kvrecall_sweep::{BatchOptions, GridMode, SweepOptions};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub sweep: SweepConfig,
    pub batch: BatchConfig,
    pub vocabulary: VocabularyConfig,
    pub template: TemplateConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Where unit artifacts are written.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Results root. Default: platform-specific data dir.
    pub root: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub facts_sizes: Vec<usize>,
    pub token_sizes: Vec<usize>,
    pub trials: usize,
    /// Walk a staircase from the smallest sizes instead of the full grid.
    pub adaptive: bool,
    pub staircase_factor: usize,
    pub early_abort: bool,
    /// Per-query timeout for synchronous calls.
    pub timeout_secs: u64,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub max_token_multiplier: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub batch_size: usize,
    /// Payload ceiling in MB.
    pub max_payload_mb: usize,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
    pub separator: String,
    pub require_surround_single: bool,
    pub max_sequence_length: usize,
    /// Fewest tokens a run may start with. Default: the largest K swept.
    pub min_tokens: Option<usize>,
    /// Candidates generated when no vocabulary file is configured.
    pub size: usize,
    pub alphabet: String,
    pub min_len: usize,
    pub max_len: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Jinja template file. Default: built-in template.
    pub path: Option<String>,
    /// Fixed prompt id. Default: derived from the template text.
    pub prompt_id: Option<String>,
}

/// `[providers.<id>]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub settings: ProviderSettings,
    /// Pre-trimmed vocabulary JSON for this provider's tokenizer.
    pub vocabulary: Option<String>,
}

// --- Defaults ---

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            facts_sizes: vec![3, 6],
            token_sizes: vec![2, 3],
            trials: 1,
            adaptive: false,
            staircase_factor: 2,
            early_abort: false,
            timeout_secs: 60,
            temperature: 0.0,
            seed: None,
            max_token_multiplier: 2,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 20,
            max_payload_mb: 100,
            poll_interval_secs: 10,
            timeout_secs: 3600,
        }
    }
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.into(),
            require_surround_single: true,
            max_sequence_length: 2,
            min_tokens: None,
            size: 500,
            alphabet: DEFAULT_ALPHABET.into(),
            min_len: 2,
            max_len: 10,
        }
    }
}

// --- Conversions into library options ---

impl Config {
    pub fn sweep_options(&self) -> SweepOptions {
        let s = &self.sweep;
        SweepOptions {
            facts_sizes: s.facts_sizes.clone(),
            token_sizes: s.token_sizes.clone(),
            trials: s.trials,
            mode: if s.adaptive {
                GridMode::Staircase {
                    factor: s.staircase_factor,
                }
            } else {
                GridMode::Explicit
            },
            early_abort: s.early_abort,
            timeout: (s.timeout_secs > 0).then(|| Duration::from_secs(s.timeout_secs)),
            temperature: s.temperature,
            seed: s.seed,
            max_token_multiplier: s.max_token_multiplier,
            separator: self.vocabulary.separator.clone(),
            batch: self.batch.enabled.then(|| self.batch.options()),
        }
    }

    pub fn trim_options(&self) -> TrimOptions {
        TrimOptions {
            separator: self.vocabulary.separator.clone(),
            require_surround_single: self.vocabulary.require_surround_single,
            max_sequence_length: self.vocabulary.max_sequence_length,
            min_tokens: self.min_vocabulary(),
        }
    }

    /// A sweep cannot draw a K-token sequence from fewer than K tokens.
    pub fn min_vocabulary(&self) -> usize {
        self.vocabulary
            .min_tokens
            .unwrap_or_else(|| self.sweep.token_sizes.iter().copied().max().unwrap_or(0))
    }

    pub fn alpha_spec(&self) -> AlphaSpec {
        AlphaSpec {
            alphabet: self.vocabulary.alphabet.clone(),
            min_len: self.vocabulary.min_len,
            max_len: self.vocabulary.max_len,
        }
    }

    /// Settings for `id`, empty when the provider has no table.
    pub fn provider(&self, id: &str) -> ProviderConfig {
        self.providers
            .get(id)
            .map(|p| ProviderConfig {
                settings: p.settings.clone(),
                vocabulary: p.vocabulary.clone(),
            })
            .unwrap_or_default()
    }
}

impl BatchConfig {
    pub fn options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size,
            max_payload_bytes: self.max_payload_mb.saturating_mul(1024 * 1024),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            ..BatchOptions::default()
        }
    }
}

/// Load config from disk. Returns defaults if no config file exists.
pub fn load_config() -> Result<Config> {
    let path = config_path();

    if let Some(p) = &path {
        if p.exists() {
            let content =
                std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", p.display()))?;
            return Ok(config);
        }
    }

    Ok(Config::default())
}

/// Resolve the config file path.
fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("KVRECALL_CONFIG") {
        return Some(PathBuf::from(p));
    }

    dirs_home().map(|home| home.join(".config").join("kvrecall").join("config.toml"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// Show the active config path (for `kvrecall config`).
pub fn show_config_path() -> String {
    match config_path() {
        Some(p) if p.exists() => format!("{} (loaded)", p.display()),
        Some(p) => format!("{} (not found, using defaults)", p.display()),
        None => "no config path resolved (using defaults)".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sweep.facts_sizes, [3, 6]);
        assert_eq!(config.vocabulary.separator, "|");
        assert!(!config.batch.enabled);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[sweep]
trials = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sweep.trials, 5);
        // Other fields should be defaults
        assert_eq!(config.sweep.token_sizes, [2, 3]);
        assert_eq!(config.batch.batch_size, 20);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r##"
[output]
root = "/tmp/results"

[sweep]
facts_sizes = [1, 64]
token_sizes = [1, 16]
trials = 3
adaptive = true
staircase_factor = 4
early_abort = true
seed = 7

[batch]
enabled = true
batch_size = 50
max_payload_mb = 2

[vocabulary]
separator = "#"
max_sequence_length = 3

[template]
path = "prompts/recall.j2"

[providers.openai]
model = "gpt-4o"
api_key_env = "MY_KEY"
batch = true
vocabulary = "vocab/gpt-4o.json"
"##;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.output.root.as_deref(), Some("/tmp/results"));
        assert_eq!(config.template.path.as_deref(), Some("prompts/recall.j2"));

        let openai = config.provider("openai");
        assert_eq!(openai.settings.model.as_deref(), Some("gpt-4o"));
        assert_eq!(openai.settings.api_key_env.as_deref(), Some("MY_KEY"));
        assert!(openai.settings.batch);
        assert_eq!(openai.vocabulary.as_deref(), Some("vocab/gpt-4o.json"));
        assert_eq!(config.provider("ollama").settings, ProviderSettings::default());

        let opts = config.sweep_options();
        assert_eq!(opts.mode, GridMode::Staircase { factor: 4 });
        assert_eq!(opts.separator, "#");
        assert_eq!(opts.seed, Some(7));
        let batch = opts.batch.unwrap();
        assert_eq!(batch.batch_size, 50);
        assert_eq!(batch.max_payload_bytes, 2 * 1024 * 1024);

        let trim = config.trim_options();
        assert_eq!(trim.separator, "#");
        assert_eq!(trim.max_sequence_length, 3);
        assert_eq!(trim.min_tokens, 16);
    }

    #[test]
    fn test_min_tokens_override() {
        let config: Config = toml::from_str("[vocabulary]\nmin_tokens = 200\n").unwrap();
        assert_eq!(config.trim_options().min_tokens, 200);
        assert_eq!(Config::default().min_vocabulary(), 3);
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let config: Config = toml::from_str("[sweep]\ntimeout_secs = 0\n").unwrap();
        assert!(config.sweep_options().timeout.is_none());
        assert!(config.sweep_options().batch.is_none());
    }
}
