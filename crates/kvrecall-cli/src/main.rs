mod config;
mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use kvrecall_core::vocabulary::{self, alpha_tokens_from_vocab, generate_alpha_tokens, trim};
use kvrecall_core::{
    HfTokenizer, JinjaTemplate, PromptRenderer, Provider, ProviderRegistry, Tokenizer, UnitArtifact,
    Vocabulary,
};
use kvrecall_store::{list_runs, load_vocabulary, save_vocabulary, ArtifactStore};
use kvrecall_sweep::{GridMode, RunContext, Scheduler};

use crate::config::Config;

#[derive(Parser)]
#[command(
    name = "kvrecall",
    version,
    about = "Key-value recall benchmarks for LLMs"
)]
struct Cli {
    /// Results root directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) a sweep against one provider
    Run {
        /// Provider id (see `kvrecall providers`)
        #[arg(short, long)]
        provider: String,

        /// Model name, overriding the provider config
        #[arg(short, long)]
        model: Option<String>,

        /// Fact counts (comma-separated)
        #[arg(long, value_delimiter = ',')]
        facts: Option<Vec<usize>>,

        /// Tokens per sequence (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tokens: Option<Vec<usize>>,

        /// Trials per (N, K) unit
        #[arg(short, long)]
        trials: Option<usize>,

        /// Staircase from the smallest sizes instead of the full grid
        #[arg(long)]
        adaptive: bool,

        /// Stop a unit after a failed trial
        #[arg(long)]
        early_abort: bool,

        /// Submit through the provider's batch API
        #[arg(long)]
        batch: bool,

        /// Seed for instance generation
        #[arg(long)]
        seed: Option<u64>,

        /// Jinja template file
        #[arg(long)]
        template: Option<PathBuf>,

        /// Vocabulary JSON, skipping generation and trimming
        #[arg(long)]
        vocab: Option<PathBuf>,
    },

    /// Build and trim single-token vocabularies
    Vocab {
        #[command(subcommand)]
        command: VocabCommands,
    },

    /// Show the N x K accuracy grid of saved results
    Report {
        /// Only this prompt id
        #[arg(long)]
        prompt_id: Option<String>,

        /// Only this provider
        #[arg(short, long)]
        provider: Option<String>,

        /// Only this model
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show per-token diffs of one unit artifact
    Inspect {
        /// Unit artifact JSON file
        file: PathBuf,

        /// Only this trial
        #[arg(short, long)]
        trial: Option<usize>,
    },

    /// List registered providers
    Providers,

    /// Show the active configuration
    Config,
}

#[derive(Subcommand)]
enum VocabCommands {
    /// Generate alphabet-only single tokens, trim them and save
    Generate {
        /// Tokenizer file (or hub repo with the `hub` feature)
        #[arg(long)]
        tokenizer: Option<String>,

        /// Take the tokenizer from this provider's config
        #[arg(short, long)]
        provider: Option<String>,

        /// Number of candidates to find before trimming
        #[arg(short, long)]
        count: Option<usize>,

        /// Pull candidates from the tokenizer's piece table
        #[arg(long)]
        from_vocab: bool,

        /// Save candidates without trimming
        #[arg(long)]
        no_trim: bool,

        /// Output JSON file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Trim an existing vocabulary file
    Trim {
        /// Input JSON file
        input: PathBuf,

        #[arg(long)]
        tokenizer: Option<String>,

        #[arg(short, long)]
        provider: Option<String>,

        /// Output JSON file (default: overwrite input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn default_results_root() -> PathBuf {
    directories::ProjectDirs::from("dev", "kvrecall", "kvrecall")
        .map(|dirs| dirs.data_dir().join("results"))
        .unwrap_or_else(|| PathBuf::from("results"))
}

fn results_root(cli_root: Option<PathBuf>, cfg: &Config) -> PathBuf {
    cli_root
        .or_else(|| cfg.output.root.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_results_root)
}

fn registry() -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    kvrecall_providers::register_builtin(&mut registry)?;
    Ok(registry)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing_subscriber::filter::LevelFilter::INFO
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config()?;
    let root = results_root(cli.root, &cfg);

    match cli.command {
        Commands::Run {
            provider,
            model,
            facts,
            tokens,
            trials,
            adaptive,
            early_abort,
            batch,
            seed,
            template,
            vocab,
        } => {
            let mut cfg = cfg;
            if let Some(facts) = facts {
                cfg.sweep.facts_sizes = facts;
            }
            if let Some(tokens) = tokens {
                cfg.sweep.token_sizes = tokens;
            }
            if let Some(trials) = trials {
                cfg.sweep.trials = trials;
            }
            if seed.is_some() {
                cfg.sweep.seed = seed;
            }
            cfg.sweep.adaptive |= adaptive;
            cfg.sweep.early_abort |= early_abort;
            cfg.batch.enabled |= batch;
            if let Some(template) = template {
                cfg.template.path = Some(template.display().to_string());
            }
            cmd_run(&cfg, &root, &provider, model, vocab)
        }
        Commands::Vocab { command } => match command {
            VocabCommands::Generate {
                tokenizer,
                provider,
                count,
                from_vocab,
                no_trim,
                output,
            } => {
                let tok = resolve_tokenizer(&cfg, tokenizer.as_deref(), provider.as_deref())?;
                cmd_vocab_generate(&cfg, tok.as_ref(), count, from_vocab, no_trim, &output)
            }
            VocabCommands::Trim {
                input,
                tokenizer,
                provider,
                output,
            } => {
                let tok = resolve_tokenizer(&cfg, tokenizer.as_deref(), provider.as_deref())?;
                cmd_vocab_trim(&cfg, tok.as_ref(), &input, output.as_deref().unwrap_or(&input))
            }
        },
        Commands::Report {
            prompt_id,
            provider,
            model,
        } => cmd_report(&root, prompt_id.as_deref(), provider.as_deref(), model.as_deref()),
        Commands::Inspect { file, trial } => cmd_inspect(&cfg, &file, trial),
        Commands::Providers => cmd_providers(&cfg),
        Commands::Config => cmd_config(&cfg, &root),
    }
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

fn cmd_run(
    cfg: &Config,
    root: &Path,
    provider_id: &str,
    model: Option<String>,
    vocab_file: Option<PathBuf>,
) -> Result<()> {
    let mut provider_cfg = cfg.provider(provider_id);
    if model.is_some() {
        provider_cfg.settings.model = model;
    }
    if cfg.batch.enabled {
        provider_cfg.settings.batch = true;
    }
    let provider = registry()?
        .create(provider_id, &provider_cfg.settings)
        .with_context(|| format!("creating provider {provider_id}"))?;

    let separator = &cfg.vocabulary.separator;
    let template = match &cfg.template.path {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading template {path}"))?;
            JinjaTemplate::new(&source, separator.as_str())?
        }
        None => JinjaTemplate::builtin(separator.as_str())?,
    };
    let template = match &cfg.template.prompt_id {
        Some(id) => template.with_prompt_id(id.as_str()),
        None => template,
    };

    let ctx = RunContext::open(root).context("opening results root")?;
    let vocab_file = vocab_file.or_else(|| provider_cfg.vocabulary.as_ref().map(PathBuf::from));
    let vocab = run_vocabulary(cfg, &ctx, provider.as_ref(), vocab_file.as_deref())?;
    info!(tokens = vocab.len(), "vocabulary ready");

    let store = ctx.store(template.prompt_id(), provider.provider_id())?;
    let options = cfg.sweep_options();
    let report = Scheduler::new(provider.as_ref(), &template, &store, vocab, options).run()?;

    println!(
        "{} / {} ({})",
        provider.provider_id(),
        provider.model_name(),
        store.dir().display()
    );
    if report.is_noop() {
        println!("Nothing to do: all {} requested units already completed.", report.skipped.len());
    } else {
        println!(
            "Completed {} units, skipped {}, failed {}.",
            report.completed.len(),
            report.skipped.len(),
            report.failed.len()
        );
        for failure in &report.failed {
            println!("  failed {}: {}", failure.key, failure.error);
        }
    }
    ctx.close()?;
    Ok(())
}

fn run_vocabulary(
    cfg: &Config,
    ctx: &RunContext,
    provider: &dyn Provider,
    vocab_file: Option<&Path>,
) -> Result<Arc<Vocabulary>> {
    let tokenizer = provider.tokenizer();
    if let Some(path) = vocab_file {
        let vocab = load_vocabulary(path, tokenizer.name())
            .with_context(|| format!("loading vocabulary {}", path.display()))?;
        vocabulary::verify(&vocab, tokenizer).with_context(|| {
            format!(
                "{} is not single-token safe under {}",
                path.display(),
                tokenizer.name()
            )
        })?;
        vocab.ensure_size(cfg.min_vocabulary())?;
        return Ok(Arc::new(vocab));
    }
    let pool = generate_alpha_tokens(cfg.vocabulary.size, tokenizer, &cfg.alpha_spec())?;
    let pool: Vec<String> = pool.into_iter().collect();
    Ok(ctx.vocabulary(&pool, tokenizer, &cfg.trim_options())?)
}

// ---------------------------------------------------------------------------
// Vocabulary commands
// ---------------------------------------------------------------------------

fn resolve_tokenizer(
    cfg: &Config,
    tokenizer: Option<&str>,
    provider: Option<&str>,
) -> Result<Box<dyn Tokenizer>> {
    let reference = match (tokenizer, provider) {
        (Some(t), _) => t.to_string(),
        (None, Some(p)) => match cfg.provider(p).settings.tokenizer {
            Some(t) => t,
            None => bail!("no tokenizer configured for provider {p}"),
        },
        (None, None) => bail!("pass --tokenizer or --provider"),
    };
    let tok = HfTokenizer::resolve(&reference)
        .with_context(|| format!("loading tokenizer {reference}"))?;
    Ok(Box::new(tok))
}

fn cmd_vocab_generate(
    cfg: &Config,
    tokenizer: &dyn Tokenizer,
    count: Option<usize>,
    from_vocab: bool,
    no_trim: bool,
    output: &Path,
) -> Result<()> {
    let count = count.unwrap_or(cfg.vocabulary.size);
    let spec = cfg.alpha_spec();
    let candidates = if from_vocab {
        alpha_tokens_from_vocab(count, tokenizer, &spec)?
    } else {
        generate_alpha_tokens(count, tokenizer, &spec)?
    };
    println!("Found {} single-token candidates.", candidates.len());

    let built = vocabulary::build(candidates.iter(), tokenizer)?;
    let vocab = if no_trim {
        built
    } else {
        let trimmed = trim(&built, tokenizer, &cfg.trim_options())?;
        println!("Trimmed {} -> {} tokens.", built.len(), trimmed.len());
        trimmed
    };
    save_vocabulary(output, &vocab)?;
    println!("Saved: {}", output.display());
    Ok(())
}

fn cmd_vocab_trim(cfg: &Config, tokenizer: &dyn Tokenizer, input: &Path, output: &Path) -> Result<()> {
    let vocab = load_vocabulary(input, tokenizer.name())
        .with_context(|| format!("loading vocabulary {}", input.display()))?;
    let trimmed = trim(&vocab, tokenizer, &cfg.trim_options())?;
    save_vocabulary(output, &trimmed)?;
    println!(
        "Trimmed {} -> {} tokens. Saved: {}",
        vocab.len(),
        trimmed.len(),
        output.display()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

fn cmd_report(
    root: &Path,
    prompt_id: Option<&str>,
    provider: Option<&str>,
    model: Option<&str>,
) -> Result<()> {
    let runs = list_runs(root)?;
    let runs: Vec<_> = runs
        .into_iter()
        .filter(|r| prompt_id.map_or(true, |p| r.prompt_id == p))
        .filter(|r| provider.map_or(true, |p| r.provider == p))
        .collect();
    if runs.is_empty() {
        println!("No results under {}.", root.display());
        return Ok(());
    }

    for run in &runs {
        let store = ArtifactStore::open(root, &run.prompt_id, &run.provider)?;
        let units = store.load_units(model)?;
        let mut models: Vec<&str> = units.iter().map(|u| u.model.as_str()).collect();
        models.dedup();
        for m in models {
            let of_model: Vec<UnitArtifact> =
                units.iter().filter(|u| u.model == m).cloned().collect();
            println!("prompt={}  provider={}  model={m}", run.prompt_id, run.provider);
            println!("{}", report::render_grid(&report::summarize(&of_model)));
        }
    }
    Ok(())
}

fn cmd_inspect(cfg: &Config, file: &Path, trial: Option<usize>) -> Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let unit: UnitArtifact =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
    let summary = unit.summary();
    println!(
        "{} / {}  {}  trials={}  seq={:.2}  tok={:.2}  flaws={:.0}%",
        unit.provider,
        unit.model,
        unit.key(),
        summary.trials,
        summary.mean_sequence_accuracy,
        summary.mean_token_accuracy,
        summary.flaw_ratio * 100.0
    );
    let mut shown = 0;
    for t in unit.trials.iter().filter(|t| trial.map_or(true, |n| t.trial == n)) {
        println!();
        print!("{}", report::render_trial(t, &cfg.vocabulary.separator));
        shown += 1;
    }
    if shown == 0 {
        if let Some(n) = trial {
            bail!("no trial {n} in {}", file.display());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

fn cmd_providers(cfg: &Config) -> Result<()> {
    let registry = registry()?;
    println!("{:<12} Configured", "Provider");
    println!("{}", "-".repeat(24));
    for id in registry.ids() {
        let configured = if cfg.providers.contains_key(id) { "yes" } else { "no" };
        println!("{id:<12} {configured}");
    }
    Ok(())
}

fn cmd_config(cfg: &Config, root: &Path) -> Result<()> {
    println!("Config: {}", config::show_config_path());
    println!();
    println!("[output]");
    println!("  root = {}", root.display());
    println!();
    println!("[sweep]");
    println!("  facts_sizes = {:?}", cfg.sweep.facts_sizes);
    println!("  token_sizes = {:?}", cfg.sweep.token_sizes);
    println!("  trials = {}", cfg.sweep.trials);
    let mode = match cfg.sweep_options().mode {
        GridMode::Explicit => "explicit".to_string(),
        GridMode::Staircase { factor } => format!("staircase x{factor}"),
    };
    println!("  mode = {mode}");
    println!("  early_abort = {}", cfg.sweep.early_abort);
    println!("  timeout_secs = {}", cfg.sweep.timeout_secs);
    println!("  temperature = {}", cfg.sweep.temperature);
    if let Some(seed) = cfg.sweep.seed {
        println!("  seed = {seed}");
    }
    println!("  max_token_multiplier = {}", cfg.sweep.max_token_multiplier);
    println!();
    println!("[batch]");
    println!("  enabled = {}", cfg.batch.enabled);
    println!("  batch_size = {}", cfg.batch.batch_size);
    println!("  max_payload_mb = {}", cfg.batch.max_payload_mb);
    println!("  poll_interval_secs = {}", cfg.batch.poll_interval_secs);
    println!("  timeout_secs = {}", cfg.batch.timeout_secs);
    println!();
    println!("[vocabulary]");
    println!("  separator = {:?}", cfg.vocabulary.separator);
    println!("  require_surround_single = {}", cfg.vocabulary.require_surround_single);
    println!("  max_sequence_length = {}", cfg.vocabulary.max_sequence_length);
    println!("  size = {}", cfg.vocabulary.size);
    println!();
    println!("[template]");
    println!(
        "  path = {}",
        cfg.template.path.as_deref().unwrap_or("(built-in)")
    );
    for (id, p) in &cfg.providers {
        println!();
        println!("[providers.{id}]");
        if let Some(model) = &p.settings.model {
            println!("  model = {model}");
        }
        if let Some(url) = &p.settings.base_url {
            println!("  base_url = {url}");
        }
        if let Some(tok) = &p.settings.tokenizer {
            println!("  tokenizer = {tok}");
        }
        if let Some(vocab) = &p.vocabulary {
            println!("  vocabulary = {vocab}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use kvrecall_core::testing::{PieceTokenizer, ScriptedProvider};
    use kvrecall_core::KvError;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "kvrecall", "run", "-p", "openai", "--facts", "3,6,12", "--tokens", "2", "--batch",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                provider,
                facts,
                tokens,
                batch,
                ..
            } => {
                assert_eq!(provider, "openai");
                assert_eq!(facts, Some(vec![3, 6, 12]));
                assert_eq!(tokens, Some(vec![2]));
                assert!(batch);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_results_root_precedence() {
        let mut cfg = Config::default();
        cfg.output.root = Some("/from/config".into());
        assert_eq!(
            results_root(Some(PathBuf::from("/from/cli")), &cfg),
            PathBuf::from("/from/cli")
        );
        assert_eq!(results_root(None, &cfg), PathBuf::from("/from/config"));
        let cfg = Config::default();
        assert!(results_root(None, &cfg).ends_with("results"));
    }

    #[test]
    fn test_builtin_providers_registered() {
        let registry = registry().unwrap();
        let ids = registry.ids();
        assert!(ids.contains(&"openai"));
        assert!(ids.contains(&"ollama"));
    }

    fn run_vocabulary_err(cfg: &Config, tokenizer: PieceTokenizer, file: Option<&Path>) -> KvError {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = RunContext::open(dir.path()).unwrap();
        let provider = ScriptedProvider::oracle(tokenizer);
        let err = run_vocabulary(cfg, &ctx, &provider, file).unwrap_err();
        err.downcast::<KvError>().unwrap()
    }

    #[test]
    fn test_run_rejects_multi_token_vocabulary_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, r#"["ab", "cdcd", "zzzz"]"#).unwrap();
        let err = run_vocabulary_err(
            &Config::default(),
            PieceTokenizer::new(["ab", "cd", "|"]),
            Some(&path),
        );
        assert!(matches!(err, KvError::ValidationFailed { requested: 3, kept: 1 }));
    }

    #[test]
    fn test_run_accepts_single_token_vocabulary_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, r#"["ab", "cd", "ef"]"#).unwrap();
        let ctx = RunContext::open(dir.path().join("results")).unwrap();
        let provider = ScriptedProvider::oracle(PieceTokenizer::new(["ab", "cd", "ef", "|"]));
        let vocab = run_vocabulary(&Config::default(), &ctx, &provider, Some(&path)).unwrap();
        assert_eq!(vocab.tokens(), ["ab", "cd", "ef"]);
    }

    #[test]
    fn test_run_rejects_undersized_trimmed_vocabulary() {
        // "aa|" and "|ab" merge with the separator, so only "bb" survives.
        let tok = || PieceTokenizer::new(["aa", "ab", "bb", "|", "aa|", "|ab"]);
        let mut cfg = Config::default();
        cfg.vocabulary.size = 3;
        cfg.vocabulary.alphabet = "ab".into();
        cfg.vocabulary.max_len = 2;
        let err = run_vocabulary_err(&cfg, tok(), None);
        assert!(matches!(err, KvError::ValidationFailed { requested: 3, kept: 1 }));

        cfg.vocabulary.min_tokens = Some(1);
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = RunContext::open(dir.path()).unwrap();
        let provider = ScriptedProvider::oracle(tok());
        let vocab = run_vocabulary(&cfg, &ctx, &provider, None).unwrap();
        assert_eq!(vocab.tokens(), ["bb"]);
    }

    #[test]
    fn test_report_on_empty_root() {
        let dir = tempfile::TempDir::new().unwrap();
        cmd_report(dir.path(), None, None, None).unwrap();
    }
}
