//! Experiment scheduler: plans the (N, K) grid against what is already on
//! disk, runs each unit's trials and persists one artifact per unit.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use kvrecall_core::provider::error_response;
use kvrecall_core::vocabulary::DEFAULT_SEPARATOR;
use kvrecall_core::{
    ErrorCategory, InstanceGenerator, KvError, KvResult, PromptRenderer, Provider, QueryParams,
    TrialRecord, UnitArtifact, UnitKey, Vocabulary,
};
use kvrecall_store::ArtifactStore;

use crate::batch::{BatchOptions, BatchOrchestrator};
use crate::schedule::{plan, requested_units, GridMode};
use crate::trial::{complete_trial, prepare_trial, PreparedTrial};

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub facts_sizes: Vec<usize>,
    pub token_sizes: Vec<usize>,
    pub trials: usize,
    pub mode: GridMode,
    /// Stop a unit after a trial below 0.5 sequence accuracy or with a flaw.
    pub early_abort: bool,
    pub timeout: Option<Duration>,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub max_token_multiplier: usize,
    pub separator: String,
    /// Use the bulk path when the provider offers one.
    pub batch: Option<BatchOptions>,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            facts_sizes: vec![3, 6],
            token_sizes: vec![2, 3],
            trials: 1,
            mode: GridMode::Explicit,
            early_abort: false,
            timeout: Some(Duration::from_secs(60)),
            temperature: 0.0,
            seed: None,
            max_token_multiplier: 2,
            separator: DEFAULT_SEPARATOR.into(),
            batch: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub key: UnitKey,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// Units written by this run, in completion order.
    pub completed: Vec<UnitKey>,
    /// Requested units that already had an artifact.
    pub skipped: Vec<UnitKey>,
    /// Units abandoned on a capacity error. Nothing was written for them.
    pub failed: Vec<UnitFailure>,
    pub written: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.completed.is_empty() && self.failed.is_empty()
    }
}

pub struct Scheduler<'a> {
    provider: &'a dyn Provider,
    renderer: &'a dyn PromptRenderer,
    store: &'a ArtifactStore,
    vocab: Arc<Vocabulary>,
    options: SweepOptions,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        renderer: &'a dyn PromptRenderer,
        store: &'a ArtifactStore,
        vocab: Arc<Vocabulary>,
        options: SweepOptions,
    ) -> Self {
        Self {
            provider,
            renderer,
            store,
            vocab,
            options,
        }
    }

    pub fn run(&self) -> KvResult<SweepReport> {
        if self.options.trials == 0 {
            return Err(KvError::Config("trials must be at least 1".into()));
        }
        let model = self.provider.model_name();
        let completed = self.store.completed_units(model)?;
        let todo = plan(
            self.options.mode,
            &self.options.facts_sizes,
            &self.options.token_sizes,
            &completed,
        )?;

        let mut report = SweepReport {
            skipped: self.skipped_units(&completed)?,
            ..Default::default()
        };
        if todo.is_empty() {
            info!(model, dir = %self.store.dir().display(), "all requested units already completed");
            return Ok(report);
        }
        info!(
            provider = self.provider.provider_id(),
            model,
            units = todo.len(),
            skipped = report.skipped.len(),
            "starting sweep"
        );

        let mut generator =
            InstanceGenerator::new(self.vocab.clone(), self.options.separator.clone(), self.options.seed);

        match (&self.options.batch, self.provider.as_batch()) {
            (Some(batch_opts), Some(batch_provider)) => {
                let batch_opts = BatchOptions {
                    temperature: self.options.temperature,
                    ..batch_opts.clone()
                };
                let mut orchestrator = BatchOrchestrator::new(
                    batch_provider,
                    self.store,
                    self.renderer.prompt_id(),
                    &self.options.separator,
                    batch_opts,
                );
                if self.options.early_abort {
                    debug!("early abort does not apply to batch submissions");
                }
                for key in todo {
                    match self.prepare_unit(&mut generator, key) {
                        Ok(trials) => orchestrator.enqueue_unit(key, trials)?,
                        Err(e) => self.record_failure(&mut report, key, e)?,
                    }
                }
                for (key, path) in orchestrator.finish()? {
                    report.completed.push(key);
                    report.written.push(path);
                }
            }
            (batch, _) => {
                if batch.is_some() {
                    warn!(
                        provider = self.provider.provider_id(),
                        "provider has no batch capability, running synchronously"
                    );
                }
                for key in todo {
                    match self.run_unit(&mut generator, key) {
                        Ok(trials) => {
                            let path = self.persist(key, trials)?;
                            report.completed.push(key);
                            report.written.push(path);
                        }
                        Err(e) => self.record_failure(&mut report, key, e)?,
                    }
                }
            }
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "sweep finished"
        );
        Ok(report)
    }

    fn skipped_units(&self, completed: &BTreeSet<UnitKey>) -> KvResult<Vec<UnitKey>> {
        let requested = requested_units(
            self.options.mode,
            &self.options.facts_sizes,
            &self.options.token_sizes,
        )?;
        Ok(requested.into_iter().filter(|k| completed.contains(k)).collect())
    }

    /// Capacity errors cost one unit; anything else ends the sweep.
    fn record_failure(&self, report: &mut SweepReport, key: UnitKey, err: KvError) -> KvResult<()> {
        if err.category() != ErrorCategory::Capacity {
            return Err(err);
        }
        warn!(unit = %key, error = %err, "unit skipped");
        report.failed.push(UnitFailure {
            key,
            error: err.to_string(),
        });
        Ok(())
    }

    fn prepare_unit(&self, generator: &mut InstanceGenerator, key: UnitKey) -> KvResult<Vec<PreparedTrial>> {
        (0..self.options.trials)
            .map(|t| self.prepare(generator, key, t))
            .collect()
    }

    fn prepare(&self, generator: &mut InstanceGenerator, key: UnitKey, trial: usize) -> KvResult<PreparedTrial> {
        prepare_trial(
            generator,
            self.renderer,
            self.provider,
            key,
            trial,
            self.options.max_token_multiplier,
        )
    }

    fn run_unit(&self, generator: &mut InstanceGenerator, key: UnitKey) -> KvResult<Vec<TrialRecord>> {
        let mut records = Vec::with_capacity(self.options.trials);
        for t in 0..self.options.trials {
            let prepared = self.prepare(generator, key, t)?;
            debug!(unit = %key, trial = t, "querying");

            let params = QueryParams {
                temperature: self.options.temperature,
                max_tokens: Some(prepared.max_tokens),
                timeout: self.options.timeout,
            };
            let started = Instant::now();
            let (raw, latency) = match self.provider.query(&prepared.prompt.text, &params) {
                Ok(text) => (text, Some(started.elapsed().as_secs_f64() * 1000.0)),
                Err(e) => {
                    warn!(unit = %key, trial = t, error = %e, "query failed, recording error trial");
                    (error_response(e), None)
                }
            };

            let record = complete_trial(
                &prepared,
                &raw,
                latency,
                self.provider.tokenizer(),
                &self.options.separator,
            )?;
            let abort = self.options.early_abort
                && (record.sequence_accuracy < 0.5 || record.major_format_flaw);
            debug!(
                unit = %key,
                trial = t,
                seq = record.sequence_accuracy,
                tok = record.token_accuracy,
                flaw = record.major_format_flaw,
                "trial graded"
            );
            records.push(record);
            if abort {
                info!(unit = %key, trials = records.len(), "early abort");
                break;
            }
        }
        Ok(records)
    }

    fn persist(&self, key: UnitKey, trials: Vec<TrialRecord>) -> KvResult<PathBuf> {
        let artifact = UnitArtifact::new(
            self.renderer.prompt_id(),
            self.provider.provider_id(),
            self.provider.model_name(),
            key,
            trials,
            Utc::now(),
        );
        self.store.write_unit(&artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvrecall_core::testing::{BatchOutcome, PieceTokenizer, ScriptedProvider};
    use kvrecall_core::JinjaTemplate;
    use tempfile::TempDir;

    fn tokens() -> Vec<String> {
        let letters = ['a', 'b', 'c', 'd', 'e', 'f'];
        letters
            .iter()
            .flat_map(|a| letters.iter().map(move |b| format!("{a}{b}")))
            .collect()
    }

    fn tokenizer() -> PieceTokenizer {
        let mut pieces = tokens();
        pieces.push("|".into());
        PieceTokenizer::new(pieces)
    }

    fn vocab() -> Arc<Vocabulary> {
        Arc::new(Vocabulary::new("piece-tokenizer", tokens()))
    }

    fn options(facts: &[usize], ks: &[usize], trials: usize) -> SweepOptions {
        SweepOptions {
            facts_sizes: facts.to_vec(),
            token_sizes: ks.to_vec(),
            trials,
            seed: Some(1),
            ..Default::default()
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: ArtifactStore,
        renderer: JinjaTemplate,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path(), "tpl_test", "scripted").unwrap();
        Fixture {
            _dir: dir,
            store,
            renderer: JinjaTemplate::builtin("|").unwrap().with_prompt_id("tpl_test"),
        }
    }

    #[test]
    fn test_sync_sweep_writes_one_artifact_per_unit() {
        let fx = fixture();
        let provider = ScriptedProvider::oracle(tokenizer());
        let report = Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), options(&[2, 3], &[1, 2], 2))
            .run()
            .unwrap();

        assert_eq!(report.completed.len(), 4);
        assert_eq!(provider.queries().len(), 8);
        let units = fx.store.load_units(Some("scripted-model")).unwrap();
        assert_eq!(units.len(), 4);
        for unit in &units {
            assert_eq!(unit.trials.len(), 2);
            assert_eq!(unit.prompt_id, "tpl_test");
            assert!(unit.trials.iter().all(|t| t.sequence_accuracy == 1.0));
            assert!(unit.trials.iter().all(|t| t.response_time_ms.is_some()));
        }
    }

    #[test]
    fn test_resume_runs_only_missing_units() {
        let fx = fixture();
        let provider = ScriptedProvider::oracle(tokenizer());
        Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), options(&[3], &[2], 1))
            .run()
            .unwrap();
        assert_eq!(provider.queries().len(), 1);

        let provider = ScriptedProvider::oracle(tokenizer());
        let report = Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), options(&[3], &[2, 3], 1))
            .run()
            .unwrap();
        assert_eq!(report.skipped, vec![UnitKey::new(3, 2)]);
        assert_eq!(report.completed, vec![UnitKey::new(3, 3)]);
        assert_eq!(provider.queries().len(), 1);

        let provider = ScriptedProvider::oracle(tokenizer());
        let report = Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), options(&[3], &[2, 3], 1))
            .run()
            .unwrap();
        assert!(report.is_noop());
        assert!(provider.queries().is_empty());
    }

    #[test]
    fn test_staircase_mode() {
        let fx = fixture();
        let provider = ScriptedProvider::oracle(tokenizer());
        let opts = SweepOptions {
            mode: GridMode::Staircase { factor: 2 },
            ..options(&[1, 4], &[1, 4], 1)
        };
        let report = Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), opts)
            .run()
            .unwrap();
        assert_eq!(
            report.completed,
            vec![UnitKey::new(1, 1), UnitKey::new(2, 2), UnitKey::new(4, 4)]
        );
    }

    #[test]
    fn test_early_abort_stops_unit() {
        let fx = fixture();
        let provider = ScriptedProvider::new(tokenizer(), Box::new(|_| Ok("zz|zz".to_string())));
        let opts = SweepOptions {
            early_abort: true,
            ..options(&[2], &[2], 3)
        };
        Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), opts)
            .run()
            .unwrap();
        assert_eq!(provider.queries().len(), 1);
        let units = fx.store.load_units(None).unwrap();
        assert_eq!(units[0].trials.len(), 1);
    }

    #[test]
    fn test_provider_error_becomes_error_trial() {
        let fx = fixture();
        let provider = ScriptedProvider::new(
            tokenizer(),
            Box::new(|_| Err(KvError::Provider("timed out".into()))),
        );
        let report = Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), options(&[2], &[1, 2], 1))
            .run()
            .unwrap();
        assert_eq!(report.completed.len(), 2);
        let units = fx.store.load_units(None).unwrap();
        for unit in units {
            let trial = &unit.trials[0];
            assert!(trial.response_text.starts_with("ERROR: "));
            assert!(trial.response_time_ms.is_none());
            assert_eq!(trial.sequence_accuracy, 0.0);
        }
    }

    #[test]
    fn test_capacity_error_isolated_to_unit() {
        let fx = fixture();
        let small = Arc::new(Vocabulary::new("piece-tokenizer", ["aa", "bb"]));
        let provider = ScriptedProvider::oracle(tokenizer());
        let report = Scheduler::new(&provider, &fx.renderer, &fx.store, small, options(&[1, 2], &[1], 1))
            .run()
            .unwrap();
        assert_eq!(report.completed, vec![UnitKey::new(1, 1)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, UnitKey::new(2, 1));
        let done = fx.store.completed_units("scripted-model").unwrap();
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn test_batch_path_matches_sync_artifacts() {
        let fx = fixture();
        let provider = ScriptedProvider::oracle(tokenizer()).with_batch(BatchOutcome::Complete, 1);
        let opts = SweepOptions {
            batch: Some(BatchOptions {
                batch_size: 3,
                poll_interval: Duration::ZERO,
                ..Default::default()
            }),
            ..options(&[2, 3], &[2], 2)
        };
        let report = Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), opts)
            .run()
            .unwrap();

        assert!(provider.queries().is_empty());
        assert_eq!(provider.submissions().len(), 2);
        assert_eq!(report.completed.len(), 2);
        let units = fx.store.load_units(Some("scripted-model")).unwrap();
        assert_eq!(units.len(), 2);
        for unit in units {
            let trial_ids: Vec<_> = unit.trials.iter().map(|t| t.trial).collect();
            assert_eq!(trial_ids, vec![0, 1]);
            assert!(unit.trials.iter().all(|t| t.sequence_accuracy == 1.0));
            assert!(unit.trials.iter().all(|t| t.prompt_tokens.is_some()));
        }
    }

    #[test]
    fn test_batch_requested_without_capability_runs_sync() {
        let fx = fixture();
        let provider = ScriptedProvider::oracle(tokenizer());
        let opts = SweepOptions {
            batch: Some(BatchOptions::default()),
            ..options(&[2], &[2], 1)
        };
        Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), opts)
            .run()
            .unwrap();
        assert_eq!(provider.queries().len(), 1);
    }

    #[test]
    fn test_zero_trials_rejected() {
        let fx = fixture();
        let provider = ScriptedProvider::oracle(tokenizer());
        let err = Scheduler::new(&provider, &fx.renderer, &fx.store, vocab(), options(&[2], &[2], 0))
            .run()
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
