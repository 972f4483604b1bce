use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use kvrecall_core::artifact::{file_safe_model, parse_unit_stem, STAMP_FORMAT};
use kvrecall_core::{KvError, KvResult, UnitArtifact, UnitKey};

use crate::layout::{atomic_write, is_temp_file, provider_dir, UNIT_EXT};

/// Artifacts of one (prompt, provider) pair.
pub struct ArtifactStore {
    dir: PathBuf,
    prompt_id: String,
    provider: String,
}

impl ArtifactStore {
    pub fn open(root: &Path, prompt_id: &str, provider: &str) -> KvResult<Self> {
        let dir = provider_dir(root, prompt_id, provider);
        fs::create_dir_all(&dir)
            .map_err(|e| KvError::Storage(format!("cannot create {}: {e}", dir.display())))?;
        debug!(dir = %dir.display(), "opened artifact store");
        Ok(Self {
            dir,
            prompt_id: prompt_id.to_string(),
            provider: provider.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// (N, K) pairs that already have an artifact for `model`.
    ///
    /// Point-in-time scan of file names only; contents are not read.
    pub fn completed_units(&self, model: &str) -> KvResult<BTreeSet<UnitKey>> {
        let mut done = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some(UNIT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(key) = parse_unit_stem(model, stem) {
                done.insert(key);
            }
        }
        Ok(done)
    }

    /// Persist a unit. Existing artifacts are never overwritten.
    pub fn write_unit(&self, artifact: &UnitArtifact) -> KvResult<PathBuf> {
        let path = self.dir.join(format!("{}.{UNIT_EXT}", artifact.id));
        if path.exists() {
            return Err(KvError::Storage(format!(
                "artifact already exists: {}",
                path.display()
            )));
        }
        let bytes = serde_json::to_vec_pretty(artifact)?;
        atomic_write(&path, &bytes)?;
        info!(
            unit = %artifact.key(),
            trials = artifact.trials.len(),
            path = %path.display(),
            "wrote unit artifact"
        );
        Ok(path)
    }

    /// All readable unit artifacts, optionally restricted to one model,
    /// sorted by (model, N, K). Unreadable files are skipped with a warning.
    pub fn load_units(&self, model: Option<&str>) -> KvResult<Vec<UnitArtifact>> {
        let mut units = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some(UNIT_EXT) {
                continue;
            }
            if let Some(model) = model {
                let prefix = format!("{}_", file_safe_model(model));
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix));
                if !matches {
                    continue;
                }
            }
            match fs::read(&path).map_err(KvError::from).and_then(|b| {
                serde_json::from_slice::<UnitArtifact>(&b).map_err(KvError::from)
            }) {
                Ok(unit) if model.map_or(true, |m| unit.model == m) => units.push(unit),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable artifact"),
            }
        }
        units.sort_by(|a, b| (&a.model, a.key()).cmp(&(&b.model, b.key())));
        Ok(units)
    }

    /// Preserve a provider-supplied per-item error file.
    pub fn save_error_file(&self, batch_id: &str, bytes: &[u8]) -> KvResult<PathBuf> {
        let path = self.dir.join(format!("errors_{}.jsonl", sanitize(batch_id)));
        atomic_write(&path, bytes)?;
        warn!(batch_id, path = %path.display(), "saved batch error file");
        Ok(path)
    }

    /// Preserve a downloaded batch output file.
    pub fn save_batch_output(&self, bytes: &[u8], stamp: DateTime<Utc>) -> KvResult<PathBuf> {
        let base = format!("batch_output_{}", stamp.format(STAMP_FORMAT));
        let mut path = self.dir.join(format!("{base}.jsonl"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{base}_{n}.jsonl"));
            n += 1;
        }
        atomic_write(&path, bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved batch output");
        Ok(path)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
