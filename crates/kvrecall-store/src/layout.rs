//! On-disk layout of a results root:
//!
//! ```text
//! <root>/prompt_<prompt_id>/<provider>/<model>_<N>N_<K>K_<stamp>.json
//! <root>/prompt_<prompt_id>/<provider>/batch_output_<stamp>.jsonl
//! <root>/prompt_<prompt_id>/<provider>/errors_<batch_id>.jsonl
//! ```
//!
//! In-flight writes go to a dot-prefixed `.tmp` sibling and are renamed into
//! place, so a scan never sees a partial artifact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use kvrecall_core::{KvError, KvResult};

pub const PROMPT_DIR_PREFIX: &str = "prompt_";
pub const UNIT_EXT: &str = "json";
const TMP_SUFFIX: &str = ".tmp";

pub fn prompt_dir(root: &Path, prompt_id: &str) -> PathBuf {
    root.join(format!("{PROMPT_DIR_PREFIX}{prompt_id}"))
}

pub fn provider_dir(root: &Path, prompt_id: &str, provider: &str) -> PathBuf {
    prompt_dir(root, prompt_id).join(provider)
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(TMP_SUFFIX))
}

/// Write `bytes` to `path` through a temp file in the same directory.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> KvResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| KvError::Storage(format!("no parent directory: {}", path.display())))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| KvError::Storage(format!("invalid file name: {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(".{name}{TMP_SUFFIX}"));
    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(KvError::Storage(format!(
            "cannot write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

/// One `prompt_<id>/<provider>` directory under a results root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunDir {
    pub prompt_id: String,
    pub provider: String,
    pub path: PathBuf,
}

/// Every run directory under `root`, sorted. A missing root is empty.
pub fn list_runs(root: &Path) -> KvResult<Vec<RunDir>> {
    let mut runs = Vec::new();
    if !root.is_dir() {
        return Ok(runs);
    }
    for prompt in fs::read_dir(root)? {
        let prompt = prompt?;
        let name = prompt.file_name().to_string_lossy().into_owned();
        let Some(prompt_id) = name.strip_prefix(PROMPT_DIR_PREFIX) else {
            continue;
        };
        if !prompt.file_type()?.is_dir() {
            continue;
        }
        for provider in fs::read_dir(prompt.path())? {
            let provider = provider?;
            if provider.file_type()?.is_dir() {
                runs.push(RunDir {
                    prompt_id: prompt_id.to_string(),
                    provider: provider.file_name().to_string_lossy().into_owned(),
                    path: provider.path(),
                });
            }
        }
    }
    runs.sort();
    Ok(runs)
}
