//! Dataset, analysis, and codebook files.
//!
//! All artifacts are JSON. Writes go through a temporary file and a rename
//! so an interrupted run never leaves a truncated checkpoint behind.

use anyhow::{bail, Context, Result};
use qualcode_core::models::{Codebook, CodedThreads, DataChunk};
use qualcode_core::registry::dataset_codebook;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A dataset of conversations to code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coding_notes: Option<String>,
    pub chunks: BTreeMap<String, DataChunk>,
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}: {}", what, path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}: {}", what, path.display()))
}

pub fn load_dataset(path: &Path) -> Result<Dataset> {
    let dataset: Dataset = read_json(path, "dataset")?;
    if dataset.chunks.is_empty() {
        bail!("Dataset has no chunks: {}", path.display());
    }
    Ok(dataset)
}

pub fn load_analysis(path: &Path) -> Result<CodedThreads> {
    read_json(path, "analysis")
}

/// Pretty-print `value` to `path` atomically, creating parent directories.
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    debug!(path = %path.display(), "saved");
    Ok(())
}

/// Read a consolidation input: either a codebook (`label -> Code`) or an
/// analysis, in which case its stored codebook or the union of its thread
/// codebooks is used.
pub fn load_codebook_input(path: &Path) -> Result<Codebook> {
    let value: serde_json::Value = read_json(path, "codebook")?;
    if value.get("threads").is_some_and(|t| t.is_object()) {
        let analysis: CodedThreads = serde_json::from_value(value)
            .with_context(|| format!("Failed to parse analysis: {}", path.display()))?;
        return Ok(analysis.codebook.clone().unwrap_or_else(|| dataset_codebook(&analysis)));
    }
    serde_json::from_value(value).with_context(|| format!("Failed to parse codebook: {}", path.display()))
}

const CODEBOOK_SUFFIX: &str = ".codebook.json";
const ANALYSIS_SUFFIX: &str = ".analysis.json";

/// Run stem of a `qc code` artifact and whether it is the analysis.
fn run_artifact(path: &Path) -> Option<(PathBuf, bool)> {
    let name = path.file_name()?.to_str()?;
    let (stem, is_analysis) = match name.strip_suffix(ANALYSIS_SUFFIX) {
        Some(stem) => (stem, true),
        None => (name.strip_suffix(CODEBOOK_SUFFIX)?, false),
    };
    Some((path.with_file_name(stem), is_analysis))
}

/// Codebook inputs of a run directory, one file per run. The analysis wins
/// over the codebook of the same run; `consolidation/` snapshots are skipped.
fn discover_in_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut runs: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    let walker = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && e.file_name() == "consolidation"));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some((run, is_analysis)) = run_artifact(entry.path()) else {
            debug!(path = %entry.path().display(), "skipping non-run file");
            continue;
        };
        if is_analysis || !runs.contains_key(&run) {
            runs.insert(run, entry.into_path());
        }
    }
    Ok(runs.into_values().collect())
}

/// Expand inputs into a list of codebook or analysis files.
///
/// Files are taken as given. Directories contribute their
/// `*.analysis.json` and `*.codebook.json` files in path order.
pub fn discover_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for path in paths {
        if path.is_dir() {
            found.extend(discover_in_dir(path)?);
        } else if path.is_file() {
            found.push(path.clone());
        } else {
            bail!("Input not found: {}", path.display());
        }
    }
    if found.is_empty() {
        bail!("No JSON inputs found (expected *{} or *{})", ANALYSIS_SUFFIX, CODEBOOK_SUFFIX);
    }
    Ok(found)
}
