//! Dataset coding: runs every chunk of a dataset through a coding session.
//!
//! Threads are coded one after another. The analysis is written to disk
//! after every completed pass of a thread and again once the thread is
//! done, so an interrupted run can be resumed with `--prior`.

use anyhow::{bail, Result};
use qualcode_core::item_level::ItemLevelStrategy;
use qualcode_core::models::{CodedThread, CodedThreads, DataItem};
use qualcode_core::oracle::Oracle;
use qualcode_core::registry::dataset_codebook;
use qualcode_core::session::{code_thread, Checkpoint, SessionOptions};
use qualcode_core::strategy::CodingStrategy;
use qualcode_core::CodingError;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cache::{open_configured, persist_shared, SharedCache};
use crate::config::{CodingConfig, Config};
use crate::dataset::{load_analysis, load_dataset, save_json, Dataset};
use crate::export::write_items;
use crate::oracle::{create_oracle, CachedOracle};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Item-level strategy for `dataset`; config values override the dataset's.
pub fn strategy_for(dataset: &Dataset, config: &CodingConfig) -> ItemLevelStrategy {
    ItemLevelStrategy {
        research_question: config
            .research_question
            .clone()
            .or_else(|| dataset.research_question.clone())
            .unwrap_or_default(),
        coding_notes: config
            .coding_notes
            .clone()
            .or_else(|| dataset.coding_notes.clone())
            .unwrap_or_default(),
        allow_truncation: config.allow_truncation,
        prefetch: config.prefetch,
        postfetch: config.postfetch,
        iterations: config.iterations,
    }
}

/// Reject a prior analysis that does not belong to `dataset`.
fn check_prior(dataset: &Dataset, prior: &CodedThreads) -> Result<(), CodingError> {
    if prior.threads.len() > dataset.chunks.len() {
        return Err(CodingError::config(format!(
            "prior analysis has {} threads but the dataset has {} chunks",
            prior.threads.len(),
            dataset.chunks.len()
        )));
    }
    if let Some(unknown) = prior.threads.keys().find(|id| !dataset.chunks.contains_key(*id)) {
        return Err(CodingError::config(format!(
            "prior analysis thread '{}' is not a chunk of the dataset",
            unknown
        )));
    }
    Ok(())
}

/// Where and how often coding state is saved.
#[derive(Default)]
pub struct CodingSinks<'a> {
    /// Analysis checkpoint file.
    pub checkpoint: Option<&'a Path>,
    pub cache: Option<SharedCache>,
    pub progress: Option<&'a dyn ProgressReporter>,
}

/// Code every chunk of `dataset`, continuing from `prior` when given.
pub async fn code_dataset(
    dataset: &Dataset,
    oracle: &dyn Oracle,
    strategy: &dyn CodingStrategy,
    options: &SessionOptions,
    prior: Option<CodedThreads>,
    sinks: CodingSinks<'_>,
) -> Result<CodedThreads> {
    let mut analysis = match prior {
        Some(prior) => {
            check_prior(dataset, &prior)?;
            prior
        }
        None => CodedThreads::default(),
    };

    let total = dataset.chunks.len() as u64;
    for (n, (id, chunk)) in dataset.chunks.iter().enumerate() {
        if let Some(progress) = sinks.progress {
            progress.report(ProgressEvent::Coding {
                thread: id.clone(),
                n: n as u64 + 1,
                total,
            });
        }
        let items: Vec<DataItem> = chunk.flatten().into_iter().cloned().collect();
        let mut thread = analysis
            .threads
            .remove(id)
            .unwrap_or_else(|| CodedThread::new(id.clone()));

        let report = {
            let done = &analysis;
            let checkpoint: Option<Checkpoint<'_>> = match sinks.checkpoint {
                Some(path) => Some(Box::new(move |current: &CodedThread| {
                    let mut snapshot = done.clone();
                    snapshot.threads.insert(current.id.clone(), current.clone());
                    save_json(path, &snapshot)
                })),
                None => None,
            };
            code_thread(&mut thread, &items, oracle, strategy, options, checkpoint).await?
        };
        info!(
            thread = %id,
            items = items.len(),
            codes = thread.codes.len(),
            chunks = report.chunks,
            attempts = report.attempts,
            "thread coded"
        );

        analysis.threads.insert(id.clone(), thread);
        if let Some(path) = sinks.checkpoint {
            save_json(path, &analysis)?;
        }
        if let Some(cache) = &sinks.cache {
            persist_shared(cache)?;
        }
    }

    analysis.codebook = Some(dataset_codebook(&analysis));
    Ok(analysis)
}

/// Output file names for a run.
pub struct RunPaths {
    pub analysis: PathBuf,
    pub codebook: PathBuf,
    pub items: PathBuf,
}

impl RunPaths {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            analysis: dir.join(format!("{}.analysis.json", name)),
            codebook: dir.join(format!("{}.codebook.json", name)),
            items: dir.join(format!("{}.items.json", name)),
        }
    }
}

/// Run name from `--name` or the dataset file stem.
pub fn run_name(explicit: Option<&str>, input: &Path) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| input.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "run".to_string())
}

/// `qc code`.
pub async fn run_code(
    config: &Config,
    dataset_path: &Path,
    prior_path: Option<&Path>,
    name: Option<&str>,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    if !config.oracle.is_enabled() {
        bail!("Oracle provider is disabled; set [oracle] provider and model in the config");
    }
    let dataset = load_dataset(dataset_path)?;
    let prior = prior_path.map(load_analysis).transpose()?;
    let strategy = strategy_for(&dataset, &config.coding);
    let options = SessionOptions {
        chunk_size: config.coding.chunk_size,
        retry_budget: config.coding.retry_budget,
        temperature: config.oracle.temperature,
    };

    let cache = open_configured(&config.cache)?;
    let inner = create_oracle(&config.oracle)?;
    let oracle: Box<dyn Oracle> = match &cache {
        Some(cache) => Box::new(CachedOracle::new(inner, cache.clone())),
        None => inner,
    };

    let name = run_name(name, dataset_path);
    let paths = RunPaths::new(&config.output.dir, &name);
    let sinks = CodingSinks {
        checkpoint: Some(paths.analysis.as_path()),
        cache: cache.clone(),
        progress: Some(progress),
    };
    let analysis = code_dataset(&dataset, oracle.as_ref(), &strategy, &options, prior, sinks).await?;

    save_json(&paths.analysis, &analysis)?;
    let codebook = analysis.codebook.clone().unwrap_or_default();
    save_json(&paths.codebook, &codebook)?;
    let rows = write_items(&dataset, &analysis, Some(&paths.items))?;
    if let Some(cache) = &cache {
        persist_shared(cache)?;
    }

    println!("code {}", name);
    println!("  threads: {}", analysis.threads.len());
    println!("  items: {}", rows);
    println!("  codes: {}", codebook.len());
    println!("  analysis: {}", paths.analysis.display());
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_overrides_dataset_context() {
        let dataset = Dataset {
            research_question: Some("from dataset".into()),
            coding_notes: Some("notes".into()),
            ..Default::default()
        };
        let config = CodingConfig {
            research_question: Some("from config".into()),
            iterations: 2,
            ..Default::default()
        };
        let strategy = strategy_for(&dataset, &config);
        assert_eq!(strategy.research_question, "from config");
        assert_eq!(strategy.coding_notes, "notes");
        assert_eq!(strategy.iterations, 2);
    }

    #[test]
    fn prior_with_foreign_threads_is_a_config_error() {
        let mut prior = CodedThreads::default();
        prior.threads.insert("elsewhere".into(), CodedThread::new("elsewhere"));
        let err = check_prior(&Dataset::default(), &prior).unwrap_err();
        assert!(matches!(err, CodingError::Config(_)));
    }

    #[test]
    fn run_name_defaults_to_file_stem() {
        assert_eq!(run_name(None, Path::new("data/forum.json")), "forum");
        assert_eq!(run_name(Some("pilot"), Path::new("data/forum.json")), "pilot");
        let paths = RunPaths::new(Path::new("out"), "pilot");
        assert_eq!(paths.codebook, Path::new("out/pilot.codebook.json"));
    }
}
