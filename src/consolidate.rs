//! Codebook consolidation runs.
//!
//! Wires the configured stages, survivor policy, clusterer, and oracle into
//! a [`ConsolidationPipeline`] and writes its artifacts:
//!
//! ```text
//! <run_dir>/consolidation/iteration-<n>.json   codebook after iteration n
//! <run_dir>/reference.json                     final reference codebook
//! <run_dir>/report.json                        iteration counts, warnings,
//!                                              and with --compare per-input coverage
//! <run_dir>/evaluation/                        plots from --evaluate
//! <run_dir>/<analysis>.relabeled.json          with --relabel
//! ```

use anyhow::{anyhow, bail, Result};
use qualcode_core::consolidation::{
    stage_by_name, Consolidated, ConsolidationPipeline, ConsolidationReport, MergeStage, RefineMerger, Snapshot,
    StageContext,
};
use qualcode_core::lineage::LabelLineage;
use qualcode_core::merge::policy_by_name;
use qualcode_core::models::{CodedThreads, Codebook};
use qualcode_core::oracle::{ClusterOracle, Oracle};
use qualcode_core::registry::{owner_coverage, relabel_threads, OwnerCoverage};
use qualcode_core::scheduler::ChunkScheduler;
use qualcode_core::CodingError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::cache::{open_configured, persist_shared};
use crate::cluster::create_clusterer;
use crate::config::Config;
use crate::dataset::{discover_inputs, load_analysis, load_codebook_input, save_json};
use crate::evaluate::{Evaluation, Evaluator};
use crate::oracle::{create_oracle, CachedOracle};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Build the configured pipeline. The refine stage gets the research
/// question from `[coding]`.
pub fn build_pipeline(config: &Config) -> Result<ConsolidationPipeline, CodingError> {
    let mut stages: Vec<Box<dyn MergeStage>> = Vec::new();
    for name in &config.consolidation.stages {
        let stage: Box<dyn MergeStage> = if name == "refine" {
            Box::new(RefineMerger {
                research_question: config.coding.research_question.clone().unwrap_or_default(),
            })
        } else {
            stage_by_name(name).ok_or_else(|| CodingError::config(format!("unknown stage '{}'", name)))?
        };
        stages.push(stage);
    }
    Ok(ConsolidationPipeline::new(stages)
        .with_limits(config.consolidation.max_iterations, config.consolidation.max_stage_loops))
}

pub fn snapshot_path(run_dir: &Path, iteration: usize) -> PathBuf {
    run_dir
        .join("consolidation")
        .join(format!("iteration-{}.json", iteration))
}

/// Consolidate `books` into one reference codebook.
///
/// Snapshots go under `run_dir` when given. The lineage is left holding
/// every label seen, for relabeling analyses afterwards.
#[allow(clippy::too_many_arguments)]
pub async fn consolidate_books(
    config: &Config,
    books: &[Codebook],
    compare: bool,
    clusterer: &dyn ClusterOracle,
    oracle: Option<&dyn Oracle>,
    lineage: &mut LabelLineage,
    run_dir: Option<&Path>,
    progress: Option<&dyn ProgressReporter>,
) -> Result<Consolidated> {
    let pipeline = build_pipeline(config)?;
    let policy = policy_by_name(&config.consolidation.survivor_policy).ok_or_else(|| {
        CodingError::config(format!(
            "unknown survivor policy '{}'",
            config.consolidation.survivor_policy
        ))
    })?;
    let mut ctx = StageContext {
        clusterer,
        oracle,
        policy: policy.as_ref(),
        lineage,
        scheduler: ChunkScheduler::new(config.consolidation.chunk_size, config.consolidation.retry_budget, 1),
        method: config.clustering.method.clone(),
        params: config.clustering.params.clone(),
        temperature: config.oracle.temperature,
    };

    let snapshot: Snapshot<'_> = Box::new(move |iteration: usize, book: &Codebook| {
        if let Some(dir) = run_dir {
            save_json(&snapshot_path(dir, iteration), book)?;
        }
        if let Some(progress) = progress {
            progress.report(ProgressEvent::Consolidating {
                iteration,
                codes: book.len() as u64,
            });
        }
        Ok(())
    });

    info!(stages = ?pipeline.stage_names(), books = books.len(), "starting consolidation");
    let consolidated = pipeline
        .consolidate_codebooks(books, compare, &mut ctx, Some(snapshot))
        .await?;
    for warning in &consolidated.report.warnings {
        warn!("{}", warning);
    }
    Ok(consolidated)
}

/// Rewrite an analysis through the lineage and save it next to the
/// reference codebook.
pub fn relabel_analysis(
    analysis_path: &Path,
    lineage: &mut LabelLineage,
    reference: &Codebook,
    run_dir: &Path,
) -> Result<PathBuf> {
    let mut analysis: CodedThreads = load_analysis(analysis_path)?;
    relabel_threads(&mut analysis, lineage, reference);
    let stem = analysis_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Analysis path has no file name: {}", analysis_path.display()))?;
    let stem = stem.strip_suffix(".analysis").unwrap_or(&stem);
    let out = run_dir.join(format!("{}.relabeled.json", stem));
    save_json(&out, &analysis)?;
    Ok(out)
}

/// Contents of `report.json`.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    /// Input names; with `--compare`, owner `i` is `inputs[i]`.
    pub inputs: Vec<String>,
    #[serde(flatten)]
    pub consolidation: &'a ConsolidationReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub coverage: Vec<OwnerCoverage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
}

/// Short name of a consolidation input: `out/forum.analysis.json` is `forum`.
pub fn input_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    [".analysis.json", ".codebook.json", ".json"]
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .map(str::to_string)
        .unwrap_or(name)
}

/// Options of `qc consolidate` beyond the inputs.
#[derive(Debug, Clone, Default)]
pub struct ConsolidateOptions<'a> {
    pub compare: bool,
    pub relabel: Option<&'a Path>,
    pub name: Option<&'a str>,
    /// Evaluation script method, e.g. `coverage`. Needs `compare`.
    pub evaluate: Option<&'a str>,
}

/// `qc consolidate`.
pub async fn run_consolidate(
    config: &Config,
    inputs: &[PathBuf],
    options: &ConsolidateOptions<'_>,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    if options.evaluate.is_some() && !options.compare {
        bail!("--evaluate needs --compare to know which input owns each code");
    }
    let files = discover_inputs(inputs)?;
    let mut books = Vec::with_capacity(files.len());
    for file in &files {
        let book = load_codebook_input(file)?;
        info!(path = %file.display(), codes = book.len(), "loaded codebook");
        books.push(book);
    }

    let cache = open_configured(&config.cache)?;
    let clusterer = create_clusterer(&config.embedding, &config.clustering, cache.clone())?;
    let oracle: Option<Box<dyn Oracle>> = if config.oracle.is_enabled() {
        let inner = create_oracle(&config.oracle)?;
        Some(match &cache {
            Some(cache) => Box::new(CachedOracle::new(inner, cache.clone())) as Box<dyn Oracle>,
            None => inner,
        })
    } else {
        None
    };

    let run_dir = match options.name {
        Some(name) => config.output.dir.join(name),
        None => config.output.dir.clone(),
    };
    let mut lineage = LabelLineage::new();
    let result = consolidate_books(
        config,
        &books,
        options.compare,
        clusterer.as_ref(),
        oracle.as_deref(),
        &mut lineage,
        Some(run_dir.as_path()),
        Some(progress),
    )
    .await;
    let consolidated = match result {
        Ok(consolidated) => consolidated,
        Err(e) => {
            if let Some(cache) = &cache {
                persist_shared(cache)?;
            }
            return Err(e);
        }
    };

    let names: Vec<String> = files.iter().map(|f| input_name(f)).collect();
    let coverage = if options.compare {
        owner_coverage(&consolidated.codebook, books.len())
    } else {
        Vec::new()
    };
    let evaluation = match options.evaluate {
        Some(method) => {
            let evaluator = Evaluator::new(&config.embedding, &config.clustering, cache.clone())?;
            Some(
                evaluator
                    .evaluate(&consolidated.codebook, &names, method, &run_dir.join("evaluation"))
                    .await?,
            )
        }
        None => None,
    };
    if let Some(cache) = &cache {
        persist_shared(cache)?;
    }

    let reference_path = run_dir.join("reference.json");
    save_json(&reference_path, &consolidated.codebook)?;
    let run_report = RunReport {
        inputs: names,
        consolidation: &consolidated.report,
        coverage,
        evaluation,
    };
    save_json(&run_dir.join("report.json"), &run_report)?;

    let relabeled = options
        .relabel
        .map(|path| relabel_analysis(path, &mut lineage, &consolidated.codebook, &run_dir))
        .transpose()?;

    let report = &consolidated.report;
    println!("consolidate");
    println!("  inputs: {}", files.len());
    println!("  codes: {} -> {}", report.input_codes, report.output_codes);
    println!("  iterations: {} (converged: {})", report.iterations, report.converged);
    println!("  warnings: {}", report.warnings.len());
    for row in &run_report.coverage {
        println!(
            "  coverage {}: {} codes, {} shared, {:.0}% of reference",
            run_report.inputs[row.owner],
            row.codes,
            row.shared,
            row.share * 100.0
        );
    }
    if let Some(evaluation) = &run_report.evaluation {
        println!("  evaluated: {} inputs", evaluation.len());
    }
    println!("  reference: {}", reference_path.display());
    if let Some(path) = relabeled {
        println!("  relabeled: {}", path.display());
    }
    println!("ok");
    Ok(())
}
