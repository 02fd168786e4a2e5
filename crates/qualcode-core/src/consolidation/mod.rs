//! Codebook consolidation pipeline.
//!
//! Runs an ordered list of [`MergeStage`]s over a working list of codes.
//! One iteration runs every stage once (looping stages repeat until they
//! stop merging), then compacts the codebook and checks that no input label
//! went missing. Iterations stop at `max_iterations` or as soon as one of
//! them leaves the live labels unchanged.

mod stages;

pub use stages::{stage_by_name, DefinitionMerger, RefineMerger, SimpleMerger};

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CodingError;
use crate::lineage::LabelLineage;
use crate::merge::{compact_codes, SurvivorPolicy};
use crate::models::{Code, Codebook};
use crate::oracle::{ClusterOracle, Oracle};
use crate::registry::merge_codebooks;
use crate::scheduler::ChunkScheduler;

/// Receives the codebook after every iteration.
pub type Snapshot<'a> = Box<dyn FnMut(usize, &Codebook) -> anyhow::Result<()> + Send + 'a>;

/// Collaborators and settings shared by every stage of a run.
pub struct StageContext<'a> {
    pub clusterer: &'a dyn ClusterOracle,
    /// Needed by chunkified stages only.
    pub oracle: Option<&'a dyn Oracle>,
    pub policy: &'a dyn SurvivorPolicy,
    pub lineage: &'a mut LabelLineage,
    /// Drives chunkified stages. Its iteration count should be 1.
    pub scheduler: ChunkScheduler,
    /// Clustering method and extra parameters passed to the clusterer.
    pub method: String,
    pub params: Vec<String>,
    pub temperature: f32,
}

/// One reduction step of the pipeline.
#[async_trait]
pub trait MergeStage: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the stage sends codes through the oracle in chunks.
    fn chunkified(&self) -> bool {
        false
    }

    /// Whether the stage repeats until it stops reducing the codebook.
    fn looping(&self) -> bool {
        false
    }

    /// Whether a live code takes part in this stage.
    fn subunit_filter(&self, _code: &Code) -> bool {
        true
    }

    /// Main work of the stage. `eligible` indexes live, filtered codes.
    async fn preprocess(
        &self,
        ctx: &mut StageContext<'_>,
        codes: &mut Vec<Code>,
        eligible: &[usize],
    ) -> Result<(), CodingError>;

    /// Oracle-driven work for chunkified stages.
    async fn process_chunks(
        &self,
        _ctx: &mut StageContext<'_>,
        _codes: &mut Vec<Code>,
        _eligible: &[usize],
    ) -> Result<(), CodingError> {
        Ok(())
    }
}

/// An input label that no surviving code accounts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataLossWarning {
    pub iteration: usize,
    pub label: String,
}

impl fmt::Display for DataLossWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label '{}' lost in iteration {}", self.label, self.iteration)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    pub iterations: usize,
    pub input_codes: usize,
    pub output_codes: usize,
    /// An iteration left the live labels unchanged.
    pub converged: bool,
    pub warnings: Vec<DataLossWarning>,
}

/// Output of a pipeline run.
#[derive(Debug, Clone)]
pub struct Consolidated {
    pub codebook: Codebook,
    pub report: ConsolidationReport,
}

/// Ordered merge stages plus iteration limits.
pub struct ConsolidationPipeline {
    stages: Vec<Box<dyn MergeStage>>,
    pub max_iterations: usize,
    pub max_stage_loops: usize,
}

impl ConsolidationPipeline {
    pub fn new(stages: Vec<Box<dyn MergeStage>>) -> Self {
        Self {
            stages,
            max_iterations: 5,
            max_stage_loops: 10,
        }
    }

    /// Build a pipeline from stage names such as `["simple", "refine"]`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, CodingError> {
        let mut stages = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let stage = stage_by_name(name).ok_or_else(|| CodingError::config(format!("unknown stage '{}'", name)))?;
            stages.push(stage);
        }
        Ok(Self::new(stages))
    }

    pub fn with_limits(mut self, max_iterations: usize, max_stage_loops: usize) -> Self {
        self.max_iterations = max_iterations;
        self.max_stage_loops = max_stage_loops;
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Fold several codebooks and consolidate the result.
    ///
    /// With `compare`, each code records the indices of the codebooks that
    /// contributed to it.
    pub async fn consolidate_codebooks(
        &self,
        books: &[Codebook],
        compare: bool,
        ctx: &mut StageContext<'_>,
        snapshot: Option<Snapshot<'_>>,
    ) -> Result<Consolidated, CodingError> {
        let merged = merge_codebooks(books, compare);
        info!(books = books.len(), codes = merged.len(), compare, "consolidating codebooks");
        self.run(merged, ctx, snapshot).await
    }

    /// Consolidate one codebook.
    pub async fn run(
        &self,
        input: Codebook,
        ctx: &mut StageContext<'_>,
        mut snapshot: Option<Snapshot<'_>>,
    ) -> Result<Consolidated, CodingError> {
        if self.max_iterations == 0 || self.max_stage_loops == 0 {
            return Err(CodingError::config("consolidation needs at least one iteration and one stage pass"));
        }

        let input_labels: BTreeSet<String> = input.keys().cloned().collect();
        for code in input.values() {
            ctx.lineage.insert(&code.label);
            for alternative in &code.alternatives {
                ctx.lineage.union(&code.label, alternative);
            }
        }

        let mut report = ConsolidationReport {
            input_codes: input.len(),
            ..Default::default()
        };
        let mut codes: Vec<Code> = input.into_values().filter(|c| !c.is_merged()).collect();
        let mut codebook = Codebook::new();

        for iteration in 0..self.max_iterations {
            for code in codes.iter_mut() {
                code.old_labels.clear();
            }
            let before: BTreeSet<String> = codes.iter().map(|c| c.label.clone()).collect();

            for stage in &self.stages {
                self.run_stage(stage.as_ref(), ctx, &mut codes, iteration).await?;
            }

            codebook = compact_codes(&mut codes, ctx.lineage);
            codes = codebook.values().cloned().collect();
            report.iterations = iteration + 1;

            for warning in sanity_check(iteration, &input_labels, &codebook) {
                warn!(iteration, label = %warning.label, "input label missing from consolidated codebook");
                report.warnings.push(warning);
            }

            if let Some(snapshot) = snapshot.as_mut() {
                snapshot(iteration, &codebook).map_err(|e| CodingError::Checkpoint(format!("{:#}", e)))?;
            }

            info!(iteration, before = before.len(), after = codebook.len(), "consolidation iteration done");
            let after: BTreeSet<&String> = codebook.keys().collect();
            if after.len() == before.len() && after.into_iter().eq(before.iter()) {
                report.converged = true;
                break;
            }
        }

        report.output_codes = codebook.len();
        Ok(Consolidated { codebook, report })
    }

    async fn run_stage(
        &self,
        stage: &dyn MergeStage,
        ctx: &mut StageContext<'_>,
        codes: &mut Vec<Code>,
        iteration: usize,
    ) -> Result<(), CodingError> {
        let mut passes = 0;
        loop {
            passes += 1;
            let eligible: Vec<usize> = codes
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.is_merged() && stage.subunit_filter(c))
                .map(|(i, _)| i)
                .collect();
            let live_before = live_count(codes);
            if eligible.is_empty() {
                debug!(stage = stage.name(), iteration, "no eligible codes");
                return Ok(());
            }

            stage.preprocess(ctx, codes, &eligible).await?;
            if stage.chunkified() {
                stage.process_chunks(ctx, codes, &eligible).await?;
            }

            let live_after = live_count(codes);
            info!(
                stage = stage.name(),
                iteration,
                pass = passes,
                eligible = eligible.len(),
                before = live_before,
                after = live_after,
                "stage pass done"
            );
            let stopping = live_after == live_before;
            if !stage.looping() || stopping || passes >= self.max_stage_loops {
                return Ok(());
            }
        }
    }
}

fn live_count(codes: &[Code]) -> usize {
    codes.iter().filter(|c| !c.is_merged()).count()
}

/// Every input label must be a live key or be recorded in some surviving
/// code's alternatives or old labels.
pub fn sanity_check(iteration: usize, input_labels: &BTreeSet<String>, codebook: &Codebook) -> Vec<DataLossWarning> {
    let mut accounted: BTreeSet<&str> = BTreeSet::new();
    for code in codebook.values() {
        accounted.insert(code.label.as_str());
        accounted.extend(code.alternatives.iter().map(String::as_str));
        accounted.extend(code.old_labels.iter().map(String::as_str));
    }
    input_labels
        .iter()
        .filter(|label| !accounted.contains(label.as_str()))
        .map(|label| DataLossWarning {
            iteration,
            label: label.clone(),
        })
        .collect()
}
