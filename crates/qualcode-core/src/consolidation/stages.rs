//! Built-in merge stages.

use std::fmt::Write as _;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{MergeStage, StageContext};
use crate::error::CodingError;
use crate::lineage::LabelLineage;
use crate::merge::merge_clusters;
use crate::models::{Code, MERGED_LABEL};
use crate::oracle::Oracle;
use crate::registry::normalize_label;
use crate::scheduler::{shrinking_window, Chunk, ChunkSize, ChunkVisitor};
use crate::strategy::{normalize_lines, numbered_line};

/// Look up a stage by its configuration name.
pub fn stage_by_name(name: &str) -> Option<Box<dyn MergeStage>> {
    match name {
        "simple" => Some(Box::new(SimpleMerger)),
        "definition" => Some(Box::new(DefinitionMerger)),
        "refine" => Some(Box::new(RefineMerger::default())),
        _ => None,
    }
}

/// Cluster `texts` (parallel to `eligible`) and merge each cluster.
async fn cluster_and_merge(
    ctx: &mut StageContext<'_>,
    codes: &mut [Code],
    eligible: &[usize],
    texts: Vec<String>,
) -> Result<usize, CodingError> {
    if texts.len() < 2 {
        return Ok(0);
    }
    let clusters = ctx.clusterer.cluster(&texts, &ctx.method, &ctx.params).await?;
    debug!(texts = texts.len(), clusters = clusters.len(), "clustered codes");
    Ok(merge_clusters(codes, eligible, &clusters, ctx.policy, ctx.lineage))
}

/// Merges codes whose labels cluster together.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleMerger;

#[async_trait]
impl MergeStage for SimpleMerger {
    fn name(&self) -> &str {
        "simple"
    }

    fn looping(&self) -> bool {
        true
    }

    async fn preprocess(
        &self,
        ctx: &mut StageContext<'_>,
        codes: &mut Vec<Code>,
        eligible: &[usize],
    ) -> Result<(), CodingError> {
        let texts = eligible.iter().map(|&i| codes[i].label.clone()).collect();
        let merged = cluster_and_merge(ctx, codes, eligible, texts).await?;
        debug!(merged, "label merge");
        Ok(())
    }
}

/// Merges defined codes whose `label: definition` texts cluster together.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefinitionMerger;

#[async_trait]
impl MergeStage for DefinitionMerger {
    fn name(&self) -> &str {
        "definition"
    }

    fn looping(&self) -> bool {
        true
    }

    fn subunit_filter(&self, code: &Code) -> bool {
        code.first_definition().is_some()
    }

    async fn preprocess(
        &self,
        ctx: &mut StageContext<'_>,
        codes: &mut Vec<Code>,
        eligible: &[usize],
    ) -> Result<(), CodingError> {
        let texts = eligible
            .iter()
            .map(|&i| format!("{}: {}", codes[i].label, codes[i].first_definition().unwrap_or_default()))
            .collect();
        let merged = cluster_and_merge(ctx, codes, eligible, texts).await?;
        debug!(merged, "definition merge");
        Ok(())
    }
}

/// Asks the oracle to rewrite every code that has gathered several
/// definitions into one label and one definition.
#[derive(Debug, Clone, Default)]
pub struct RefineMerger {
    /// Research context shown to the oracle.
    pub research_question: String,
}

#[async_trait]
impl MergeStage for RefineMerger {
    fn name(&self) -> &str {
        "refine"
    }

    fn chunkified(&self) -> bool {
        true
    }

    fn subunit_filter(&self, code: &Code) -> bool {
        code.definitions.len() > 1
    }

    async fn preprocess(
        &self,
        _ctx: &mut StageContext<'_>,
        _codes: &mut Vec<Code>,
        _eligible: &[usize],
    ) -> Result<(), CodingError> {
        Ok(())
    }

    async fn process_chunks(
        &self,
        ctx: &mut StageContext<'_>,
        codes: &mut Vec<Code>,
        eligible: &[usize],
    ) -> Result<(), CodingError> {
        let Some(oracle) = ctx.oracle else {
            warn!("refine stage needs an oracle, skipping");
            return Ok(());
        };
        let mut session = RefineSession {
            codes,
            lineage: &mut *ctx.lineage,
            oracle,
            temperature: ctx.temperature,
            research_question: &self.research_question,
            renamed: 0,
        };
        let report = ctx.scheduler.run(eligible, &mut session).await?;
        info!(codes = eligible.len(), chunks = report.chunks, renamed = session.renamed, "refined definitions");
        Ok(())
    }
}

/// Chunk visitor over code indices for [`RefineMerger`].
struct RefineSession<'a> {
    codes: &'a mut Vec<Code>,
    lineage: &'a mut LabelLineage,
    oracle: &'a dyn Oracle,
    temperature: f32,
    research_question: &'a str,
    renamed: usize,
}

impl RefineSession<'_> {
    fn prompts(&self, indices: &[usize]) -> (String, String) {
        let mut system = String::from(
            "You are an expert in qualitative research. Each code below has collected several \
             definitions. Write one concise label and one definition that covers all of them.\n",
        );
        if !self.research_question.trim().is_empty() {
            let _ = writeln!(system, "\nResearch question: {}", self.research_question.trim());
        }
        let _ = write!(
            system,
            "\nAnswer with exactly {} entries in this format:\n\
             1. label: <label>\n\
             definition: <definition>\n",
            indices.len()
        );

        let mut user = String::new();
        for (n, &i) in indices.iter().enumerate() {
            let code = &self.codes[i];
            let _ = writeln!(user, "{}. {}", n + 1, code.label);
            for definition in &code.definitions {
                let _ = writeln!(user, "- {}", definition);
            }
        }
        (system, user)
    }

    fn apply(&mut self, index: usize, label: String, definition: String) {
        let code = &mut self.codes[index];
        if label != code.label {
            let old = std::mem::replace(&mut code.label, label);
            code.alternatives.insert(old.clone());
            code.old_labels.insert(old.clone());
            code.alternatives.remove(&code.label);
            self.lineage.rename(&old, &code.label);
            debug!(old = %old, new = %code.label, "relabeled code");
            self.renamed += 1;
        }
        code.definitions = vec![definition];
    }
}

fn strip_key<'l>(line: &'l str, key: &str) -> Option<&'l str> {
    let (head, rest) = line.split_once(':')?;
    head.trim().eq_ignore_ascii_case(key).then(|| rest.trim())
}

/// Parse `N. label: ...` / `definition: ...` pairs.
fn parse_refinements(lines: &[String], expected: usize) -> Result<Vec<(String, String)>, CodingError> {
    let mut entries: Vec<(usize, Option<String>, Vec<String>)> = Vec::new();
    for line in lines {
        if let Some((index, rest)) = numbered_line(line) {
            let label = strip_key(rest, "label").unwrap_or(rest);
            entries.push((index, normalize_label(label), Vec::new()));
        } else if let Some(entry) = entries.last_mut() {
            match strip_key(line, "definition") {
                Some(text) => entry.2.push(text.to_string()),
                None if !entry.2.is_empty() => entry.2.push(line.clone()),
                None => {}
            }
        }
    }

    if entries.len() != expected {
        return Err(CodingError::invalid(format!(
            "expected {} refined code(s), got {}",
            expected,
            entries.len()
        )));
    }
    let mut refined = Vec::with_capacity(expected);
    for (n, (index, label, definition)) in entries.into_iter().enumerate() {
        if index != n + 1 {
            return Err(CodingError::invalid(format!("entry {} is numbered {}", n + 1, index)));
        }
        let label = label.ok_or_else(|| CodingError::invalid(format!("entry {} has no label", index)))?;
        if label == MERGED_LABEL {
            return Err(CodingError::invalid(format!("entry {} uses the reserved label {}", index, MERGED_LABEL)));
        }
        let definition = definition.join(" ");
        if definition.is_empty() {
            return Err(CodingError::invalid(format!("entry {} has no definition", index)));
        }
        refined.push((label, definition));
    }
    Ok(refined)
}

#[async_trait]
impl<'a> ChunkVisitor<usize> for RefineSession<'a> {
    fn chunk_size(&self, recommended: usize, _remaining: usize, _iteration: usize, tries: usize) -> ChunkSize {
        ChunkSize::fixed(shrinking_window(recommended, tries))
    }

    async fn action(&mut self, chunk: Chunk<'_, usize>) -> Result<isize, CodingError> {
        let indices = chunk.coded();
        let (system, user) = self.prompts(indices);
        let temperature = (self.temperature + 0.2 * chunk.tries as f32).min(1.0);
        let response = self.oracle.ask(&system, &user, temperature).await?;
        let refined = parse_refinements(&normalize_lines(&response), indices.len())?;
        for (&index, (label, definition)) in indices.iter().zip(refined) {
            self.apply(index, label, definition);
        }
        Ok(0)
    }
}
