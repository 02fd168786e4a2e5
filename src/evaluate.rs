//! Codebook evaluation against a comparison-mode reference.
//!
//! Shares the handshake directory (and its lock) with [`crate::cluster`]:
//!
//! ```text
//! <work_dir>/temp.bytes              one vector per reference code
//! <work_dir>/evaluation.temp.json    {"OwnerLabels": [...], "Labels": [{"Label", "Owners"}]}
//! <python> <script_dir>/evaluation-<method>.py <dims> <items> <owners> false <output_dir>
//! ```
//!
//! Owner 0 is the reference itself; input codebook `i` is owner `i + 1`.
//! The script writes its plots to `output_dir` and prints a JSON object of
//! metrics keyed by owner index as its last stdout line.

use anyhow::{anyhow, bail, Context, Result};
use qualcode_core::models::{Code, Codebook};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::cache::SharedCache;
use crate::cluster::{handshake_lock, run_script, write_vectors};
use crate::config::{ClusteringConfig, EmbeddingConfig};
use crate::embedding::Embedder;

pub const REFERENCE_OWNER: &str = "reference";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EvaluationLabel {
    pub label: String,
    pub owners: Vec<usize>,
}

/// Contents of `evaluation.temp.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EvaluationInput {
    pub owner_labels: Vec<String>,
    pub labels: Vec<EvaluationLabel>,
}

/// Metrics per input codebook name. Metrics the script could not compute
/// are `None`.
pub type Evaluation = BTreeMap<String, BTreeMap<String, Option<f64>>>;

/// Text embedded for a reference code.
fn code_text(code: &Code) -> String {
    match code.first_definition() {
        Some(definition) => format!("{}: {}", code.label, definition),
        None => code.label.clone(),
    }
}

/// Build the handshake payload from a reference whose codes carry owners.
pub fn evaluation_input(reference: &Codebook, inputs: &[String]) -> EvaluationInput {
    let mut owner_labels = Vec::with_capacity(inputs.len() + 1);
    owner_labels.push(REFERENCE_OWNER.to_string());
    owner_labels.extend(inputs.iter().cloned());
    let labels = reference
        .values()
        .filter(|code| !code.is_merged())
        .map(|code| EvaluationLabel {
            label: code_text(code),
            owners: std::iter::once(0)
                .chain(code.owners.iter().map(|owner| owner + 1))
                .collect(),
        })
        .collect();
    EvaluationInput { owner_labels, labels }
}

/// Write `temp.bytes` and `evaluation.temp.json`, returning the vector width.
pub fn write_evaluation_handshake(dir: &Path, input: &EvaluationInput, vectors: &[Vec<f32>]) -> Result<usize> {
    if input.labels.len() != vectors.len() {
        bail!("{} labels but {} vectors", input.labels.len(), vectors.len());
    }
    let dims = write_vectors(dir, vectors)?;
    std::fs::write(dir.join("evaluation.temp.json"), serde_json::to_string(input)?)?;
    Ok(dims)
}

/// Parse the last non-empty stdout line into metrics keyed by owner name.
///
/// Python's `NaN` and `Infinity` literals are read as missing values.
pub fn parse_evaluation_output(stdout: &str, owner_labels: &[String]) -> Result<Evaluation> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("Evaluation script produced no output"))?;
    let line = line
        .replace("-Infinity", "null")
        .replace("Infinity", "null")
        .replace("NaN", "null");
    let raw: BTreeMap<String, BTreeMap<String, Option<f64>>> =
        serde_json::from_str(&line).with_context(|| format!("Unparsable evaluation output: {}", line))?;

    let mut evaluation = Evaluation::new();
    for (key, metrics) in raw {
        let name = key
            .parse::<usize>()
            .ok()
            .and_then(|owner| owner_labels.get(owner))
            .ok_or_else(|| anyhow!("Evaluation output names unknown owner '{}'", key))?;
        evaluation.insert(name.clone(), metrics);
    }
    Ok(evaluation)
}

/// Write the handshake, run `evaluation-<method>.py`, and parse its output.
pub async fn run_evaluation(
    config: &ClusteringConfig,
    input: &EvaluationInput,
    vectors: &[Vec<f32>],
    method: &str,
    output_dir: &Path,
) -> Result<Evaluation> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let output_dir = output_dir.canonicalize()?;

    let dir = &config.work_dir;
    let lock = handshake_lock(dir)?;
    let _guard = lock.lock().await;

    let dims = write_evaluation_handshake(dir, input, vectors)?;
    info!(method, labels = input.labels.len(), owners = input.owner_labels.len(), "running evaluation script");
    let args = vec![
        dims.to_string(),
        input.labels.len().to_string(),
        input.owner_labels.len().to_string(),
        "false".to_string(),
        output_dir.display().to_string(),
    ];
    let stdout = run_script(config, &format!("evaluation-{}.py", method), &args).await?;
    let evaluation = parse_evaluation_output(&stdout, &input.owner_labels)?;
    debug!(owners = evaluation.len(), "evaluation finished");
    Ok(evaluation)
}

/// Embeds reference codes and hands them to the evaluation scripts.
pub struct Evaluator {
    embedder: Embedder,
    config: ClusteringConfig,
}

impl Evaluator {
    pub fn new(embedding: &EmbeddingConfig, clustering: &ClusteringConfig, cache: Option<SharedCache>) -> Result<Self> {
        if !embedding.is_enabled() {
            bail!("Embedding provider is disabled; evaluation needs [embedding] configured");
        }
        Ok(Self {
            embedder: Embedder::new(embedding, cache)?,
            config: clustering.clone(),
        })
    }

    /// Evaluate each input codebook against `reference`. Plots go to
    /// `output_dir`.
    pub async fn evaluate(
        &self,
        reference: &Codebook,
        inputs: &[String],
        method: &str,
        output_dir: &Path,
    ) -> Result<Evaluation> {
        let input = evaluation_input(reference, inputs);
        if input.labels.is_empty() {
            bail!("Reference codebook is empty; nothing to evaluate");
        }
        let texts: Vec<String> = input.labels.iter().map(|l| l.label.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        run_evaluation(&self.config, &input, &vectors, method, output_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qualcode_core::registry::merge_codebooks;
    use tempfile::TempDir;

    fn reference() -> Codebook {
        let mut a = Codebook::new();
        a.insert("greeting".into(), Code::new("greeting"));
        let mut b = Codebook::new();
        let mut greeting = Code::new("greeting");
        greeting.add_definition("Saying hello");
        b.insert("greeting".into(), greeting);
        b.insert("thanks".into(), Code::new("thanks"));
        merge_codebooks(&[a, b], true)
    }

    #[test]
    fn input_puts_reference_first_and_shifts_owners() {
        let input = evaluation_input(&reference(), &["alice".into(), "bob".into()]);
        assert_eq!(input.owner_labels, vec!["reference", "alice", "bob"]);
        assert_eq!(
            input.labels,
            vec![
                EvaluationLabel {
                    label: "greeting: Saying hello".into(),
                    owners: vec![0, 1, 2],
                },
                EvaluationLabel {
                    label: "thanks".into(),
                    owners: vec![0, 2],
                },
            ]
        );
    }

    #[test]
    fn handshake_files_have_expected_layout() {
        let tmp = TempDir::new().unwrap();
        let input = evaluation_input(&reference(), &["alice".into(), "bob".into()]);
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let dims = write_evaluation_handshake(tmp.path(), &input, &vectors).unwrap();
        assert_eq!(dims, 2);
        assert_eq!(std::fs::read(tmp.path().join("temp.bytes")).unwrap().len(), 2 * 2 * 4);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(tmp.path().join("evaluation.temp.json")).unwrap())
                .unwrap();
        assert_eq!(json["OwnerLabels"], serde_json::json!(["reference", "alice", "bob"]));
        assert_eq!(json["Labels"][1]["Label"], "thanks");
        assert_eq!(json["Labels"][1]["Owners"], serde_json::json!([0, 2]));

        assert!(write_evaluation_handshake(tmp.path(), &input, &vectors[..1]).is_err());
    }

    #[test]
    fn output_is_keyed_by_owner_name() {
        let owners = vec!["reference".to_string(), "alice".to_string(), "bob".to_string()];
        let stdout = "Owners: 3 , Visualize: False\n\
                      {\"1\": {\"Spread\": 0.8, \"Novelty\": NaN}, \"2\": {\"Spread\": 1.0, \"Novelty\": 0.5}}\n";
        let evaluation = parse_evaluation_output(stdout, &owners).unwrap();
        assert_eq!(evaluation["alice"]["Spread"], Some(0.8));
        assert_eq!(evaluation["alice"]["Novelty"], None);
        assert_eq!(evaluation["bob"]["Novelty"], Some(0.5));

        assert!(parse_evaluation_output("{\"7\": {}}", &owners).is_err());
        assert!(parse_evaluation_output("Traceback", &owners).is_err());
    }

    #[tokio::test]
    async fn disabled_embedding_cannot_evaluate() {
        let err = Evaluator::new(&EmbeddingConfig::default(), &ClusteringConfig::default(), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("evaluation"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_script_with_owner_count_and_output_dir() {
        let tmp = TempDir::new().unwrap();
        let scripts = tmp.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        // run with `sh`; fails unless the handshake is at ./known and the
        // owner count is passed through
        std::fs::write(
            scripts.join("evaluation-fake.py"),
            "test -f ./known/evaluation.temp.json || exit 3\ntest \"$3\" = 3 || exit 4\n\
             test -d \"$5\" || exit 5\necho '{\"1\": {\"Spread\": 1.0}, \"2\": {\"Spread\": 0.5}}'\n",
        )
        .unwrap();
        let config = ClusteringConfig {
            python: "sh".into(),
            script_dir: scripts,
            work_dir: tmp.path().join("known"),
            ..Default::default()
        };
        let input = evaluation_input(&reference(), &["alice".into(), "bob".into()]);
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let evaluation = run_evaluation(&config, &input, &vectors, "fake", &tmp.path().join("plots"))
            .await
            .unwrap();
        assert_eq!(evaluation["bob"]["Spread"], Some(0.5));
        assert!(tmp.path().join("plots").is_dir());
    }
}
