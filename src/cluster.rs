//! Subprocess cluster oracle.
//!
//! Texts are embedded, written to a handshake directory, and handed to an
//! external `clustering-<method>.py` script:
//!
//! ```text
//! <work_dir>/temp.bytes              little-endian f32, row-major
//! <work_dir>/clustering.temp.json    [{"Label": text, "Examples": []}, ...]
//! <python> <script_dir>/clustering-<method>.py <dims> <items> <params...>
//! ```
//!
//! The script runs with the parent of `work_dir` as its working directory
//! and prints `[[labels...], [probabilities...]]` as its last stdout line.
//! Only one run may use a handshake directory at a time; runs are
//! serialized through a process-wide lock per canonical directory. The
//! evaluation scripts in [`crate::evaluate`] share the same directory.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use qualcode_core::oracle::{clusters_from_assignments, ClusterOracle, Clusters};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::process::Command;
use tracing::{debug, info};

use crate::cache::SharedCache;
use crate::config::{ClusteringConfig, EmbeddingConfig};
use crate::embedding::{vec_to_blob, Embedder};

type DirLock = Arc<tokio::sync::Mutex<()>>;

static HANDSHAKE_LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, DirLock>>> = OnceLock::new();

/// Lock guarding one handshake directory. Creates the directory.
pub(crate) fn handshake_lock(dir: &Path) -> Result<DirLock> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create handshake dir: {}", dir.display()))?;
    let canonical = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve handshake dir: {}", dir.display()))?;
    let mut locks = HANDSHAKE_LOCKS
        .get_or_init(Default::default)
        .lock()
        .map_err(|_| anyhow!("handshake lock registry poisoned"))?;
    Ok(locks.entry(canonical).or_default().clone())
}

pub struct ProcessClusterOracle {
    embedder: Embedder,
    config: ClusteringConfig,
}

impl ProcessClusterOracle {
    pub fn new(embedder: Embedder, config: &ClusteringConfig) -> Self {
        Self {
            embedder,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl ClusterOracle for ProcessClusterOracle {
    async fn cluster(&self, texts: &[String], method: &str, params: &[String]) -> Result<Clusters> {
        if texts.is_empty() {
            return Ok(Clusters::new());
        }
        let vectors = self.embedder.embed(texts).await?;
        run_clustering(&self.config, texts, &vectors, method, params).await
    }
}

/// Clusterer used when `embedding.provider = "disabled"`.
pub struct DisabledClusterer;

#[async_trait]
impl ClusterOracle for DisabledClusterer {
    async fn cluster(&self, _texts: &[String], _method: &str, _params: &[String]) -> Result<Clusters> {
        bail!("Embedding provider is disabled; clustering stages need [embedding] configured")
    }
}

/// Build the clusterer selected by the config.
pub fn create_clusterer(
    embedding: &EmbeddingConfig,
    clustering: &ClusteringConfig,
    cache: Option<SharedCache>,
) -> Result<Box<dyn ClusterOracle>> {
    if !embedding.is_enabled() {
        return Ok(Box::new(DisabledClusterer));
    }
    let embedder = Embedder::new(embedding, cache)?;
    Ok(Box::new(ProcessClusterOracle::new(embedder, clustering)))
}

/// Write the handshake files, run the script, and parse its output.
pub async fn run_clustering(
    config: &ClusteringConfig,
    texts: &[String],
    vectors: &[Vec<f32>],
    method: &str,
    params: &[String],
) -> Result<Clusters> {
    let dir = &config.work_dir;
    let lock = handshake_lock(dir)?;
    let _guard = lock.lock().await;

    let dims = write_handshake(dir, texts, vectors)?;
    info!(method, items = texts.len(), dims, "running clustering script");
    let mut args = vec![dims.to_string(), texts.len().to_string()];
    args.extend(params.iter().cloned());
    let stdout = run_script(config, &format!("clustering-{}.py", method), &args).await?;
    let clusters = parse_cluster_output(&stdout, texts.len())?;
    debug!(clusters = clusters.len(), "clustering finished");
    Ok(clusters)
}

/// Run `<script_dir>/<script>` from the parent of the handshake dir and
/// return its stdout. Callers hold the handshake lock.
pub(crate) async fn run_script(config: &ClusteringConfig, script: &str, args: &[String]) -> Result<String> {
    let dir = &config.work_dir;
    let script = config.script_dir.join(script);
    if !script.exists() {
        bail!("Script not found: {}", script.display());
    }
    // the script resolves the handshake dir relative to its cwd
    let script = script.canonicalize()?;
    let cwd = dir
        .canonicalize()?
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("handshake dir has no parent: {}", dir.display()))?;

    let output = Command::new(&config.python)
        .arg(&script)
        .args(args)
        .current_dir(&cwd)
        .output()
        .await
        .with_context(|| format!("Failed to run {} {}", config.python, script.display()))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            script.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Write `vectors` to `temp.bytes`, returning the vector width.
pub(crate) fn write_vectors(dir: &Path, vectors: &[Vec<f32>]) -> Result<usize> {
    let dims = vectors.first().map_or(0, Vec::len);
    let mut bytes = Vec::with_capacity(dims * vectors.len() * 4);
    for vector in vectors {
        if vector.len() != dims {
            bail!("Ragged embeddings: {} and {} dimensions", dims, vector.len());
        }
        bytes.extend(vec_to_blob(vector));
    }
    std::fs::write(dir.join("temp.bytes"), bytes)?;
    Ok(dims)
}

/// Write `temp.bytes` and `clustering.temp.json`, returning the vector width.
pub fn write_handshake(dir: &Path, texts: &[String], vectors: &[Vec<f32>]) -> Result<usize> {
    if texts.len() != vectors.len() {
        bail!("{} texts but {} vectors", texts.len(), vectors.len());
    }
    let dims = write_vectors(dir, vectors)?;

    let entries: Vec<serde_json::Value> = texts
        .iter()
        .map(|text| serde_json::json!({"Label": text, "Examples": []}))
        .collect();
    std::fs::write(
        dir.join("clustering.temp.json"),
        serde_json::to_string(&entries)?,
    )?;
    Ok(dims)
}

/// Parse the last non-empty stdout line.
///
/// Accepts `[[labels], [probabilities]]`, or a bare `[labels]` array in
/// which case every probability is 1.
pub fn parse_cluster_output(stdout: &str, expected: usize) -> Result<Clusters> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("Clustering script produced no output"))?;
    let value: serde_json::Value = serde_json::from_str(line)
        .with_context(|| format!("Unparsable clustering output: {}", line))?;

    let (labels, probabilities): (Vec<i64>, Vec<f64>) = match value.as_array().map(Vec::as_slice) {
        Some([labels, probabilities]) if labels.is_array() => (
            serde_json::from_value(labels.clone())?,
            serde_json::from_value(probabilities.clone())?,
        ),
        Some(_) => {
            let labels: Vec<i64> = serde_json::from_value(value.clone())
                .context("Clustering output is neither [labels] nor [[labels], [probabilities]]")?;
            let probabilities = vec![1.0; labels.len()];
            (labels, probabilities)
        }
        None => bail!("Clustering output is not an array: {}", line),
    };
    if labels.len() != expected {
        bail!(
            "Clustering output has {} labels for {} items",
            labels.len(),
            expected
        );
    }
    clusters_from_assignments(&labels, &probabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qualcode_core::oracle::UNCLUSTERED;
    use tempfile::TempDir;

    #[test]
    fn parses_two_array_output_after_log_lines() {
        let stdout = "loading\nfitting hdbscan\n[[0, -1, 0], [0.9, 0.0, 0.7]]\n\n";
        let clusters = parse_cluster_output(stdout, 3).unwrap();
        assert_eq!(clusters[&0].len(), 2);
        assert_eq!(clusters[&UNCLUSTERED][0].index, 1);
        assert!((clusters[&0][1].probability - 0.7).abs() < 1e-9);
    }

    #[test]
    fn labels_only_output_gets_full_confidence() {
        let clusters = parse_cluster_output("[1, 1, 2]", 3).unwrap();
        assert_eq!(clusters[&1].len(), 2);
        assert_eq!(clusters[&2][0].probability, 1.0);
    }

    #[test]
    fn bad_output_is_an_error() {
        assert!(parse_cluster_output("", 1).is_err());
        assert!(parse_cluster_output("Traceback (most recent call last)", 1).is_err());
        assert!(parse_cluster_output("[[0, 1], [1.0]]", 2).is_err());
        assert!(parse_cluster_output("[0]", 2).is_err());
    }

    #[test]
    fn handshake_files_have_expected_layout() {
        let tmp = TempDir::new().unwrap();
        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let dims = write_handshake(tmp.path(), &texts, &vectors).unwrap();
        assert_eq!(dims, 3);

        let bytes = std::fs::read(tmp.path().join("temp.bytes")).unwrap();
        assert_eq!(bytes.len(), 2 * 3 * 4);
        assert_eq!(&bytes[12..16], &4.0f32.to_le_bytes());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(tmp.path().join("clustering.temp.json")).unwrap())
                .unwrap();
        assert_eq!(json[1]["Label"], "b");
        assert_eq!(json[1]["Examples"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn disabled_embedding_gives_failing_clusterer() {
        let clusterer =
            create_clusterer(&EmbeddingConfig::default(), &ClusteringConfig::default(), None).unwrap();
        assert!(clusterer.cluster(&["a".to_string()], "hdbscan", &[]).await.is_err());
    }

    #[test]
    fn ragged_vectors_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let texts = vec!["a".to_string(), "b".to_string()];
        assert!(write_handshake(tmp.path(), &texts, &[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_script_from_work_dir_parent() {
        let tmp = TempDir::new().unwrap();
        let scripts = tmp.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        // run with `sh`; checks the handshake file is reachable at ./known and
        // echoes the args
        std::fs::write(
            scripts.join("clustering-fake.py"),
            "test -f ./known/temp.bytes || exit 3\necho \"dims=$1 items=$2 extra=$3\"\necho '[[0, 0], [1.0, 0.5]]'\n",
        )
        .unwrap();
        let config = ClusteringConfig {
            python: "sh".into(),
            script_dir: scripts,
            work_dir: tmp.path().join("known"),
            method: "fake".into(),
            params: vec![],
        };
        let texts = vec!["x".to_string(), "y".to_string()];
        let vectors = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let clusters = run_clustering(&config, &texts, &vectors, "fake", &["0.5".to_string()])
            .await
            .unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[&0].len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_script_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("clustering-boom.py"), "echo oops >&2\nexit 1\n").unwrap();
        let config = ClusteringConfig {
            python: "sh".into(),
            script_dir: tmp.path().to_path_buf(),
            work_dir: tmp.path().join("known"),
            method: "boom".into(),
            params: vec![],
        };
        let err = run_clustering(&config, &["x".to_string()], &[vec![1.0]], "boom", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn missing_script_is_reported() {
        let tmp = TempDir::new().unwrap();
        let config = ClusteringConfig {
            script_dir: tmp.path().join("nowhere"),
            work_dir: tmp.path().join("known"),
            ..Default::default()
        };
        let err = run_clustering(&config, &["x".to_string()], &[vec![1.0]], "hdbscan", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("clustering-hdbscan.py"));
    }
}
