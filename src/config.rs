//! TOML configuration.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! [`load_config`] parses the file and rejects values the engine cannot run
//! with before any oracle is contacted.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub coding: CodingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Chat model used for coding and definition refinement.
#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL. Defaults to the provider's public endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CodingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub allow_truncation: bool,
    #[serde(default)]
    pub prefetch: usize,
    #[serde(default)]
    pub postfetch: usize,
    /// Overrides the dataset's research question.
    #[serde(default)]
    pub research_question: Option<String>,
    #[serde(default)]
    pub coding_notes: Option<String>,
}

impl Default for CodingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            retry_budget: default_retry_budget(),
            iterations: default_iterations(),
            allow_truncation: false,
            prefetch: 0,
            postfetch: 0,
            research_question: None,
            coding_notes: None,
        }
    }
}

/// External clustering scripts.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_python")]
    pub python: String,
    /// Directory holding `clustering-<method>.py`.
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,
    /// Handshake directory shared with the scripts. Must be named `known`;
    /// the scripts run from its parent.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            script_dir: default_script_dir(),
            work_dir: default_work_dir(),
            method: default_method(),
            params: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsolidationConfig {
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_stage_loops")]
    pub max_stage_loops: usize,
    #[serde(default = "default_survivor_policy")]
    pub survivor_policy: String,
    /// Codes per oracle call in the refine stage.
    #[serde(default = "default_refine_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            max_iterations: default_max_iterations(),
            max_stage_loops: default_max_stage_loops(),
            survivor_policy: default_survivor_policy(),
            chunk_size: default_refine_chunk_size(),
            retry_budget: default_retry_budget(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_cache_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.5
}
fn default_max_retries() -> u32 {
    5
}
fn default_oracle_timeout_secs() -> u64 {
    120
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    64
}
fn default_chunk_size() -> usize {
    32
}
fn default_retry_budget() -> usize {
    4
}
fn default_iterations() -> usize {
    1
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_script_dir() -> PathBuf {
    PathBuf::from("scripts")
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("known")
}
fn default_method() -> String {
    "hdbscan".to_string()
}
fn default_stages() -> Vec<String> {
    vec!["simple".to_string(), "definition".to_string(), "refine".to_string()]
}
fn default_max_iterations() -> usize {
    5
}
fn default_max_stage_loops() -> usize {
    10
}
fn default_survivor_policy() -> String {
    "confidence".to_string()
}
fn default_refine_chunk_size() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_cache_path() -> PathBuf {
    PathBuf::from(".qualcode/cache.json")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings the scheduler or pipeline cannot run with.
pub fn validate(config: &Config) -> Result<()> {
    for (section, provider) in [
        ("oracle", config.oracle.provider.as_str()),
        ("embedding", config.embedding.provider.as_str()),
    ] {
        match provider {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown {} provider: '{}'. Must be disabled, openai, or ollama.",
                section,
                other
            ),
        }
    }

    if config.oracle.is_enabled() && config.oracle.model.is_none() {
        bail!(
            "oracle.model must be specified when provider is '{}'",
            config.oracle.provider
        );
    }
    if !(0.0..=2.0).contains(&config.oracle.temperature) {
        bail!("oracle.temperature must be in [0.0, 2.0]");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    if config.coding.chunk_size == 0 {
        bail!("coding.chunk_size must be > 0");
    }
    if config.coding.iterations == 0 {
        bail!("coding.iterations must be > 0");
    }

    let consolidation = &config.consolidation;
    if consolidation.max_iterations == 0 {
        bail!("consolidation.max_iterations must be > 0");
    }
    if consolidation.max_stage_loops == 0 {
        bail!("consolidation.max_stage_loops must be > 0");
    }
    if consolidation.chunk_size == 0 {
        bail!("consolidation.chunk_size must be > 0");
    }
    for stage in &consolidation.stages {
        if qualcode_core::consolidation::stage_by_name(stage).is_none() {
            bail!(
                "Unknown consolidation stage: '{}'. Must be simple, definition, or refine.",
                stage
            );
        }
    }
    // The scripts read `./known/` relative to their working directory.
    if config.clustering.work_dir.file_name().and_then(|n| n.to_str()) != Some("known") {
        bail!(
            "clustering.work_dir must be a directory named 'known', got '{}'",
            config.clustering.work_dir.display()
        );
    }

    if qualcode_core::merge::policy_by_name(&consolidation.survivor_policy).is_none() {
        bail!(
            "Unknown survivor policy: '{}'. Must be confidence or examples.",
            consolidation.survivor_policy
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("qc.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn empty_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&write(&tmp, "")).unwrap();
        assert_eq!(config.coding.chunk_size, 32);
        assert_eq!(config.coding.retry_budget, 4);
        assert_eq!(config.consolidation.stages, vec!["simple", "definition", "refine"]);
        assert_eq!(config.consolidation.survivor_policy, "confidence");
        assert!(!config.oracle.is_enabled());
        assert!(config.cache.enabled);
        assert_eq!(config.output.dir, PathBuf::from("out"));
    }

    #[test]
    fn full_file_parses() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&write(
            &tmp,
            r#"
[oracle]
provider = "ollama"
model = "llama3"
temperature = 0.2

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768

[coding]
chunk_size = 16
allow_truncation = true
prefetch = 2

[clustering]
method = "ohierarchical"
params = ["0.6", "0.4"]

[consolidation]
stages = ["simple", "refine"]
survivor_policy = "examples"
"#,
        ))
        .unwrap();
        assert_eq!(config.oracle.model.as_deref(), Some("llama3"));
        assert_eq!(config.embedding.dims, Some(768));
        assert!(config.coding.allow_truncation);
        assert_eq!(config.coding.prefetch, 2);
        assert_eq!(config.clustering.params, vec!["0.6", "0.4"]);
        assert_eq!(config.consolidation.stages.len(), 2);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(&write(&tmp, "[coding]\nchunk_size = 0\n")).unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn rejects_unknown_stage_and_policy() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(&write(&tmp, "[consolidation]\nstages = [\"magic\"]\n")).unwrap_err();
        assert!(err.to_string().contains("magic"));
        let err = load_config(&write(&tmp, "[consolidation]\nsurvivor_policy = \"random\"\n")).unwrap_err();
        assert!(err.to_string().contains("random"));
    }

    #[test]
    fn work_dir_must_be_named_known() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(&write(&tmp, "[clustering]\nwork_dir = \"scratch/handshake\"\n")).unwrap_err();
        assert!(err.to_string().contains("clustering.work_dir"));
        let config = load_config(&write(&tmp, "[clustering]\nwork_dir = \"scratch/known\"\n")).unwrap();
        assert_eq!(config.clustering.work_dir, PathBuf::from("scratch/known"));
    }

    #[test]
    fn enabled_oracle_needs_model() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(&write(&tmp, "[oracle]\nprovider = \"openai\"\n")).unwrap_err();
        assert!(err.to_string().contains("oracle.model"));
    }

    #[test]
    fn enabled_embedding_needs_dims() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(&write(
            &tmp,
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config(Path::new("/nonexistent/qc.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
