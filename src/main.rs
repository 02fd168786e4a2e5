//! # qualcode CLI (`qc`)
//!
//! ## Usage
//!
//! ```bash
//! qc --config ./config/qc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qc code <dataset>` | Code every chunk of a dataset with the chat oracle |
//! | `qc consolidate <inputs...>` | Merge codebooks into one reference codebook |
//! | `qc config check` | Validate the configuration and print a summary |
//!
//! ## Examples
//!
//! ```bash
//! # Code a dataset, resuming from a checkpoint
//! qc code data/forum.json --prior out/forum.analysis.json
//!
//! # Compare two coders and relabel one analysis with the result
//! qc consolidate out/a.codebook.json out/b.codebook.json --compare \
//!     --relabel out/a.analysis.json --name agreement
//!
//! # Consolidate every run in out/ and score each coder's coverage
//! qc consolidate out/ --compare --evaluate coverage --name coverage
//! ```

use clap::{Parser, Subcommand};
use qualcode::config::{self, Config};
use qualcode::consolidate::ConsolidateOptions;
use qualcode::progress::ProgressMode;
use qualcode::{coding, consolidate, logging};
use std::path::PathBuf;

/// qualcode: LLM-assisted qualitative coding with codebook consolidation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/qc.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "qc",
    about = "qualcode — LLM-assisted qualitative coding with codebook consolidation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qc.toml")]
    config: PathBuf,

    /// Progress output on stderr: `off`, `human`, or `json`.
    /// Defaults to `human` when stderr is a terminal.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Code every chunk of a dataset.
    ///
    /// Writes `<out>/<name>.analysis.json` (checkpointed as coding goes),
    /// `<name>.codebook.json`, and `<name>.items.json`.
    Code {
        /// Dataset JSON file.
        dataset: PathBuf,

        /// Analysis from an earlier (possibly interrupted) run to continue.
        #[arg(long)]
        prior: Option<PathBuf>,

        /// Run name. Defaults to the dataset file stem.
        #[arg(long)]
        name: Option<String>,
    },

    /// Consolidate codebooks into a reference codebook.
    ///
    /// Inputs are codebook or analysis files. Directories contribute their
    /// `*.analysis.json` and `*.codebook.json` files, one per run.
    Consolidate {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Record which input each code came from.
        #[arg(long)]
        compare: bool,

        /// Analysis to rewrite with the consolidated labels.
        #[arg(long)]
        relabel: Option<PathBuf>,

        /// Write results under `<out>/<name>/`.
        #[arg(long)]
        name: Option<String>,

        /// Run `evaluation-<method>.py` (e.g. `coverage`) on the compared inputs.
        #[arg(long, requires = "compare")]
        evaluate: Option<String>,
    },

    /// Inspect the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the config, then print a summary.
    Check,
}

fn print_summary(path: &std::path::Path, cfg: &Config) {
    println!("config {}", path.display());
    println!(
        "  oracle: {} {}",
        cfg.oracle.provider,
        cfg.oracle.model.as_deref().unwrap_or("-")
    );
    println!(
        "  embedding: {} {}",
        cfg.embedding.provider,
        cfg.embedding.model.as_deref().unwrap_or("-")
    );
    println!(
        "  coding: chunk_size={} retry_budget={} iterations={}",
        cfg.coding.chunk_size, cfg.coding.retry_budget, cfg.coding.iterations
    );
    println!(
        "  consolidation: stages=[{}] max_iterations={} policy={}",
        cfg.consolidation.stages.join(", "),
        cfg.consolidation.max_iterations,
        cfg.consolidation.survivor_policy
    );
    println!("  clustering: {} via {}", cfg.clustering.method, cfg.clustering.python);
    if cfg.cache.enabled {
        println!("  cache: {}", cfg.cache.path.display());
    } else {
        println!("  cache: off");
    }
    println!("  output: {}", cfg.output.dir.display());
    println!("ok");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging();

    let mode = ProgressMode::from_flag(cli.progress.as_deref())?;
    let cfg = config::load_config(&cli.config)?;
    let reporter = mode.reporter();

    match cli.command {
        Commands::Code {
            dataset,
            prior,
            name,
        } => {
            coding::run_code(
                &cfg,
                &dataset,
                prior.as_deref(),
                name.as_deref(),
                reporter.as_ref(),
            )
            .await?;
        }
        Commands::Consolidate {
            inputs,
            compare,
            relabel,
            name,
            evaluate,
        } => {
            let options = ConsolidateOptions {
                compare,
                relabel: relabel.as_deref(),
                name: name.as_deref(),
                evaluate: evaluate.as_deref(),
            };
            consolidate::run_consolidate(&cfg, &inputs, &options, reporter.as_ref()).await?;
        }
        Commands::Config {
            action: ConfigAction::Check,
        } => print_summary(&cli.config, &cfg),
    }

    Ok(())
}
