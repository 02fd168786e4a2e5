//! # qualcode
//!
//! LLM-assisted qualitative coding of conversational data.
//!
//! The engine itself (scheduler, strategies, registry, merge engine, and
//! consolidation pipeline) lives in [`qualcode_core`]. This crate supplies
//! the pieces needed to run it end to end: configuration, the chat and
//! embedding clients, the subprocess clusterer, the on-disk cache, dataset
//! and analysis files, and the `qc` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────┐
//! │ Dataset  │──▶│ Coding sessions  │──▶│  Analysis +  │
//! │  (JSON)  │   │ (chat oracle)    │   │  codebooks   │
//! └──────────┘   └──────────────────┘   └──────┬───────┘
//!                                              │
//!                      ┌───────────────────────┘
//!                      ▼
//!             ┌──────────────────┐   ┌──────────────┐
//!             │  Consolidation   │──▶│  Reference   │
//!             │ (cluster + chat) │   │  codebook    │
//!             └──────────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qc config check
//! qc code data/forum.json --name pilot
//! qc consolidate out/pilot.codebook.json out/other.codebook.json --compare \
//!     --relabel out/pilot.analysis.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`cache`] | Persistent response and embedding cache |
//! | [`oracle`] | Chat oracle adapters |
//! | [`embedding`] | Embedding client |
//! | [`cluster`] | Subprocess cluster oracle |
//! | [`evaluate`] | Subprocess codebook evaluation |
//! | [`dataset`] | Dataset, analysis, and codebook files |
//! | [`coding`] | Dataset coding runs |
//! | [`consolidate`] | Consolidation runs and relabeling |
//! | [`export`] | Item table export |
//! | [`progress`] | Progress reporting on stderr |
//! | [`logging`] | Tracing setup |

pub mod cache;
pub mod cluster;
pub mod coding;
pub mod config;
pub mod consolidate;
pub mod dataset;
pub mod embedding;
pub mod evaluate;
pub mod export;
pub mod logging;
pub mod oracle;
pub mod progress;
