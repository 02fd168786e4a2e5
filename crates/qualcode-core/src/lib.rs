//! # qualcode core
//!
//! Engine for LLM-assisted qualitative coding: data model, chunk scheduler,
//! coding strategies and sessions, code registry, label lineage, merge
//! engine, and the codebook consolidation pipeline.
//!
//! This crate performs no filesystem or network I/O. The text model and the
//! clustering process are reached through the [`oracle::Oracle`] and
//! [`oracle::ClusterOracle`] traits, implemented by the `qualcode`
//! application crate.

pub mod consolidation;
pub mod error;
pub mod item_level;
pub mod lineage;
pub mod merge;
pub mod models;
pub mod oracle;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod strategy;

pub use error::CodingError;
