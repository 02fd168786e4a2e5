//! Oracle traits for the two external collaborators.
//!
//! - [`Oracle`] — a text model: `ask(system, user, temperature) -> text`.
//! - [`ClusterOracle`] — a clustering process over a list of texts.
//!
//! Concrete transports (HTTP chat APIs, subprocess clustering) live in the
//! `qualcode` application crate. The core treats cache hits and misses
//! identically and never assumes the oracle is deterministic.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cluster id used for items that did not join any cluster.
pub const UNCLUSTERED: i64 = -1;

/// A text oracle, typically a chat-completion model.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Returns a short identifier for logging (e.g. the model name).
    fn name(&self) -> &str {
        "oracle"
    }

    /// Send one system + user prompt pair and return the raw response.
    async fn ask(&self, system: &str, user: &str, temperature: f32) -> Result<String>;
}

/// Membership of one input text in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Index into the `texts` slice passed to [`ClusterOracle::cluster`].
    pub index: usize,
    /// Clustering confidence in `[0, 1]`.
    pub probability: f64,
}

/// Cluster id → members. Id [`UNCLUSTERED`] holds noise points.
pub type Clusters = BTreeMap<i64, Vec<ClusterMember>>;

/// An external similarity oracle that groups texts into clusters.
#[async_trait]
pub trait ClusterOracle: Send + Sync {
    /// Cluster `texts` with the named method and method-specific parameters.
    async fn cluster(&self, texts: &[String], method: &str, params: &[String]) -> Result<Clusters>;
}

/// Convert the two-array form (`labels[i]`, `probabilities[i]`) emitted by
/// clustering scripts into [`Clusters`].
pub fn clusters_from_assignments(labels: &[i64], probabilities: &[f64]) -> Result<Clusters> {
    if labels.len() != probabilities.len() {
        bail!(
            "cluster output mismatch: {} labels but {} probabilities",
            labels.len(),
            probabilities.len()
        );
    }
    let mut clusters = Clusters::new();
    for (index, (&label, &probability)) in labels.iter().zip(probabilities).enumerate() {
        clusters
            .entry(label)
            .or_default()
            .push(ClusterMember { index, probability });
    }
    Ok(clusters)
}
