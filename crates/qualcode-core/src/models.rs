//! Core data models used throughout qualcode.
//!
//! These types represent the conversational input (items and chunks), the
//! codes and codebooks produced by coding, and the per-chunk coding state
//! that is carried between oracle calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Label assigned to a code once it has been folded into another one.
pub const MERGED_LABEL: &str = "[merged]";

/// Separator between an item id and its content inside an example string.
pub const EXAMPLE_SEPARATOR: &str = "|||";

/// A single message or paragraph. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataItem {
    pub id: String,
    /// Author id.
    pub uid: String,
    pub time: DateTime<Utc>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Id of the chunk this item was loaded from, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
}

/// An entry inside a [`DataChunk`]: either a leaf item or a nested chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DataEntry {
    Item(DataItem),
    Chunk(DataChunk),
}

/// Ordered (possibly nested) container of items, e.g. one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataChunk {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub items: Vec<DataEntry>,
}

impl DataChunk {
    /// All leaf items, depth-first, in their original order.
    pub fn flatten(&self) -> Vec<&DataItem> {
        let mut out = Vec::new();
        collect_items(&self.items, &mut out);
        out
    }
}

fn collect_items<'a>(entries: &'a [DataEntry], out: &mut Vec<&'a DataItem>) {
    for entry in entries {
        match entry {
            DataEntry::Item(item) => out.push(item),
            DataEntry::Chunk(chunk) => collect_items(&chunk.items, out),
        }
    }
}

/// A qualitative code.
///
/// `alternatives` is the transitive set of labels folded into this code.
/// `old_labels` only covers the current consolidation pass and is reset by
/// the pipeline at the start of every iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    pub label: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<String>,
    /// Ordered; the first entry is the representative definition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub definitions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub examples: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub alternatives: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub old_labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub owners: BTreeSet<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec<f64>>,
}

impl Code {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn is_merged(&self) -> bool {
        self.label == MERGED_LABEL
    }

    /// Add a definition unless an identical one is already present.
    pub fn add_definition(&mut self, definition: &str) {
        let definition = definition.trim();
        if !definition.is_empty() && !self.definitions.iter().any(|d| d == definition) {
            self.definitions.push(definition.to_string());
        }
    }

    pub fn first_definition(&self) -> Option<&str> {
        self.definitions.first().map(String::as_str)
    }
}

/// Mapping from label to code.
pub type Codebook = BTreeMap<String, Code>;

/// Encode an item as an example string attached to a code.
pub fn format_example(item: &DataItem) -> String {
    format!("{}{}{}", item.id, EXAMPLE_SEPARATOR, item.content.trim())
}

/// Split an example string into `(item id, content)`.
///
/// Examples without a separator are returned with an empty id.
pub fn split_example(example: &str) -> (&str, &str) {
    match example.split_once(EXAMPLE_SEPARATOR) {
        Some((id, content)) => (id, content),
        None => ("", example),
    }
}

/// Assignment of zero or more code labels to one item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodedItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
}

/// Per-chunk coding state carried across oracle calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodedThread {
    pub id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub reflection: String,
    #[serde(default)]
    pub codes: Codebook,
    #[serde(default)]
    pub items: BTreeMap<String, CodedItem>,
    #[serde(default)]
    pub iteration: usize,
}

impl CodedThread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// The result of coding a dataset: one thread per source chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodedThreads {
    #[serde(default)]
    pub threads: BTreeMap<String, CodedThread>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codebook: Option<Codebook>,
}
