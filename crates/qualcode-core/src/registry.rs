//! Code registry: collects codes and their examples while coding runs, and
//! folds per-thread or per-coder codebooks into one.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::lineage::LabelLineage;
use crate::merge::merge_codes;
use crate::models::{format_example, Code, CodedItem, CodedThread, CodedThreads, Codebook, DataItem};

/// Normalize a raw code label from oracle output.
///
/// Trims whitespace, surrounding quotes and a trailing period, and
/// lowercases. Returns `None` for empty or placeholder labels.
pub fn normalize_label(raw: &str) -> Option<String> {
    let label = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim_end_matches('.')
        .trim()
        .to_lowercase();
    match label.as_str() {
        "" | "n/a" | "na" | "none" | "-" => None,
        _ => Some(label),
    }
}

/// Split a multi-code string (`a; b | c`) into normalized labels.
pub fn split_codes(raw: &str) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for part in raw.split([';', '|']) {
        if let Some(label) = normalize_label(part) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
    }
    labels
}

/// Assign `labels` to `item` inside `thread`, replacing any earlier
/// assignment for that item, and attach the item as an example of each
/// code.
pub fn record_item_codes(thread: &mut CodedThread, item: &DataItem, labels: &[String]) {
    let example = format_example(item);
    if let Some(previous) = thread.items.get(&item.id) {
        for old in &previous.codes {
            if !labels.contains(old) {
                if let Some(code) = thread.codes.get_mut(old) {
                    code.examples.remove(&example);
                }
            }
        }
    }
    for label in labels {
        thread
            .codes
            .entry(label.clone())
            .or_insert_with(|| Code::new(label.clone()))
            .examples
            .insert(example.clone());
    }
    thread.items.insert(
        item.id.clone(),
        CodedItem {
            id: item.id.clone(),
            codes: labels.to_vec(),
        },
    );
}

/// Install parsed codes for the coded part of a chunk.
///
/// `codes` is keyed by 1-based position among the coded items
/// (`items[chunk_start..]`). Returns the number of items written.
pub fn install_codes(
    thread: &mut CodedThread,
    items: &[DataItem],
    chunk_start: usize,
    codes: &BTreeMap<usize, String>,
) -> usize {
    let mut written = 0;
    for (&index, raw) in codes {
        if index == 0 {
            continue;
        }
        let Some(item) = items.get(chunk_start + index - 1) else {
            continue;
        };
        let labels = split_codes(raw);
        record_item_codes(thread, item, &labels);
        written += 1;
    }
    written
}

/// Rebuild `thread.codes` so it only lists codes still assigned to an item.
///
/// Definitions and categories of surviving codes are kept.
pub fn prune_thread_codes(thread: &mut CodedThread) {
    let used: BTreeSet<String> = thread
        .items
        .values()
        .flat_map(|item| item.codes.iter().cloned())
        .collect();
    thread.codes.retain(|label, _| used.contains(label));
}

/// Accumulates codebooks from threads or coders into one flat codebook.
#[derive(Debug, Clone, Default)]
pub struct CodeRegistry {
    codebook: Codebook,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single code, merging it with an existing code of the same label.
    pub fn absorb_code(&mut self, code: Code) {
        match self.codebook.get_mut(&code.label) {
            Some(existing) => {
                let mut code = code;
                merge_codes(existing, &mut code);
            }
            None => {
                self.codebook.insert(code.label.clone(), code);
            }
        }
    }

    /// Add every code of a codebook. With `owner`, each code is tagged with
    /// that source index first.
    pub fn absorb_codebook(&mut self, book: &Codebook, owner: Option<usize>) {
        for code in book.values() {
            if code.is_merged() {
                continue;
            }
            let mut code = code.clone();
            if let Some(owner) = owner {
                code.owners.insert(owner);
            }
            self.absorb_code(code);
        }
    }

    /// Add the local codebook of one thread.
    pub fn absorb_thread(&mut self, thread: &CodedThread) {
        debug!(thread = %thread.id, codes = thread.codes.len(), "absorbing thread codebook");
        self.absorb_codebook(&thread.codes, None);
    }

    pub fn finish(self) -> Codebook {
        self.codebook
    }
}

/// Flat codebook for a whole analysis.
pub fn dataset_codebook(analysis: &CodedThreads) -> Codebook {
    let mut registry = CodeRegistry::new();
    for thread in analysis.threads.values() {
        registry.absorb_thread(thread);
    }
    registry.finish()
}

/// Fold several codebooks, tagging each code with the index of the books it
/// came from when `track_owners` is set.
pub fn merge_codebooks(books: &[Codebook], track_owners: bool) -> Codebook {
    let mut registry = CodeRegistry::new();
    for (i, book) in books.iter().enumerate() {
        registry.absorb_codebook(book, track_owners.then_some(i));
    }
    registry.finish()
}

/// How much of a comparison-mode reference codebook one input accounts for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerCoverage {
    pub owner: usize,
    /// Reference codes the owner contributed to.
    pub codes: usize,
    /// Of those, codes at least one other owner contributed to as well.
    pub shared: usize,
    /// `codes` as a fraction of the reference.
    pub share: f64,
}

/// Per-owner coverage for owners `0..owners`, computed from the `owners`
/// sets of the reference codes.
pub fn owner_coverage(reference: &Codebook, owners: usize) -> Vec<OwnerCoverage> {
    let live: Vec<&Code> = reference.values().filter(|c| !c.is_merged()).collect();
    (0..owners)
        .map(|owner| {
            let owned: Vec<&&Code> = live.iter().filter(|c| c.owners.contains(&owner)).collect();
            let shared = owned.iter().filter(|c| c.owners.len() > 1).count();
            let share = if live.is_empty() {
                0.0
            } else {
                owned.len() as f64 / live.len() as f64
            };
            OwnerCoverage {
                owner,
                codes: owned.len(),
                shared,
                share,
            }
        })
        .collect()
}

/// Rewrite every item's codes to their canonical labels and rebuild each
/// thread's local codebook from `reference`.
pub fn relabel_threads(analysis: &mut CodedThreads, lineage: &mut LabelLineage, reference: &Codebook) {
    for thread in analysis.threads.values_mut() {
        let mut rebuilt = Codebook::new();
        for item in thread.items.values_mut() {
            let mut relabeled: Vec<String> = Vec::new();
            for label in &item.codes {
                let canonical = lineage.find(label);
                if !relabeled.contains(&canonical) {
                    relabeled.push(canonical);
                }
            }
            item.codes = relabeled;
        }
        for (label, code) in &thread.codes {
            let canonical = lineage.find(label);
            let entry = rebuilt.entry(canonical.clone()).or_insert_with(|| {
                let mut fresh = Code::new(canonical.clone());
                if let Some(reference_code) = reference.get(&canonical) {
                    fresh.definitions = reference_code.definitions.clone();
                    fresh.categories = reference_code.categories.clone();
                }
                fresh
            });
            entry.examples.extend(code.examples.iter().cloned());
        }
        thread.codes = rebuilt;
    }
    analysis.codebook = Some(reference.clone());
}
