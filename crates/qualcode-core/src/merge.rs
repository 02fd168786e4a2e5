//! Merge engine: fold one code into another, or a whole cluster into its
//! representative.
//!
//! Merging is idempotent. Every attached collection is a set, the merged
//! sentinel is never recorded as an alternative, and the loser's own
//! alternatives are cleared so lineage lookups through `alternatives` end
//! after a single hop at the current survivor.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::lineage::LabelLineage;
use crate::models::{Code, Codebook, MERGED_LABEL};
use crate::oracle::{ClusterMember, Clusters, UNCLUSTERED};

/// Fold `loser` into `survivor`.
pub fn merge_codes(survivor: &mut Code, loser: &mut Code) {
    let loser_alternatives = std::mem::take(&mut loser.alternatives);
    survivor.alternatives.extend(loser_alternatives);
    if !loser.is_merged() {
        survivor.alternatives.insert(loser.label.clone());
        survivor.old_labels.insert(loser.label.clone());
    }
    survivor.alternatives.remove(&survivor.label);
    survivor.alternatives.remove(MERGED_LABEL);

    for definition in &loser.definitions {
        survivor.add_definition(definition);
    }
    survivor.categories.extend(loser.categories.iter().cloned());
    survivor.examples.extend(loser.examples.iter().cloned());
    survivor.owners.extend(loser.owners.iter().copied());
    survivor
        .old_labels
        .extend(loser.old_labels.iter().filter(|l| *l != MERGED_LABEL).cloned());
    survivor.old_labels.remove(&survivor.label);

    loser.label = MERGED_LABEL.to_string();
}

/// Merge `codes[loser]` into `codes[survivor]` and record it in `lineage`.
pub fn merge_at(codes: &mut [Code], survivor: usize, loser: usize, lineage: &mut LabelLineage) {
    if survivor == loser || codes[loser].is_merged() {
        return;
    }
    let loser_label = codes[loser].label.clone();
    let (keep, drop) = pair_mut(codes, survivor, loser);
    lineage.union(&keep.label, &loser_label);
    debug!(survivor = %keep.label, loser = %loser_label, "merging codes");
    merge_codes(keep, drop);
}

fn pair_mut(codes: &mut [Code], a: usize, b: usize) -> (&mut Code, &mut Code) {
    if a < b {
        let (left, right) = codes.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = codes.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// Chooses the representative of a cluster.
///
/// `members` index into `codes`; already merged codes have been removed.
/// Implementations return the members in merge order: the first entry
/// survives and the rest are merged into it in the order given.
pub trait SurvivorPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn rank(&self, codes: &[Code], members: &mut Vec<ClusterMember>);
}

/// Combined length of the label and its representative definition.
pub fn code_length(code: &Code) -> usize {
    code.label.chars().count() + code.first_definition().map_or(0, |d| d.chars().count())
}

fn by_confidence_then_length(codes: &[Code], a: &ClusterMember, b: &ClusterMember) -> Ordering {
    b.probability
        .partial_cmp(&a.probability)
        .unwrap_or(Ordering::Equal)
        .then_with(|| code_length(&codes[a.index]).cmp(&code_length(&codes[b.index])))
        .then_with(|| codes[a.index].label.cmp(&codes[b.index].label))
}

/// Highest clustering confidence first, then the shortest label +
/// definition, then alphabetical.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceThenShortest;

impl SurvivorPolicy for ConfidenceThenShortest {
    fn name(&self) -> &str {
        "confidence"
    }

    fn rank(&self, codes: &[Code], members: &mut Vec<ClusterMember>) {
        members.sort_by(|a, b| by_confidence_then_length(codes, a, b));
    }
}

/// The code with the most examples survives; the others follow in
/// confidence order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MostExamples;

impl SurvivorPolicy for MostExamples {
    fn name(&self) -> &str {
        "examples"
    }

    fn rank(&self, codes: &[Code], members: &mut Vec<ClusterMember>) {
        members.sort_by(|a, b| by_confidence_then_length(codes, a, b));
        if let Some(best) = members
            .iter()
            .enumerate()
            .max_by(|(i, a), (j, b)| {
                codes[a.index]
                    .examples
                    .len()
                    .cmp(&codes[b.index].examples.len())
                    .then_with(|| j.cmp(i))
            })
            .map(|(i, _)| i)
        {
            let survivor = members.remove(best);
            members.insert(0, survivor);
        }
    }
}

/// Look up a policy by its configuration name.
pub fn policy_by_name(name: &str) -> Option<Box<dyn SurvivorPolicy>> {
    match name {
        "confidence" => Some(Box::new(ConfidenceThenShortest)),
        "examples" => Some(Box::new(MostExamples)),
        _ => None,
    }
}

/// Merge one cluster into its representative. Returns the number of codes
/// merged away.
pub fn merge_cluster(
    codes: &mut [Code],
    members: &[ClusterMember],
    policy: &dyn SurvivorPolicy,
    lineage: &mut LabelLineage,
) -> usize {
    let mut live: Vec<ClusterMember> = members
        .iter()
        .copied()
        .filter(|m| m.index < codes.len() && !codes[m.index].is_merged())
        .collect();
    if live.len() < 2 {
        return 0;
    }
    policy.rank(codes, &mut live);
    let survivor = live[0].index;
    let mut merged = 0;
    for member in &live[1..] {
        merge_at(codes, survivor, member.index, lineage);
        merged += 1;
    }
    merged
}

/// Merge every real cluster. Items in [`UNCLUSTERED`] are left alone.
///
/// `indices[i]` maps position `i` of the clustered texts back into `codes`.
pub fn merge_clusters(
    codes: &mut [Code],
    indices: &[usize],
    clusters: &Clusters,
    policy: &dyn SurvivorPolicy,
    lineage: &mut LabelLineage,
) -> usize {
    let mut merged = 0;
    for (id, members) in clusters {
        if *id == UNCLUSTERED {
            continue;
        }
        let mapped: Vec<ClusterMember> = members
            .iter()
            .filter_map(|m| {
                indices.get(m.index).map(|&index| ClusterMember {
                    index,
                    probability: m.probability,
                })
            })
            .collect();
        merged += merge_cluster(codes, &mapped, policy, lineage);
    }
    merged
}

/// Rebuild a codebook from working codes.
///
/// Merged codes are dropped. Live codes whose label resolves through
/// `lineage` to another live code (or that share a label after relabeling)
/// are folded into that code.
pub fn compact_codes(codes: &mut [Code], lineage: &mut LabelLineage) -> Codebook {
    let mut owner_of: BTreeMap<String, usize> = BTreeMap::new();
    for i in 0..codes.len() {
        if codes[i].is_merged() {
            continue;
        }
        let label = codes[i].label.clone();
        lineage.insert(&label);
        let canonical = lineage.find(&label);
        let target = owner_of
            .get(&canonical)
            .or_else(|| owner_of.get(&label))
            .copied();
        match target {
            Some(j) => merge_at(codes, j, i, lineage),
            None => {
                owner_of.insert(label, i);
            }
        }
    }

    // A code registered under its own label may resolve elsewhere now.
    let entries: Vec<(String, usize)> = owner_of.iter().map(|(l, i)| (l.clone(), *i)).collect();
    for (label, i) in entries {
        if codes[i].is_merged() {
            continue;
        }
        let canonical = lineage.find(&label);
        if canonical != label {
            if let Some(&j) = owner_of.get(&canonical) {
                if !codes[j].is_merged() {
                    merge_at(codes, j, i, lineage);
                }
            }
        }
    }

    codes
        .iter()
        .filter(|c| !c.is_merged())
        .map(|c| (c.label.clone(), c.clone()))
        .collect()
}
