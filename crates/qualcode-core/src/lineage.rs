//! Label lineage as a disjoint-set forest.
//!
//! Every label ever seen during consolidation is a node. Merging a code
//! links the loser's set under the survivor's root; relabeling makes the new
//! label the root of the old label's set. [`LabelLineage::find`] returns the
//! current canonical label with path compression, so lookups stay O(1)
//! amortized and chains can never loop.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct LabelLineage {
    parent: HashMap<String, String>,
}

impl LabelLineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the forest with every live label of a codebook.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut lineage = Self::new();
        for label in labels {
            lineage.insert(label);
        }
        lineage
    }

    /// Add `label` as its own root unless it is already known.
    pub fn insert(&mut self, label: &str) {
        if !self.parent.contains_key(label) {
            self.parent.insert(label.to_string(), label.to_string());
        }
    }

    /// Canonical label for `label`, compressing the path on the way.
    ///
    /// Unknown labels resolve to themselves.
    pub fn find(&mut self, label: &str) -> String {
        let root = self.resolve(label).to_string();
        let mut current = label.to_string();
        while let Some(next) = self.parent.get(&current).cloned() {
            if next == current {
                break;
            }
            self.parent.insert(current, root.clone());
            current = next;
        }
        root
    }

    /// Canonical label for `label` without mutating the forest.
    pub fn resolve<'a>(&'a self, label: &'a str) -> &'a str {
        let mut current = label;
        while let Some(next) = self.parent.get(current) {
            if next.as_str() == current {
                break;
            }
            current = next.as_str();
        }
        current
    }

    /// Fold `loser`'s set into `survivor`'s set. The survivor's root stays
    /// canonical.
    pub fn union(&mut self, survivor: &str, loser: &str) {
        self.insert(survivor);
        self.insert(loser);
        let keep = self.find(survivor);
        let drop = self.find(loser);
        if keep != drop {
            self.parent.insert(drop, keep);
        }
    }

    /// Record that the code currently known as `old` is now called `new`.
    ///
    /// `new` becomes the root of `old`'s set. If `new` already headed a
    /// different set, the two sets are joined under `new`.
    pub fn rename(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        self.insert(old);
        self.insert(new);
        let old_root = self.find(old);
        let new_root = self.find(new);
        if new_root != new {
            // `new` was an alias of some other code: detach it first.
            self.parent.insert(new.to_string(), new.to_string());
            self.parent.insert(new_root, new.to_string());
        }
        if old_root != new {
            self.parent.insert(old_root, new.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_label_resolves_to_itself() {
        let mut lineage = LabelLineage::new();
        assert_eq!(lineage.find("ghost"), "ghost");
        assert_eq!(lineage.resolve("ghost"), "ghost");
    }

    #[test]
    fn union_keeps_survivor_root() {
        let mut lineage = LabelLineage::from_labels(["greeting", "hello", "hi"]);
        lineage.union("hello", "greeting");
        lineage.union("hello", "hi");
        assert_eq!(lineage.find("greeting"), "hello");
        assert_eq!(lineage.find("hi"), "hello");
        assert_eq!(lineage.find("hello"), "hello");
    }

    #[test]
    fn chains_are_compressed() {
        let mut lineage = LabelLineage::from_labels(["a", "b", "c", "d"]);
        lineage.union("b", "a");
        lineage.union("c", "b");
        lineage.union("d", "c");
        assert_eq!(lineage.find("a"), "d");
        // after compression `a` points straight at the root
        assert_eq!(lineage.parent["a"], "d");
        assert_eq!(lineage.parent["b"], "d");
    }

    #[test]
    fn union_of_same_set_is_noop() {
        let mut lineage = LabelLineage::from_labels(["a", "b"]);
        lineage.union("a", "b");
        lineage.union("b", "a");
        assert_eq!(lineage.find("a"), "a");
        assert_eq!(lineage.find("b"), "a");
    }

    #[test]
    fn rename_moves_whole_set() {
        let mut lineage = LabelLineage::from_labels(["hi", "hello"]);
        lineage.union("hello", "hi");
        lineage.rename("hello", "greeting");
        assert_eq!(lineage.find("hi"), "greeting");
        assert_eq!(lineage.find("hello"), "greeting");
        assert_eq!(lineage.find("greeting"), "greeting");
    }

    #[test]
    fn rename_onto_alias_detaches_it() {
        let mut lineage = LabelLineage::from_labels(["x", "y", "z"]);
        lineage.union("x", "y");
        // the code formerly named `z` takes the name `y`
        lineage.rename("z", "y");
        assert_eq!(lineage.find("z"), "y");
        assert_eq!(lineage.find("y"), "y");
        assert_eq!(lineage.find("x"), "y");
    }
}
