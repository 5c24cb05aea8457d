//! deckhand status engine: pure three-way classification over staged,
//! committed and live object sets. No mutation, no I/O, cannot fail.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use deckhand_core::{Deployment, Key};

/// One classification pass: keys joined between a base and a candidate set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    /// In the candidate, absent from the base.
    pub new: Vec<Key>,
    /// In both, values not deep-equal.
    pub modified: Vec<Key>,
    /// In the base, absent from the candidate.
    pub deleted: Vec<Key>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// The categorized drift report for status output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffStat {
    /// Staged vs. live: what deploying the index would change in the cluster.
    pub cluster: Changes,
    /// Staged vs. committed: what is staged but not yet committed.
    pub index: Changes,
}

/// Classify `candidate` against `base` using identity keys as the join key.
/// Output vectors follow key order, so results are deterministic regardless
/// of how either deployment was built.
pub fn classify(base: &Deployment, candidate: &Deployment) -> Changes {
    let mut changes = Changes::default();
    for (key, value) in candidate.iter() {
        match base.get(key) {
            None => changes.new.push(key.clone()),
            Some(existing) if existing != value => changes.modified.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in base.keys() {
        if !candidate.contains(key) {
            changes.deleted.push(key.clone());
        }
    }
    changes
}

/// Full status report: the staged index against both the committed head and
/// the live cluster. The two classifications are independent.
pub fn stat(index: &Deployment, head: &Deployment, cluster: &Deployment) -> DiffStat {
    DiffStat { cluster: classify(cluster, index), index: classify(head, index) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn cm(name: &str, val: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "ns" },
            "data": { "k": val }
        })
    }

    fn deployment(objects: &[Value]) -> Deployment {
        let mut d = Deployment::new();
        for o in objects {
            d.add(o.clone()).expect("add");
        }
        d
    }

    #[test]
    fn classify_buckets_new_modified_deleted() {
        // base = {A:1, B:2}, candidate = {B:2, C:3}
        let base = deployment(&[cm("a", "1"), cm("b", "2")]);
        let candidate = deployment(&[cm("b", "2"), cm("c", "3")]);
        let changes = classify(&base, &candidate);
        assert_eq!(changes.new.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["c"]);
        assert!(changes.modified.is_empty());
        assert_eq!(changes.deleted.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn classify_flags_changed_values_as_modified() {
        let base = deployment(&[cm("a", "1"), cm("b", "2")]);
        let candidate = deployment(&[cm("b", "2'"), cm("c", "3")]);
        let changes = classify(&base, &candidate);
        assert_eq!(changes.modified.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn classify_of_equal_sets_is_empty() {
        let base = deployment(&[cm("a", "1")]);
        let candidate = deployment(&[cm("a", "1")]);
        assert!(classify(&base, &candidate).is_empty());
    }

    #[test]
    fn stat_runs_both_classifications_independently() {
        let index = deployment(&[cm("a", "1"), cm("b", "2")]);
        // head already has a, but an older b
        let head = deployment(&[cm("a", "1"), cm("b", "old")]);
        // cluster only runs a
        let cluster = deployment(&[cm("a", "1")]);

        let s = stat(&index, &head, &cluster);
        assert_eq!(s.cluster.new.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert!(s.cluster.modified.is_empty());
        assert!(s.cluster.deleted.is_empty());
        assert!(s.index.new.is_empty());
        assert_eq!(s.index.modified.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert!(s.index.deleted.is_empty());
    }
}
