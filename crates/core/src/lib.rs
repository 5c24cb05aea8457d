//! deckhand core types: identity keys, the `Deployment` aggregate,
//! metadata defaulting, and the error taxonomy shared by every crate.

#![forbid(unsafe_code)]

pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identity of a resource object: `apiVersion/Kind`, namespace, name.
///
/// The `gvk` component uses the same string form as GVK keys elsewhere in
/// the workspace: `v1/ConfigMap` for the core group, `apps/v1/Deployment`
/// otherwise. Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub gvk: String,
    pub namespace: String,
    pub name: String,
}

impl Key {
    pub fn new(gvk: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { gvk: gvk.into(), namespace: namespace.into(), name: name.into() }
    }

    /// Derive the identity key from a raw object.
    ///
    /// Objects that only carry `metadata.generateName` key on the hint; the
    /// server appends the suffix at create time, so the hint is the most
    /// stable identity the client side has.
    pub fn from_object(object: &Value) -> Result<Key, Error> {
        let api_version = object
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("object missing apiVersion".into()))?;
        let kind = object
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("object missing kind".into()))?;
        let meta = object.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .or_else(|| meta.and_then(|m| m.get("generateName")).and_then(Value::as_str))
            .ok_or_else(|| Error::Validation(format!("{} missing metadata.name", kind)))?;
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .unwrap_or("");
        Ok(Key::new(format!("{}/{}", api_version, kind), namespace, name))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.gvk, self.name)
        } else {
            write!(f, "{} {}/{}", self.gvk, self.namespace, self.name)
        }
    }
}

/// Error taxonomy for the staging and reconciliation core.
///
/// `Validation` and `NotReady` always surface to the caller unchanged;
/// `Remote` carries enough object context to re-run a deploy safely.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid native spec, or an attach that violates composition rules.
    #[error("validation: {0}")]
    Validation(String),
    /// The same identity key added twice with differing content.
    #[error("conflicting object: {0}")]
    Conflict(Key),
    /// Flatten attempted on an incomplete entity tree.
    #[error("not ready: {0}")]
    NotReady(String),
    /// Transport or API failure against the live cluster.
    #[error("remote error on {key}: {reason}")]
    Remote { key: Key, reason: String },
    #[error("encoding resource object: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    pub fn remote(key: &Key, reason: impl fmt::Display) -> Self {
        Error::Remote { key: key.clone(), reason: reason.to_string() }
    }
}

/// An unordered, key-deduplicated collection of resource objects plus the
/// namespaces they declare. Equality is key-set equality with deep-equal
/// values, independent of insertion order (`BTreeMap` gives us both).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deployment {
    objects: BTreeMap<Key, Value>,
    namespaces: BTreeSet<String>,
}

impl Deployment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object under its identity key.
    ///
    /// An identical duplicate is a no-op; the same key with different
    /// content is a conflict. The object's namespace is recorded in the
    /// declaration set as a side effect.
    pub fn add(&mut self, object: Value) -> Result<Key, Error> {
        if object.is_null() {
            return Err(Error::Validation("cannot add null object".into()));
        }
        let key = Key::from_object(&object)?;
        if !key.namespace.is_empty() {
            self.namespaces.insert(key.namespace.clone());
        }
        match self.objects.get(&key) {
            Some(existing) if *existing == object => Ok(key),
            Some(_) => Err(Error::Conflict(key)),
            None => {
                self.objects.insert(key.clone(), object);
                Ok(key)
            }
        }
    }

    /// Best-effort bulk add: namespace sets are unioned, objects added one
    /// by one, and the first conflict aborts with that conflict's error.
    pub fn merge(&mut self, other: &Deployment) -> Result<(), Error> {
        self.namespaces.extend(other.namespaces.iter().cloned());
        for object in other.objects.values() {
            self.add(object.clone())?;
        }
        Ok(())
    }

    pub fn add_namespace(&mut self, namespace: impl Into<String>) {
        let ns = namespace.into();
        if !ns.is_empty() {
            self.namespaces.insert(ns);
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.objects.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.objects.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.objects.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.objects.keys()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(String::as_str)
    }
}

/// Metadata defaults cascaded one-way from parent entities into attached
/// objects and child defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaDefaults {
    /// Set on an object only when the object has no namespace of its own.
    pub namespace: Option<String>,
    /// Name-prefix hint, applied as `metadata.generateName` only when the
    /// object carries neither a name nor its own hint.
    pub generate_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl MetaDefaults {
    /// Apply the defaults to a raw object in place. Object-level keys win on
    /// every conflict, so applying twice with the same defaults is a no-op.
    pub fn apply_to(&self, object: &mut Value) {
        let Some(root) = object.as_object_mut() else { return };
        let meta = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(meta) = meta.as_object_mut() else { return };
        if let Some(ns) = &self.namespace {
            if !meta.contains_key("namespace") {
                meta.insert("namespace".into(), Value::String(ns.clone()));
            }
        }
        if let Some(hint) = &self.generate_name {
            if !meta.contains_key("name") && !meta.contains_key("generateName") {
                meta.insert("generateName".into(), Value::String(hint.clone()));
            }
        }
        merge_string_map(meta, "labels", &self.labels);
        merge_string_map(meta, "annotations", &self.annotations);
    }

    /// Cascade into a child's defaults: the child's own keys win, the parent
    /// fills the gaps. Always copies, so sibling entities never alias maps.
    pub fn overlay(&self, child: &MetaDefaults) -> MetaDefaults {
        let mut out = self.clone();
        if child.namespace.is_some() {
            out.namespace = child.namespace.clone();
        }
        if child.generate_name.is_some() {
            out.generate_name = child.generate_name.clone();
        }
        out.labels.extend(child.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        out.annotations
            .extend(child.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }
}

fn merge_string_map(
    meta: &mut serde_json::Map<String, Value>,
    field: &str,
    defaults: &BTreeMap<String, String>,
) {
    if defaults.is_empty() {
        return;
    }
    let slot = meta
        .entry(field)
        .or_insert_with(|| Value::Object(Default::default()));
    let Some(map) = slot.as_object_mut() else { return };
    for (k, v) in defaults {
        if !map.contains_key(k) {
            map.insert(k.clone(), Value::String(v.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(ns: &str, name: &str, val: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": ns },
            "data": { "k": val }
        })
    }

    #[test]
    fn key_from_object_uses_api_version_kind_namespace_name() {
        let key = Key::from_object(&cm("ns", "a", "1")).expect("key");
        assert_eq!(key.gvk, "v1/ConfigMap");
        assert_eq!(key.namespace, "ns");
        assert_eq!(key.name, "a");
        assert_eq!(key.to_string(), "v1/ConfigMap ns/a");
    }

    #[test]
    fn key_falls_back_to_generate_name_hint() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "generateName": "web-" }
        });
        let key = Key::from_object(&obj).expect("key");
        assert_eq!(key.name, "web-");
        assert_eq!(key.namespace, "");
    }

    #[test]
    fn key_rejects_objects_without_identity() {
        assert!(Key::from_object(&json!({"kind": "ConfigMap"})).is_err());
        assert!(Key::from_object(&json!({"apiVersion": "v1"})).is_err());
        let no_name = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}});
        assert!(Key::from_object(&no_name).is_err());
    }

    #[test]
    fn add_deduplicates_and_detects_conflicts() {
        let mut d = Deployment::new();
        d.add(cm("ns", "a", "1")).expect("first add");
        // identical duplicate is a no-op
        d.add(cm("ns", "a", "1")).expect("duplicate add");
        assert_eq!(d.len(), 1);
        // same key, different content conflicts
        match d.add(cm("ns", "a", "2")) {
            Err(Error::Conflict(key)) => assert_eq!(key.name, "a"),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn add_rejects_null() {
        let mut d = Deployment::new();
        assert!(matches!(d.add(Value::Null), Err(Error::Validation(_))));
    }

    #[test]
    fn add_records_namespace_declarations() {
        let mut d = Deployment::new();
        d.add(cm("web", "a", "1")).expect("add");
        d.add(cm("db", "b", "1")).expect("add");
        let ns: Vec<_> = d.namespaces().collect();
        assert_eq!(ns, vec!["db", "web"]);
    }

    #[test]
    fn equality_is_insertion_order_independent() {
        let mut d1 = Deployment::new();
        d1.add(cm("ns", "a", "1")).expect("add");
        d1.add(cm("ns", "b", "2")).expect("add");
        let mut d2 = Deployment::new();
        d2.add(cm("ns", "b", "2")).expect("add");
        d2.add(cm("ns", "a", "1")).expect("add");
        assert_eq!(d1, d2);
    }

    #[test]
    fn merge_unions_and_stops_on_first_conflict() {
        let mut d1 = Deployment::new();
        d1.add(cm("ns", "a", "1")).expect("add");
        let mut d2 = Deployment::new();
        d2.add(cm("ns", "a", "other")).expect("add");
        d2.add(cm("ns", "b", "2")).expect("add");
        assert!(matches!(d1.merge(&d2), Err(Error::Conflict(_))));

        let mut d3 = Deployment::new();
        d3.add(cm("ns", "c", "3")).expect("add");
        d1.merge(&d3).expect("clean merge");
        assert_eq!(d1.len(), 2);
    }

    #[test]
    fn defaults_fill_gaps_and_object_keys_win() {
        let defaults = MetaDefaults {
            namespace: Some("web".into()),
            generate_name: Some("app-".into()),
            labels: BTreeMap::from([("app".into(), "demo".into()), ("tier".into(), "fe".into())]),
            annotations: BTreeMap::from([("note".into(), "x".into())]),
        };
        let mut obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cfg",
                "labels": { "tier": "be" }
            }
        });
        defaults.apply_to(&mut obj);
        let meta = &obj["metadata"];
        assert_eq!(meta["namespace"], "web");
        // name present, so no generateName hint
        assert!(meta.get("generateName").is_none());
        assert_eq!(meta["labels"]["app"], "demo");
        assert_eq!(meta["labels"]["tier"], "be");
        assert_eq!(meta["annotations"]["note"], "x");

        // idempotent under re-application
        let before = obj.clone();
        defaults.apply_to(&mut obj);
        assert_eq!(obj, before);
    }

    #[test]
    fn generate_name_hint_only_when_unnamed() {
        let defaults = MetaDefaults { generate_name: Some("job-".into()), ..Default::default() };
        let mut unnamed = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}});
        defaults.apply_to(&mut unnamed);
        assert_eq!(unnamed["metadata"]["generateName"], "job-");

        let mut hinted = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"generateName": "own-"}
        });
        defaults.apply_to(&mut hinted);
        assert_eq!(hinted["metadata"]["generateName"], "own-");
    }

    #[test]
    fn overlay_is_copy_on_merge_with_child_precedence() {
        let parent = MetaDefaults {
            namespace: Some("web".into()),
            labels: BTreeMap::from([("app".into(), "demo".into())]),
            ..Default::default()
        };
        let child = MetaDefaults {
            labels: BTreeMap::from([("app".into(), "api".into()), ("role".into(), "s".into())]),
            ..Default::default()
        };
        let merged = parent.overlay(&child);
        assert_eq!(merged.namespace.as_deref(), Some("web"));
        assert_eq!(merged.labels["app"], "api");
        assert_eq!(merged.labels["role"], "s");
        // neither input mutated
        assert_eq!(parent.labels["app"], "demo");
        assert_eq!(child.labels.len(), 2);
    }
}
