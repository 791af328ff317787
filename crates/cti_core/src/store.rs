//! In-memory CTI store with fingerprint deduplication and metadata brokering.
//!
//! The store is the single piece of shared mutable state in the server. It
//! keeps three maps in lockstep under one lock: object contents by id,
//! metadata records by fingerprint, and the id-to-fingerprint binding. A
//! fourth map, the incident-edge index, lets graph traversal find the edges
//! touching a node without scanning the whole object table.

use crate::error::Result;
use crate::fingerprint::{self, Fingerprint};
use crate::graph::{self, ObjectGraph};
use crate::object::{self, CtiObject, Metadata, Tlp};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Comparison operator for content queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Field equals value.
    Eq,
    /// Field differs from value.
    Ne,
}

/// A single predicate over a content field.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    /// Content field to compare.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Value to compare against.
    pub value: Value,
}

impl QueryFilter {
    /// Equality predicate.
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Inequality predicate.
    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    fn matches(&self, content: &Map<String, Value>) -> bool {
        let Some(actual) = content.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => *actual == self.value,
            FilterOp::Ne => *actual != self.value,
        }
    }
}

/// An edge object resolved together with both endpoint views.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EdgeDetail {
    /// The relationship or network-traffic object itself.
    pub relation: Value,
    /// Merged view of the source endpoint, if it resolves.
    pub source: Option<Value>,
    /// Merged view of the target endpoint, if it resolves.
    pub target: Option<Value>,
}

pub(crate) struct StoreInner {
    /// Content payloads by object id.
    objects: HashMap<String, CtiObject>,
    /// Metadata records by content fingerprint.
    meta: HashMap<Fingerprint, Metadata>,
    /// id -> fingerprint binding.
    ids: HashMap<String, Fingerprint>,
    /// Endpoint id -> ids of edge objects touching it.
    incident: HashMap<String, Vec<String>>,
}

/// The authoritative in-memory CTI database.
///
/// Every public operation takes the interior lock once and appears atomic
/// to concurrent callers; reads share a read guard, mutations take the
/// write guard. Nothing here blocks on I/O while holding the lock.
pub struct CtiStore {
    inner: RwLock<StoreInner>,
}

impl Default for CtiStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CtiStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                objects: HashMap::new(),
                meta: HashMap::new(),
                ids: HashMap::new(),
                incident: HashMap::new(),
            }),
        }
    }

    /// Inserts an object, deduplicating by content fingerprint.
    ///
    /// A novel fingerprint persists content and metadata atomically and
    /// returns `(true, id)`. A known fingerprint merges the supplied
    /// metadata into the existing record (monotonic tlp/risk joins, history
    /// appended) and returns `(false, existing_id)`; the submitted id is
    /// discarded.
    pub fn create(&self, object: CtiObject, origin: &str, tlp: Tlp, risk: u8) -> (bool, String) {
        let fp = fingerprint::of(&object);
        let mut inner = self.inner.write();

        if let Some(meta) = inner.meta.get(&fp) {
            let id = meta.id.clone();
            inner.merge_metadata(&id, origin, Some(tlp), Some(risk));
            return (false, id);
        }

        let id = object.id().to_string();
        if inner.ids.contains_key(&id) {
            // Same id resubmitted with changed content: a version update,
            // not a second object.
            inner.apply_patch(&id, object.into_map(), origin);
            inner.merge_metadata(&id, origin, Some(tlp), Some(risk));
            return (false, id);
        }

        let meta = Metadata::new(
            id.clone(),
            object.object_type().to_string(),
            origin.to_string(),
            tlp,
            risk,
        );
        inner.index_edges(&object);
        inner.objects.insert(id.clone(), object);
        inner.ids.insert(id.clone(), fp);
        inner.meta.insert(fp, meta);
        (true, id)
    }

    /// Looks up the canonical id for an object's content, if stored.
    pub fn lookup(&self, object: &CtiObject) -> Option<String> {
        let fp = fingerprint::of(object);
        self.inner.read().meta.get(&fp).map(|m| m.id.clone())
    }

    /// Merged view (content plus metadata) of an object.
    pub fn read(&self, id: &str) -> Option<Value> {
        self.inner.read().merged(id)
    }

    /// Applies a content patch, producing a new version of the object.
    ///
    /// When the patch changes the fingerprint the metadata record is
    /// re-keyed under the new fingerprint with history preserved, and a
    /// content-update entry is appended. Returns whether the content
    /// actually changed; a patch whose fingerprint collides with a
    /// different id is refused.
    pub fn update(&self, id: &str, patch: Map<String, Value>, origin: &str) -> bool {
        self.inner.write().apply_patch(id, patch, origin)
    }

    /// Monotonic tlp/risk merge with history; demotions are silent no-ops.
    pub fn merge_metadata(
        &self,
        id: &str,
        origin: &str,
        tlp: Option<Tlp>,
        risk: Option<u8>,
    ) -> bool {
        self.inner.write().merge_metadata(id, origin, tlp, risk)
    }

    /// Raises the TLP marking; lattice join, never a demotion.
    pub fn raise_tlp(&self, id: &str, tlp: Tlp, origin: &str) -> bool {
        self.inner.write().merge_metadata(id, origin, Some(tlp), None)
    }

    /// Raises the risk score; clamped to 100, never lowered here.
    pub fn raise_risk(&self, id: &str, risk: u8, origin: &str) -> bool {
        self.inner.write().merge_metadata(id, origin, None, Some(risk))
    }

    /// Appends a line to an object's history.
    pub fn append_history(&self, id: &str, line: String) -> bool {
        let mut inner = self.inner.write();
        let Some(fp) = inner.ids.get(id).copied() else {
            return false;
        };
        match inner.meta.get_mut(&fp) {
            Some(meta) => {
                meta.history.push(line);
                true
            }
            None => false,
        }
    }

    /// Removes content, metadata and index entries; no tombstone.
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(fp) = inner.ids.remove(id) else {
            return false;
        };
        inner.meta.remove(&fp);
        inner.incident.remove(id);
        if let Some(obj) = inner.objects.remove(id) {
            inner.unindex_edges(&obj);
        }
        true
    }

    /// Conjunction of predicates over content fields; returns merged views.
    pub fn query(&self, filters: &[QueryFilter]) -> Vec<Value> {
        let inner = self.inner.read();
        let mut out: Vec<Value> = inner
            .objects
            .values()
            .filter(|obj| filters.iter().all(|f| f.matches(obj.content())))
            .filter_map(|obj| inner.merged(obj.id()))
            .collect();
        out.sort_by(|a, b| id_of(a).cmp(&id_of(b)));
        out
    }

    /// All objects that are neither relationships nor network traffic.
    pub fn observables(&self) -> Vec<Value> {
        self.query(&[
            QueryFilter::ne("type", "relationship"),
            QueryFilter::ne("type", "network-traffic"),
        ])
    }

    /// All objects of one content type.
    pub fn all_of_type(&self, object_type: &str) -> Vec<Value> {
        self.query(&[QueryFilter::eq("type", object_type)])
    }

    /// An edge object with both endpoints resolved, for display.
    pub fn edge_detail(&self, id: &str) -> Option<EdgeDetail> {
        let inner = self.inner.read();
        let relation = inner.merged(id)?;
        let (source, target) = match inner.objects.get(id).and_then(|o| o.edge_refs()) {
            Some((s, t)) => (inner.merged(s), inner.merged(t)),
            None => (None, None),
        };
        Some(EdgeDetail {
            relation,
            source,
            target,
        })
    }

    /// Bounded bidirectional traversal from a root object.
    pub fn object_graph(&self, root: &str, depth: u32) -> ObjectGraph {
        let inner = self.inner.read();
        graph::collect(&inner, root, depth)
    }

    /// Traversal result wrapped as an exportable graph document.
    pub fn export_object_graph(&self, root: &str, depth: u32) -> Result<Value> {
        let graph = self.object_graph(root, depth);
        Ok(json!({
            "type": "graph",
            "id": object::new_object_id("graph"),
            "nodes": serde_json::to_value(&graph.nodes)?,
            "edges": serde_json::to_value(&graph.edges)?,
        }))
    }

    /// Flat export: observables, relationships and traffic in one bundle.
    pub fn export_bundle(&self) -> Value {
        json!({
            "type": "bundle",
            "id": object::new_object_id("bundle"),
            "objects": self.observables(),
            "relationships": self.all_of_type("relationship"),
            "network_traffic": self.all_of_type("network-traffic"),
        })
    }

    /// Decrements every positive risk by `step`, flooring at zero.
    ///
    /// A history entry is appended whenever the post-decrement value lands
    /// on a multiple of ten, so the log samples the decline instead of
    /// recording every tick.
    pub fn decay(&self, step: u8) {
        let mut inner = self.inner.write();
        for meta in inner.meta.values_mut() {
            if meta.risk > 0 {
                meta.risk = meta.risk.saturating_sub(step);
                if meta.risk % 10 == 0 {
                    meta.history
                        .push(format!("{}: Risk decayed to {}", now(), meta.risk));
                }
            }
        }
    }

    /// Mean risk per content type over all objects with positive risk.
    pub fn aggregate_risks(&self) -> HashMap<String, f64> {
        let inner = self.inner.read();
        let mut sums: HashMap<String, (u64, u64)> = HashMap::new();
        for meta in inner.meta.values() {
            if meta.risk > 0 {
                let entry = sums.entry(meta.object_type.clone()).or_insert((0, 0));
                entry.0 += meta.risk as u64;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(ty, (sum, count))| (ty, sum as f64 / count as f64))
            .collect()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.inner.read().objects.len()
    }
}

impl StoreInner {
    pub(crate) fn merged(&self, id: &str) -> Option<Value> {
        let obj = self.objects.get(id)?;
        let fp = self.ids.get(id)?;
        let meta = self.meta.get(fp)?;
        let mut map = obj.content().clone();
        map.insert("tlp".into(), json!(meta.tlp));
        map.insert("risk".into(), json!(meta.risk));
        map.insert("origin".into(), json!(meta.origin));
        map.insert("history".into(), json!(meta.history));
        Some(Value::Object(map))
    }

    pub(crate) fn object(&self, id: &str) -> Option<&CtiObject> {
        self.objects.get(id)
    }

    pub(crate) fn incident_edges(&self, id: &str) -> &[String] {
        self.incident.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn merge_metadata(&mut self, id: &str, origin: &str, tlp: Option<Tlp>, risk: Option<u8>) -> bool {
        let Some(fp) = self.ids.get(id) else {
            return false;
        };
        let Some(meta) = self.meta.get_mut(fp) else {
            return false;
        };
        let mut changed = false;
        if let Some(tlp) = tlp {
            if tlp > meta.tlp {
                meta.tlp = tlp;
                meta.history
                    .push(format!("{}: TLP updated by {} to {}", now(), origin, tlp));
                changed = true;
            }
        }
        if let Some(risk) = risk {
            let risk = risk.min(100);
            if risk > meta.risk {
                meta.risk = risk;
                meta.history
                    .push(format!("{}: Risk updated by {} to {}", now(), origin, risk));
                changed = true;
            }
        }
        changed
    }

    fn apply_patch(&mut self, id: &str, patch: Map<String, Value>, origin: &str) -> bool {
        let Some(old_fp) = self.ids.get(id).copied() else {
            return false;
        };
        let Some(mut obj) = self.objects.get(id).cloned() else {
            return false;
        };

        let before = obj.clone();
        for (field, value) in patch {
            if field == "id" {
                continue;
            }
            obj.insert(&field, value);
        }

        let new_fp = fingerprint::of(&obj);
        if new_fp == old_fp {
            return false;
        }
        if let Some(other) = self.meta.get(&new_fp) {
            if other.id != id {
                debug!(id, other = %other.id, "content patch collides with another object, refused");
                return false;
            }
        }

        let Some(mut meta) = self.meta.remove(&old_fp) else {
            return false;
        };
        meta.history
            .push(format!("{}: Object updated by {}", now(), origin));
        self.meta.insert(new_fp, meta);
        self.ids.insert(id.to_string(), new_fp);

        self.unindex_edges(&before);
        self.index_edges(&obj);
        self.objects.insert(id.to_string(), obj);
        true
    }

    fn index_edges(&mut self, obj: &CtiObject) {
        if let Some((source, target)) = obj.edge_refs() {
            let edge_id = obj.id().to_string();
            self.incident
                .entry(source.to_string())
                .or_default()
                .push(edge_id.clone());
            if source != target {
                self.incident.entry(target.to_string()).or_default().push(edge_id);
            }
        }
    }

    fn unindex_edges(&mut self, obj: &CtiObject) {
        if let Some((source, target)) = obj.edge_refs() {
            let edge_id = obj.id();
            for endpoint in [source, target] {
                if let Some(list) = self.incident.get_mut(endpoint) {
                    list.retain(|e| e != edge_id);
                    if list.is_empty() {
                        self.incident.remove(endpoint);
                    }
                }
            }
        }
    }
}

fn id_of(value: &Value) -> String {
    value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn now() -> String {
    crate::object::timestamp()
}
