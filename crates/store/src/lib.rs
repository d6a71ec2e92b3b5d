//! Hydra store: the in-RAM resource cache partitioned by type identity, plus the log path index.

#![forbid(unsafe_code)]

use hydra_core::{ExclusionTable, Gvk, ResourceRecord};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

pub mod cluster;
pub mod logs;

pub use cluster::{rewrite_node_addresses, service_network, ShapeError, DEFAULT_SERVICE_NETWORK};
pub use logs::{LogPathIndex, LOG_FILE_NAME};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("unable to find gvk {0} in cache")]
    UnknownType(Gvk),
}

/// All cached records sharing one type identity, in insertion order.
#[derive(Debug, Clone)]
pub struct TypeBucket {
    gvk: Gvk,
    records: Vec<ResourceRecord>,
}

impl TypeBucket {
    fn new(gvk: Gvk) -> Self { Self { gvk, records: Vec::new() } }

    pub fn gvk(&self) -> &Gvk { &self.gvk }
    pub fn records(&self) -> &[ResourceRecord] { &self.records }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
}

/// Resource cache. Buckets are created lazily and never removed; they may end up empty.
///
/// No internal locking: the cache is filled by the loader and then owned by a single writer
/// (the reconciler).
#[derive(Debug, Default)]
pub struct ResourceCache {
    buckets: Vec<TypeBucket>,
    index: FxHashMap<Gvk, usize>,
    exclusions: ExclusionTable,
}

impl ResourceCache {
    pub fn new(exclusions: ExclusionTable) -> Self {
        Self { buckets: Vec::new(), index: FxHashMap::default(), exclusions }
    }

    /// Append a record to its bucket. Returns false when the type is excluded.
    pub fn insert(&mut self, record: ResourceRecord) -> bool {
        if self.exclusions.contains(&record.gvk) {
            debug!(gvk = %record.gvk, name = %record.name, "skipping excluded type");
            counter!("hydra_excluded_total", 1u64);
            return false;
        }
        let idx = match self.index.get(&record.gvk) {
            Some(i) => *i,
            None => {
                let i = self.buckets.len();
                self.buckets.push(TypeBucket::new(record.gvk.clone()));
                self.index.insert(record.gvk.clone(), i);
                i
            }
        };
        self.buckets[idx].records.push(record);
        true
    }

    /// With no names, every record of the type. With names, the first record matching each
    /// requested name, in request order; unmatched names are skipped.
    pub fn lookup(&self, gvk: &Gvk, names: &[&str]) -> Result<Vec<&ResourceRecord>, CacheError> {
        let bucket = self.bucket(gvk).ok_or_else(|| CacheError::UnknownType(gvk.clone()))?;
        if names.is_empty() {
            return Ok(bucket.records.iter().collect());
        }
        let mut out = Vec::new();
        for n in names {
            if let Some(r) = bucket.records.iter().find(|r| r.name == *n) {
                out.push(r);
            }
        }
        Ok(out)
    }

    pub fn bucket(&self, gvk: &Gvk) -> Option<&TypeBucket> {
        self.index.get(gvk).map(|i| &self.buckets[*i])
    }

    pub(crate) fn records_mut(&mut self, gvk: &Gvk) -> Option<&mut Vec<ResourceRecord>> {
        match self.index.get(gvk) {
            Some(i) => Some(&mut self.buckets[*i].records),
            None => None,
        }
    }

    /// Buckets in first-seen order.
    pub fn buckets(&self) -> impl Iterator<Item = &TypeBucket> {
        self.buckets.iter()
    }

    pub fn gvks(&self) -> Vec<Gvk> {
        self.buckets.iter().map(|b| b.gvk.clone()).collect()
    }

    /// Move the pending records of a type out of the cache for an apply attempt.
    pub fn take_pending(&mut self, gvk: &Gvk) -> Vec<ResourceRecord> {
        self.records_mut(gvk).map(std::mem::take).unwrap_or_default()
    }

    /// Replace the pending set of a type with the records still unapplied after an attempt.
    pub fn restore_pending(&mut self, gvk: &Gvk, pending: Vec<ResourceRecord>) {
        debug_assert!(pending.iter().all(|r| &r.gvk == gvk));
        match self.records_mut(gvk) {
            Some(slot) => *slot = pending,
            None if pending.is_empty() => {}
            None => {
                let i = self.buckets.len();
                self.buckets.push(TypeBucket { gvk: gvk.clone(), records: pending });
                self.index.insert(gvk.clone(), i);
            }
        }
    }

    pub fn pending_total(&self) -> usize {
        self.buckets.iter().map(|b| b.records.len()).sum()
    }

    /// Types with at least one pending record, in first-seen order.
    pub fn pending_by_type(&self) -> Vec<(Gvk, usize)> {
        self.buckets.iter().filter(|b| !b.is_empty()).map(|b| (b.gvk.clone(), b.len())).collect()
    }

    pub fn type_count(&self) -> usize { self.buckets.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_core::Tables;
    use serde_json::json;

    fn rec(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> ResourceRecord {
        let mut meta = json!({ "name": name });
        if let Some(ns) = ns { meta["namespace"] = json!(ns); }
        ResourceRecord::from_value(json!({ "apiVersion": api_version, "kind": kind, "metadata": meta })).unwrap()
    }

    fn cache() -> ResourceCache {
        ResourceCache::new(Tables::default().exclusions)
    }

    #[test]
    fn insert_groups_by_type_in_order() {
        let mut c = cache();
        assert!(c.insert(rec("v1", "ConfigMap", Some("a"), "one")));
        assert!(c.insert(rec("v1", "Namespace", None, "a")));
        assert!(c.insert(rec("v1", "ConfigMap", Some("a"), "two")));
        assert_eq!(c.type_count(), 2);
        let cms = c.bucket(&Gvk::new("", "v1", "ConfigMap")).unwrap();
        let names: Vec<&str> = cms.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert_eq!(c.pending_total(), 3);
    }

    #[test]
    fn excluded_types_never_grow_a_bucket() {
        let mut c = cache();
        for g in hydra_core::tables::DEFAULT_EXCLUSIONS {
            let gvk = Gvk::from(*g);
            assert!(!c.insert(rec(&gvk.api_version(), &gvk.kind, Some("ns"), "x")));
        }
        assert_eq!(c.type_count(), 0);
        assert_eq!(c.pending_total(), 0);
    }

    #[test]
    fn lookup_filters_by_name_in_request_order() {
        let mut c = cache();
        for n in ["a", "b", "c"] { c.insert(rec("v1", "ConfigMap", Some("ns"), n)); }
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let all = c.lookup(&gvk, &[]).unwrap();
        assert_eq!(all.len(), 3);
        let some = c.lookup(&gvk, &["c", "missing", "a"]).unwrap();
        let names: Vec<&str> = some.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn lookup_unknown_type_errors() {
        let c = cache();
        let err = c.lookup(&Gvk::new("", "v1", "Pod"), &[]).unwrap_err();
        assert_eq!(err, CacheError::UnknownType(Gvk::new("", "v1", "Pod")));
    }

    #[test]
    fn take_and_restore_keep_bucket_alive() {
        let mut c = cache();
        c.insert(rec("v1", "ConfigMap", Some("ns"), "a"));
        c.insert(rec("v1", "ConfigMap", Some("ns"), "b"));
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let taken = c.take_pending(&gvk);
        assert_eq!(taken.len(), 2);
        assert_eq!(c.pending_total(), 0);
        c.restore_pending(&gvk, taken.into_iter().skip(1).collect());
        assert_eq!(c.pending_by_type(), vec![(gvk.clone(), 1)]);
        c.restore_pending(&gvk, Vec::new());
        assert!(c.bucket(&gvk).unwrap().is_empty());
        assert!(c.pending_by_type().is_empty());
        assert_eq!(c.type_count(), 1);
    }
}
