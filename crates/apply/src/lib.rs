//! Hydra apply: replays cached records into a target API.
//!
//! One record is applied with create-if-absent plus a wholesale status overwrite. A bucket is
//! applied record by record; whatever does not land comes back as the bucket's new pending set.
//! The [`reconcile`] module drives buckets in priority order, pass after pass, with backoff.

#![forbid(unsafe_code)]

use hydra_core::{normalize, Gvk, ResourceRecord};
use hydra_kubehub::{ResourceClient, TargetApi, TargetError};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, warn};

pub mod reconcile;

pub use reconcile::{
    Backoff, CancelHandle, OnConverged, PassReport, PriorityGate, ReconcileConfig, ReconcileHandle, ReconcileSummary, Reconciler,
    StatusHandle,
};

/// Counters for one record, bucket or pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub attempted: usize,
    pub applied: usize,
    pub created: usize,
    pub status_updated: usize,
    pub failed: usize,
}

impl ApplyStats {
    pub fn merge(&mut self, other: ApplyStats) {
        self.attempted += other.attempted;
        self.applied += other.applied;
        self.created += other.created;
        self.status_updated += other.status_updated;
        self.failed += other.failed;
    }
}

#[derive(Debug)]
pub enum RecordOutcome {
    Applied { created: bool, status_updated: bool },
    /// Not applied; `record` is what should be retried next pass.
    Pending { record: ResourceRecord, error: TargetError },
}

#[derive(Debug)]
pub struct BucketOutcome {
    pub gvk: Gvk,
    pub pending: Vec<ResourceRecord>,
    pub stats: ApplyStats,
    /// The type itself could not be reached and the rest of the bucket was not attempted.
    pub aborted: bool,
}

/// Apply one record: fetch, create when absent, then overwrite status when the record carries one.
pub async fn apply_record(client: &dyn ResourceClient, record: ResourceRecord) -> RecordOutcome {
    let mut created = false;
    let existing = match client.get(&record.name).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            debug!(gvk = %record.gvk, key = %record.key(), "not found, creating");
            let mut body = record.body.clone();
            normalize(&mut body);
            match client.create(&body).await {
                Ok(obj) => {
                    counter!("hydra_create_total", 1u64);
                    created = true;
                    obj
                }
                Err(error) => {
                    counter!("hydra_create_err_total", 1u64);
                    warn!(gvk = %record.gvk, key = %record.key(), error = %error, "unable to create resource");
                    return RecordOutcome::Pending { record, error };
                }
            }
        }
        Err(error) => {
            warn!(gvk = %record.gvk, key = %record.key(), error = %error, "unable to fetch resource");
            return RecordOutcome::Pending { record, error };
        }
    };

    if !record.has_status() {
        return RecordOutcome::Applied { created, status_updated: false };
    }
    let status = record.status().cloned().unwrap_or(Json::Null);
    let mut server = existing;
    match server.as_object_mut() {
        Some(map) => {
            map.insert("status".to_string(), status);
        }
        None => {
            let error = TargetError::Rejected("server returned a non-object representation".into());
            return RecordOutcome::Pending { record, error };
        }
    }
    match client.update_status(&server).await {
        Ok(_) => {
            counter!("hydra_status_update_total", 1u64);
            RecordOutcome::Applied { created, status_updated: true }
        }
        Err(error) => {
            counter!("hydra_status_update_err_total", 1u64);
            warn!(gvk = %record.gvk, key = %record.key(), error = %error, "unable to update status for resource");
            RecordOutcome::Pending { record: record.with_body(server), error }
        }
    }
}

/// Apply every record of one type. The returned pending set is rebuilt from outcomes.
pub async fn apply_bucket(target: &dyn TargetApi, gvk: Gvk, records: Vec<ResourceRecord>) -> BucketOutcome {
    let mut out = BucketOutcome { gvk, pending: Vec::new(), stats: ApplyStats::default(), aborted: false };
    let mut iter = records.into_iter();
    while let Some(record) = iter.next() {
        let client = match target.resource(&record.gvk, record.namespace.as_deref()).await {
            Ok(c) => c,
            Err(error) if error.is_record_scoped() => {
                counter!("hydra_client_err_total", 1u64);
                warn!(gvk = %out.gvk, key = %record.key(), error = %error, "unable to scope resource interface");
                out.stats.attempted += 1;
                out.stats.failed += 1;
                out.pending.push(record);
                continue;
            }
            Err(error) => {
                counter!("hydra_client_err_total", 1u64);
                warn!(gvk = %out.gvk, key = %record.key(), error = %error, "unable to create resource interface");
                out.stats.attempted += 1;
                out.stats.failed += 1;
                out.pending.push(record);
                out.pending.extend(iter);
                out.aborted = true;
                break;
            }
        };
        out.stats.attempted += 1;
        match apply_record(client.as_ref(), record).await {
            RecordOutcome::Applied { created, status_updated } => {
                out.stats.applied += 1;
                out.stats.created += usize::from(created);
                out.stats.status_updated += usize::from(status_updated);
            }
            RecordOutcome::Pending { record, .. } => {
                out.stats.failed += 1;
                out.pending.push(record);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_kubehub::{CallKind, MemoryTarget};
    use serde_json::json;

    fn cm(name: &str) -> ResourceRecord {
        ResourceRecord::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "ns" },
            "data": { "k": "v" }
        }))
        .unwrap()
    }

    fn node(name: &str) -> ResourceRecord {
        ResourceRecord::from_value(json!({
            "apiVersion": "v1", "kind": "Node",
            "metadata": { "name": name },
            "status": { "addresses": [{ "type": "InternalIP", "address": "10.0.0.5" }] }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn creates_when_absent_and_skips_status_when_none() {
        let t = MemoryTarget::new();
        let client = t.resource(&cm("a").gvk, Some("ns")).await.unwrap();
        let out = apply_record(client.as_ref(), cm("a")).await;
        assert!(matches!(out, RecordOutcome::Applied { created: true, status_updated: false }));
        assert_eq!(t.count(CallKind::Create), 1);
        assert_eq!(t.count(CallKind::UpdateStatus), 0);
    }

    #[tokio::test]
    async fn reapplying_an_existing_object_never_creates_twice() {
        let t = MemoryTarget::new();
        let r = node("n1");
        let client = t.resource(&r.gvk, None).await.unwrap();
        let first = apply_record(client.as_ref(), r.clone()).await;
        assert!(matches!(first, RecordOutcome::Applied { created: true, status_updated: true }));
        let second = apply_record(client.as_ref(), r.clone()).await;
        assert!(matches!(second, RecordOutcome::Applied { created: false, .. }));
        assert_eq!(t.count(CallKind::Create), 1);
        let live = t.object(&r.gvk, None, "n1").unwrap();
        assert_eq!(live["status"]["addresses"][0]["address"], "10.0.0.5");
    }

    #[tokio::test]
    async fn status_failure_retains_server_copy_with_local_status() {
        let t = MemoryTarget::new();
        let r = node("n1");
        t.reject_status(&r.gvk, "n1", true);
        let client = t.resource(&r.gvk, None).await.unwrap();
        match apply_record(client.as_ref(), r.clone()).await {
            RecordOutcome::Pending { record, error } => {
                assert!(!error.is_not_found());
                assert_eq!(record.body["metadata"]["uid"], "mem-1");
                assert_eq!(record.body["status"], r.body["status"]);
            }
            other => panic!("expected pending, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_failure_moves_on_to_next_record() {
        let t = MemoryTarget::new();
        let gvk = cm("a").gvk;
        t.reject_create(&gvk, "a", true);
        let out = apply_bucket(&t, gvk.clone(), vec![cm("a"), cm("b")]).await;
        assert!(!out.aborted);
        assert_eq!(out.pending.len(), 1);
        assert_eq!(out.pending[0].name, "a");
        assert_eq!(out.stats.applied, 1);
        assert!(t.object(&gvk, Some("ns"), "b").is_some());
    }

    #[tokio::test]
    async fn client_failure_aborts_rest_of_bucket() {
        let t = MemoryTarget::new();
        let gvk = cm("a").gvk;
        t.unserve(&gvk);
        let out = apply_bucket(&t, gvk.clone(), vec![cm("a"), cm("b"), cm("c")]).await;
        assert!(out.aborted);
        let names: Vec<&str> = out.pending.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(t.count(CallKind::Resource), 1);
        assert_eq!(t.count(CallKind::Get), 0);
    }

    /// Refuses clients for records without a namespace, like a live server does for namespaced kinds.
    struct NamespacedOnly(MemoryTarget);

    #[async_trait::async_trait]
    impl TargetApi for NamespacedOnly {
        async fn resource(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Box<dyn ResourceClient>, TargetError> {
            match namespace {
                None => Err(TargetError::NamespaceRequired(gvk.clone())),
                Some(_) => self.0.resource(gvk, namespace).await,
            }
        }
    }

    #[tokio::test]
    async fn missing_namespace_only_holds_back_that_record() {
        let t = MemoryTarget::new();
        let target = NamespacedOnly(t.clone());
        let bad = ResourceRecord::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "bad" }
        }))
        .unwrap();
        let gvk = bad.gvk.clone();
        let out = apply_bucket(&target, gvk.clone(), vec![bad, cm("good-1"), cm("good-2")]).await;
        assert!(!out.aborted);
        let names: Vec<&str> = out.pending.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["bad"]);
        assert_eq!(out.stats.attempted, 3);
        assert_eq!(out.stats.applied, 2);
        assert_eq!(out.stats.failed, 1);
        assert!(t.object(&gvk, Some("ns"), "good-1").is_some());
        assert!(t.object(&gvk, Some("ns"), "good-2").is_some());
    }
}
