#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use hydra_core::{Gvk, Tables, METADATA_KEYS_TO_DROP};
use hydra_loader::load_snapshot;

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, body).unwrap();
}

const NAMESPACE: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: ns-a
  uid: 6f1c1d7e-0000-0000-0000-000000000001
  resourceVersion: "1234"
  creationTimestamp: "2024-01-01T00:00:00Z"
"#;

const CONFIGMAP_LIST: &str = r#"apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: cm-1
    namespace: ns-a
    generation: 2
    managedFields:
    - manager: kubectl
  data:
    k: v
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: cm-2
    namespace: ns-a
"#;

#[test]
fn namespace_and_list_populate_two_buckets() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "cluster-scoped-resources/core/namespaces/ns-a.yaml", NAMESPACE);
    write(dir.path(), "namespaces/ns-a/core/configmaps.yaml", CONFIGMAP_LIST);

    let snap = load_snapshot(dir.path(), &Tables::default()).unwrap();
    assert_eq!(snap.cache.type_count(), 2);
    assert_eq!(snap.cache.bucket(&Gvk::new("", "v1", "Namespace")).unwrap().len(), 1);
    let cms = snap.cache.bucket(&Gvk::new("", "v1", "ConfigMap")).unwrap();
    assert_eq!(cms.len(), 2);
    assert_eq!(snap.report.cached, 3);
    assert!(snap.report.skipped.is_empty());

    for bucket in snap.cache.buckets() {
        for r in bucket.records() {
            let meta = r.body["metadata"].as_object().unwrap();
            for k in METADATA_KEYS_TO_DROP {
                assert!(!meta.contains_key(k), "{} still carries {}", r.key(), k);
            }
        }
    }
}

#[test]
fn bad_documents_and_excluded_types_do_not_abort_load() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a/broken.yaml", "kind: [unterminated\n");
    write(dir.path(), "a/secret.yaml", "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n  namespace: ns\n");
    write(dir.path(), "a/noname.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  namespace: ns\n");
    write(dir.path(), "a/notes.txt", "not a manifest");
    write(dir.path(), "b/ns.yml", NAMESPACE);

    let snap = load_snapshot(dir.path(), &Tables::default()).unwrap();
    assert_eq!(snap.cache.pending_total(), 1);
    assert_eq!(snap.report.excluded, 1);
    assert_eq!(snap.report.skipped.len(), 2);
    assert!(snap.cache.bucket(&Gvk::new("", "v1", "Secret")).is_none());
}

#[test]
fn log_files_are_indexed_by_request_path() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "namespaces/ns1/pods/pod1/container1/container1/logs/current.log", "hello\n");
    write(dir.path(), "namespaces/ns1/pods/pod1/current.log", "wrong depth\n");

    let snap = load_snapshot(dir.path(), &Tables::default()).unwrap();
    assert_eq!(snap.logs.len(), 1);
    let file = snap.logs.resolve("/containerLogs/ns1/pod1/container1").unwrap();
    assert_eq!(fs::read_to_string(file).unwrap(), "hello\n");
    assert_eq!(snap.report.log_files, 1);
}

#[test]
fn missing_root_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_snapshot(&dir.path().join("nope"), &Tables::default()).unwrap_err();
    assert!(err.to_string().contains("resolving snapshot root"), "err={}", err);
}
