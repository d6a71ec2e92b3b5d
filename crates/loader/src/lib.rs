//! Hydra loader: walks a snapshot directory, parses manifests into the resource cache and
//! indexes captured container logs.
//!
//! Traversal errors are fatal. Anything wrong with a single file or document is recorded in the
//! [`LoadReport`], logged, and skipped.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hydra_core::{normalize, RecordError, ResourceRecord, Tables};
use hydra_store::{LogPathIndex, ResourceCache, LOG_FILE_NAME};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub files: usize,
    pub manifests: usize,
    pub documents: usize,
    pub cached: usize,
    pub excluded: usize,
    pub log_files: usize,
    pub skipped: Vec<SkippedDocument>,
}

/// Result of the build phase. Must be complete before reconciliation starts.
#[derive(Debug)]
pub struct Snapshot {
    pub root: PathBuf,
    pub cache: ResourceCache,
    pub logs: LogPathIndex,
    pub report: LoadReport,
}

/// Load every manifest and log artifact under `root`.
pub fn load_snapshot(root: &Path, tables: &Tables) -> Result<Snapshot> {
    let root = fs::canonicalize(root).with_context(|| format!("resolving snapshot root {}", root.display()))?;
    if !root.is_dir() {
        return Err(anyhow!("snapshot root {} is not a directory", root.display()));
    }
    let mut loader = Loader {
        root: root.clone(),
        cache: ResourceCache::new(tables.exclusions.clone()),
        logs: LogPathIndex::new(),
        report: LoadReport::default(),
    };
    walk(&root, &mut |path| loader.visit(path)).with_context(|| format!("walking snapshot root {}", root.display()))?;
    let Loader { cache, logs, report, .. } = loader;
    info!(
        root = %root.display(),
        files = report.files,
        documents = report.documents,
        cached = report.cached,
        excluded = report.excluded,
        skipped = report.skipped.len(),
        types = cache.type_count(),
        log_files = report.log_files,
        "snapshot loaded"
    );
    Ok(Snapshot { root, cache, logs, report })
}

fn walk(dir: &Path, visit: &mut dyn FnMut(&Path)) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("listing directory {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let ft = entry.file_type().with_context(|| format!("stat {}", path.display()))?;
        if ft.is_dir() {
            walk(&path, visit)?;
        } else if ft.is_file() || (ft.is_symlink() && path.is_file()) {
            visit(&path);
        }
    }
    Ok(())
}

struct Loader {
    root: PathBuf,
    cache: ResourceCache,
    logs: LogPathIndex,
    report: LoadReport,
}

impl Loader {
    fn visit(&mut self, path: &Path) {
        self.report.files += 1;
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return };
        if name == LOG_FILE_NAME {
            let rel = path.strip_prefix(&self.root).unwrap_or(path);
            if let Some(key) = self.logs.register(rel, path.to_path_buf()) {
                debug!(request = %key, file = %path.display(), "log file indexed");
                self.report.log_files += 1;
            }
            return;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !MANIFEST_EXTENSIONS.contains(&ext) {
            return;
        }
        self.report.manifests += 1;
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                self.skip(path, format!("reading file: {}", e));
                return;
            }
        };
        for doc in parse_documents(&text, ext == "json") {
            match doc {
                Ok(mut doc) => {
                    normalize(&mut doc);
                    for item in expand_list(doc) {
                        self.cache_document(path, item);
                    }
                }
                Err(reason) => self.skip(path, reason),
            }
        }
    }

    fn cache_document(&mut self, path: &Path, doc: Json) {
        self.report.documents += 1;
        counter!("hydra_documents_total", 1u64);
        match ResourceRecord::from_value(doc) {
            Ok(record) => {
                if self.cache.insert(record) {
                    self.report.cached += 1;
                } else {
                    self.report.excluded += 1;
                }
            }
            Err(e @ (RecordError::MissingApiVersion | RecordError::MissingKind | RecordError::NotAnObject)) => {
                debug!(path = %path.display(), reason = %e, "not a resource manifest; skipping");
                self.report.skipped.push(SkippedDocument { path: path.to_path_buf(), reason: e.to_string() });
                counter!("hydra_documents_skipped_total", 1u64);
            }
            Err(e) => self.skip(path, e.to_string()),
        }
    }

    fn skip(&mut self, path: &Path, reason: String) {
        warn!(path = %path.display(), reason = %reason, "skipping document");
        counter!("hydra_documents_skipped_total", 1u64);
        self.report.skipped.push(SkippedDocument { path: path.to_path_buf(), reason });
    }
}

/// Parse a file into its documents. YAML streams may carry several `---` separated documents;
/// empty documents are dropped.
pub fn parse_documents(text: &str, json: bool) -> Vec<std::result::Result<Json, String>> {
    if json {
        return vec![serde_json::from_str::<Json>(text).map_err(|e| format!("parsing JSON: {}", e))];
    }
    let mut out = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let val = match serde_yaml::Value::deserialize(de) {
            Ok(v) => v,
            Err(e) => {
                out.push(Err(format!("parsing YAML: {}", e)));
                break;
            }
        };
        if val.is_null() {
            continue;
        }
        out.push(serde_json::to_value(val).map_err(|e| format!("converting YAML to JSON: {}", e)));
    }
    out
}

/// Expand a `*List` document into its items. Items missing `apiVersion`/`kind` inherit them from
/// a typed list (`ConfigMapList` -> `ConfigMap`). Anything else passes through unchanged.
pub fn expand_list(doc: Json) -> Vec<Json> {
    let is_list = doc.get("kind").and_then(|k| k.as_str()).map(|k| k.ends_with("List")).unwrap_or(false)
        && doc.get("items").map(|i| i.is_array()).unwrap_or(false);
    if !is_list {
        return vec![doc];
    }
    let list_kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or("").to_string();
    let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
    let item_kind = match list_kind.strip_suffix("List") {
        Some(k) if !k.is_empty() => Some(k.to_string()),
        _ => None,
    };
    let Json::Object(mut map) = doc else { return Vec::new() };
    let Some(Json::Array(items)) = map.remove("items") else { return Vec::new() };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Json::Object(mut obj) = item else {
            debug!(list = %list_kind, "skipping non-object list item");
            continue;
        };
        if let Some(kind) = &item_kind {
            if !obj.contains_key("kind") {
                obj.insert("kind".to_string(), Json::String(kind.clone()));
                if let Some(av) = &api_version {
                    obj.entry("apiVersion").or_insert_with(|| Json::String(av.clone()));
                }
            }
        }
        out.push(Json::Object(obj));
    }
    out
}
