//! Log path index: canonical `/containerLogs/{ns}/{pod}/{container}` request paths to captured log files.

use std::path::{Component, Path, PathBuf};

use rustc_hash::FxHashMap;

/// File name of a captured container log in a snapshot.
pub const LOG_FILE_NAME: &str = "current.log";

const NAMESPACES_DIR: &str = "namespaces";
// namespaces/<ns>/pods/<pod>/<container>/<container>/logs/current.log
const SEGMENTS_AFTER_MARKER: usize = 7;

/// Write-once, read-many map. Built during load; shared behind an `Arc` afterwards.
#[derive(Debug, Clone, Default)]
pub struct LogPathIndex {
    entries: FxHashMap<String, PathBuf>,
}

impl LogPathIndex {
    pub fn new() -> Self { Self::default() }

    /// Derive the request path for a log file, given its path relative to the snapshot root.
    /// Paths that do not match the expected layout yield `None`.
    pub fn request_path_for(rel: &Path) -> Option<String> {
        if rel.file_name()?.to_str()? != LOG_FILE_NAME {
            return None;
        }
        let parts = rel
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<&str>>>()?;
        let marker = parts.iter().position(|p| *p == NAMESPACES_DIR)?;
        let rest = &parts[marker + 1..];
        if rest.len() != SEGMENTS_AFTER_MARKER {
            return None;
        }
        Some(format!("/containerLogs/{}/{}/{}", rest[0], rest[2], rest[3]))
    }

    /// Register `file` if `rel` matches the layout. Returns the request path on success.
    pub fn register(&mut self, rel: &Path, file: PathBuf) -> Option<String> {
        let key = Self::request_path_for(rel)?;
        self.entries.insert(key.clone(), file);
        Some(key)
    }

    pub fn resolve(&self, request_path: &str) -> Option<&Path> {
        self.entries.get(request_path).map(|p| p.as_path())
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Entries sorted by request path.
    pub fn entries(&self) -> Vec<(&str, &Path)> {
        let mut out: Vec<(&str, &Path)> = self.entries.iter().map(|(k, v)| (k.as_str(), v.as_path())).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}
