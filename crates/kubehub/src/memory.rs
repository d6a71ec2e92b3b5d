//! In-process target. Backs `--dry-run` and the reconciler tests: every call is recorded, and
//! individual types or objects can be made to fail.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hydra_core::Gvk;
use rustc_hash::FxHashSet;
use serde_json::Value as Json;

use crate::{ResourceClient, TargetApi, TargetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Resource,
    Get,
    Create,
    UpdateStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

type ObjectKey = (Gvk, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Json>,
    calls: Vec<Call>,
    unserved: FxHashSet<Gvk>,
    reject_create: FxHashSet<(Gvk, String)>,
    reject_status: FxHashSet<(Gvk, String)>,
    next_rv: u64,
}

/// Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTarget {
    pub fn new() -> Self { Self::default() }

    /// Make `resource()` fail for a type until [`MemoryTarget::serve`] is called.
    pub fn unserve(&self, gvk: &Gvk) { lock(&self.inner).unserved.insert(gvk.clone()); }
    pub fn serve(&self, gvk: &Gvk) { lock(&self.inner).unserved.remove(gvk); }

    pub fn reject_create(&self, gvk: &Gvk, name: &str, on: bool) {
        let key = (gvk.clone(), name.to_string());
        let mut g = lock(&self.inner);
        if on { g.reject_create.insert(key); } else { g.reject_create.remove(&key); }
    }

    pub fn reject_status(&self, gvk: &Gvk, name: &str, on: bool) {
        let key = (gvk.clone(), name.to_string());
        let mut g = lock(&self.inner);
        if on { g.reject_status.insert(key); } else { g.reject_status.remove(&key); }
    }

    /// Seed an object as if it already existed on the server.
    pub fn insert(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, obj: Json) {
        lock(&self.inner).objects.insert((gvk.clone(), namespace.map(|s| s.to_string()), name.to_string()), obj);
    }

    pub fn object(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Option<Json> {
        lock(&self.inner).objects.get(&(gvk.clone(), namespace.map(|s| s.to_string()), name.to_string())).cloned()
    }

    pub fn object_count(&self) -> usize { lock(&self.inner).objects.len() }

    pub fn calls(&self) -> Vec<Call> { lock(&self.inner).calls.clone() }

    pub fn count(&self, kind: CallKind) -> usize {
        lock(&self.inner).calls.iter().filter(|c| c.kind == kind).count()
    }

    pub fn clear_calls(&self) { lock(&self.inner).calls.clear(); }
}

#[async_trait::async_trait]
impl TargetApi for MemoryTarget {
    async fn resource(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Box<dyn ResourceClient>, TargetError> {
        let mut g = lock(&self.inner);
        g.calls.push(Call { kind: CallKind::Resource, gvk: gvk.clone(), namespace: namespace.map(|s| s.to_string()), name: None });
        if g.unserved.contains(gvk) {
            return Err(TargetError::UnknownType(gvk.clone()));
        }
        Ok(Box::new(MemoryResource { inner: Arc::clone(&self.inner), gvk: gvk.clone(), namespace: namespace.map(|s| s.to_string()) }))
    }
}

struct MemoryResource {
    inner: Arc<Mutex<Inner>>,
    gvk: Gvk,
    namespace: Option<String>,
}

impl MemoryResource {
    fn record(&self, g: &mut Inner, kind: CallKind, name: &str) {
        g.calls.push(Call { kind, gvk: self.gvk.clone(), namespace: self.namespace.clone(), name: Some(name.to_string()) });
    }

    fn key(&self, name: &str) -> ObjectKey {
        (self.gvk.clone(), self.namespace.clone(), name.to_string())
    }
}

fn name_of(obj: &Json) -> Result<String, TargetError> {
    obj.pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| TargetError::Rejected("object missing metadata.name".into()))
}

fn stamp(obj: &mut Json, rv: u64, uid: Option<String>) {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
        if let Some(uid) = uid {
            meta.insert("uid".into(), Json::String(uid));
        }
    }
}

#[async_trait::async_trait]
impl ResourceClient for MemoryResource {
    async fn get(&self, name: &str) -> Result<Json, TargetError> {
        let mut g = lock(&self.inner);
        self.record(&mut g, CallKind::Get, name);
        g.objects.get(&self.key(name)).cloned().ok_or_else(|| TargetError::NotFound(format!("{} {}", self.gvk, name)))
    }

    async fn create(&self, obj: &Json) -> Result<Json, TargetError> {
        let name = name_of(obj)?;
        let mut g = lock(&self.inner);
        self.record(&mut g, CallKind::Create, &name);
        if g.reject_create.contains(&(self.gvk.clone(), name.clone())) {
            return Err(TargetError::Rejected(format!("create of {} {} refused", self.gvk, name)));
        }
        let key = self.key(&name);
        if g.objects.contains_key(&key) {
            return Err(TargetError::Rejected(format!("{} {} already exists", self.gvk, name)));
        }
        g.next_rv += 1;
        let rv = g.next_rv;
        let mut stored = obj.clone();
        // status is only writable through the status subresource
        if let Some(map) = stored.as_object_mut() {
            map.remove("status");
        }
        stamp(&mut stored, rv, Some(format!("mem-{}", rv)));
        g.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_status(&self, obj: &Json) -> Result<Json, TargetError> {
        let name = name_of(obj)?;
        let mut g = lock(&self.inner);
        self.record(&mut g, CallKind::UpdateStatus, &name);
        if g.reject_status.contains(&(self.gvk.clone(), name.clone())) {
            return Err(TargetError::Rejected(format!("status update of {} {} refused", self.gvk, name)));
        }
        g.next_rv += 1;
        let rv = g.next_rv;
        let status = obj.get("status").cloned().unwrap_or(Json::Null);
        let Some(stored) = g.objects.get_mut(&self.key(&name)) else {
            return Err(TargetError::NotFound(format!("{} {}", self.gvk, name)));
        };
        if let Some(map) = stored.as_object_mut() {
            map.insert("status".into(), status);
        }
        stamp(stored, rv, None);
        Ok(stored.clone())
    }
}
