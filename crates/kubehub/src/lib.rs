//! Hydra kubehub – the target API seam.
//!
//! [`TargetApi`] hands out per-type, per-namespace [`ResourceClient`]s exposing the three calls the
//! reconciler needs: get, create and status update. [`KubeTarget`] talks to a live API server
//! through kube-rs dynamic objects; [`MemoryTarget`] keeps everything in process.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use hydra_core::Gvk;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod memory;

pub use memory::{Call, CallKind, MemoryTarget};

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource type {0} is not served by the target")]
    UnknownType(Gvk),
    #[error("namespace required for namespaced kind {0}")]
    NamespaceRequired(Gvk),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Kube(kube::Error),
}

impl TargetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TargetError::NotFound(_))
    }

    /// The failure is about one object's scope, not the whole type; other records may still apply.
    pub fn is_record_scoped(&self) -> bool {
        matches!(self, TargetError::NamespaceRequired(_))
    }
}

impl From<kube::Error> for TargetError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => TargetError::NotFound(ae.message),
            other => TargetError::Kube(other),
        }
    }
}

/// Source of type-specific clients.
#[async_trait::async_trait]
pub trait TargetApi: Send + Sync {
    /// Client scoped to `gvk` and, for namespaced kinds, `namespace`.
    async fn resource(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Box<dyn ResourceClient>, TargetError>;
}

/// Calls against one resource type in one scope. Objects travel as JSON documents.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<Json, TargetError>;
    /// Create and return the server representation.
    async fn create(&self, obj: &Json) -> Result<Json, TargetError>;
    /// Replace the status subresource with `obj.status`.
    async fn update_status(&self, obj: &Json) -> Result<Json, TargetError>;
}

/// Live target reached through kube-rs. Resolved API resources are cached per GVK; unresolved
/// ones are asked again on every call since CRDs appear while hydration runs.
pub struct KubeTarget {
    client: Client,
    resolved: RwLock<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeTarget {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: RwLock::new(FxHashMap::default()) }
    }

    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("connecting to target API server")?;
        let version = client.apiserver_version().await.context("querying target API server version")?;
        info!(version = %version.git_version, "connected to target API server");
        Ok(Self::new(client))
    }

    async fn find_api_resource(&self, gvk: &Gvk) -> Result<(ApiResource, bool), TargetError> {
        if let Some(hit) = self.resolved.read().await.get(gvk) {
            return Ok(hit.clone());
        }
        let kgvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        match discovery::pinned_kind(&self.client, &kgvk).await {
            Ok((ar, caps)) => {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(gvk = %gvk, plural = %ar.plural, namespaced, "resolved api resource");
                self.resolved.write().await.insert(gvk.clone(), (ar.clone(), namespaced));
                Ok((ar, namespaced))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(TargetError::UnknownType(gvk.clone())),
            Err(kube::Error::Discovery(_)) => Err(TargetError::UnknownType(gvk.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl TargetApi for KubeTarget {
    async fn resource(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Box<dyn ResourceClient>, TargetError> {
        let (ar, namespaced) = self.find_api_resource(gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => return Err(TargetError::NamespaceRequired(gvk.clone())),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(Box::new(KubeResource { api }))
    }
}

struct KubeResource {
    api: Api<DynamicObject>,
}

fn to_json(obj: &DynamicObject) -> Result<Json, TargetError> {
    serde_json::to_value(obj).map_err(|e| TargetError::Rejected(format!("serializing DynamicObject: {}", e)))
}

fn object_name(obj: &Json) -> Result<&str, TargetError> {
    obj.pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TargetError::Rejected("object missing metadata.name".into()))
}

#[async_trait::async_trait]
impl ResourceClient for KubeResource {
    async fn get(&self, name: &str) -> Result<Json, TargetError> {
        let obj = self.api.get(name).await?;
        to_json(&obj)
    }

    async fn create(&self, obj: &Json) -> Result<Json, TargetError> {
        let dynamic: DynamicObject = serde_json::from_value(obj.clone())
            .map_err(|e| TargetError::Rejected(format!("decoding object: {}", e)))?;
        let created = self.api.create(&PostParams::default(), &dynamic).await?;
        to_json(&created)
    }

    async fn update_status(&self, obj: &Json) -> Result<Json, TargetError> {
        let name = object_name(obj)?;
        let data = serde_json::to_vec(obj).map_err(|e| TargetError::Rejected(format!("encoding status: {}", e)))?;
        let updated = self.api.replace_status(name, &PostParams::default(), data).await?;
        to_json(&updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("code {}", code), reason: "x".into(), code })
    }

    #[test]
    fn not_found_is_distinguished_from_other_failures() {
        assert!(TargetError::from(api_err(404)).is_not_found());
        assert!(!TargetError::from(api_err(409)).is_not_found());
        assert!(!TargetError::from(api_err(500)).is_not_found());
    }

    #[test]
    fn only_namespace_errors_are_record_scoped() {
        let gvk = Gvk::new("", "v1", "ConfigMap");
        assert!(TargetError::NamespaceRequired(gvk.clone()).is_record_scoped());
        assert!(!TargetError::UnknownType(gvk).is_record_scoped());
        assert!(!TargetError::from(api_err(503)).is_record_scoped());
    }

    #[test]
    fn object_name_requires_metadata_name() {
        assert_eq!(object_name(&serde_json::json!({"metadata": {"name": "n"}})).unwrap(), "n");
        assert!(object_name(&serde_json::json!({"metadata": {}})).is_err());
    }
}
