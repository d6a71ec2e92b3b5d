//! Special-cased cached types: Node address rewrite and the cluster service network.

use hydra_core::Gvk;
use k8s_openapi::api::core::v1::NodeAddress;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::ResourceCache;

pub const DEFAULT_SERVICE_NETWORK: &str = "172.30.0.0/16";

const HOSTNAME: &str = "Hostname";
const LOCALHOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("unable to find node resource in snapshot")]
    NoNodes,
    #[error("node {0} has no status")]
    MissingStatus(String),
    #[error("node {0} has no status.addresses list")]
    MissingAddresses(String),
    #[error("node {node}: malformed address entry: {reason}")]
    BadAddress { node: String, reason: String },
}

fn node_gvk() -> Gvk { Gvk::new("", "v1", "Node") }
fn network_gvk() -> Gvk { Gvk::new("config.openshift.io", "v1", "Network") }

fn rewritten_addresses(name: &str, body: &Json) -> Result<Json, ShapeError> {
    let status = body.get("status").filter(|s| s.is_object()).ok_or_else(|| ShapeError::MissingStatus(name.to_string()))?;
    let raw = status
        .get("addresses")
        .filter(|a| a.is_array())
        .ok_or_else(|| ShapeError::MissingAddresses(name.to_string()))?;
    let addresses: Vec<NodeAddress> = serde_json::from_value(raw.clone())
        .map_err(|e| ShapeError::BadAddress { node: name.to_string(), reason: e.to_string() })?;
    let mut out = vec![NodeAddress { address: LOCALHOST.to_string(), type_: HOSTNAME.to_string() }];
    out.extend(addresses.into_iter().filter(|a| a.type_ != HOSTNAME));
    serde_json::to_value(out).map_err(|e| ShapeError::BadAddress { node: name.to_string(), reason: e.to_string() })
}

/// Point every cached Node's hostname at localhost so log requests land on the local gateway.
/// IP addresses are kept. All nodes are validated before any is modified.
pub fn rewrite_node_addresses(cache: &mut ResourceCache) -> Result<usize, ShapeError> {
    let gvk = node_gvk();
    let nodes = cache.records_mut(&gvk).ok_or(ShapeError::NoNodes)?;
    let mut rewritten = Vec::with_capacity(nodes.len());
    for node in nodes.iter() {
        rewritten.push(rewritten_addresses(&node.name, &node.body)?);
    }
    let count = rewritten.len();
    for (node, addresses) in nodes.iter_mut().zip(rewritten) {
        if let Some(status) = node.body.get_mut("status").and_then(|s| s.as_object_mut()) {
            status.insert("addresses".to_string(), addresses);
        }
    }
    info!(nodes = count, "node addresses rewritten for local log access");
    Ok(count)
}

/// First `status.serviceNetwork` entry of the cached cluster Network config, or the default.
pub fn service_network(cache: &ResourceCache) -> String {
    let Ok(networks) = cache.lookup(&network_gvk(), &[]) else {
        debug!("no network config in snapshot; using default service network");
        return DEFAULT_SERVICE_NETWORK.to_string();
    };
    networks
        .iter()
        .find_map(|n| {
            n.body
                .pointer("/status/serviceNetwork/0")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| DEFAULT_SERVICE_NETWORK.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_core::{ExclusionTable, ResourceRecord};
    use serde_json::json;

    fn node(name: &str, status: Json) -> ResourceRecord {
        ResourceRecord::from_value(json!({ "apiVersion": "v1", "kind": "Node", "metadata": { "name": name }, "status": status })).unwrap()
    }

    #[test]
    fn hostname_replaced_with_localhost_and_ips_kept_in_order() {
        let mut c = ResourceCache::new(ExclusionTable::default());
        c.insert(node("node1", json!({ "addresses": [
            { "type": "Hostname", "address": "node1" },
            { "type": "InternalIP", "address": "10.0.0.5" }
        ]})));
        assert_eq!(rewrite_node_addresses(&mut c).unwrap(), 1);
        let n = &c.lookup(&node_gvk(), &["node1"]).unwrap()[0];
        assert_eq!(
            n.body["status"]["addresses"],
            json!([
                { "type": "Hostname", "address": "localhost" },
                { "type": "InternalIP", "address": "10.0.0.5" }
            ])
        );
    }

    #[test]
    fn shape_error_leaves_all_nodes_untouched() {
        let mut c = ResourceCache::new(ExclusionTable::default());
        let good = json!({ "addresses": [{ "type": "Hostname", "address": "a" }] });
        c.insert(node("a", good.clone()));
        c.insert(node("b", json!({ "phase": "Running" })));
        let err = rewrite_node_addresses(&mut c).unwrap_err();
        assert_eq!(err, ShapeError::MissingAddresses("b".into()));
        assert_eq!(c.lookup(&node_gvk(), &["a"]).unwrap()[0].body["status"], good);
    }

    #[test]
    fn missing_nodes_is_reported() {
        let mut c = ResourceCache::new(ExclusionTable::default());
        assert_eq!(rewrite_node_addresses(&mut c).unwrap_err(), ShapeError::NoNodes);
    }

    #[test]
    fn service_network_reads_status_or_defaults() {
        let mut c = ResourceCache::new(ExclusionTable::default());
        assert_eq!(service_network(&c), DEFAULT_SERVICE_NETWORK);
        c.insert(
            ResourceRecord::from_value(json!({
                "apiVersion": "config.openshift.io/v1", "kind": "Network",
                "metadata": { "name": "cluster" },
                "status": { "serviceNetwork": [] }
            }))
            .unwrap(),
        );
        assert_eq!(service_network(&c), DEFAULT_SERVICE_NETWORK);
        c.insert(
            ResourceRecord::from_value(json!({
                "apiVersion": "config.openshift.io/v1", "kind": "Network",
                "metadata": { "name": "other" },
                "status": { "serviceNetwork": ["10.96.0.0/12"] }
            }))
            .unwrap(),
        );
        assert_eq!(service_network(&c), "10.96.0.0/12");
    }
}
