//! Server-assigned metadata stripping.

use serde_json::Value as Json;

/// Keys removed from every `metadata` mapping before a document is cached or applied.
pub const METADATA_KEYS_TO_DROP: [&str; 5] = ["creationTimestamp", "managedFields", "uid", "resourceVersion", "generation"];

/// Recursively drop server-generated metadata keys.
///
/// Descends into every mapping and sequence, so objects embedded in `*List` documents
/// are cleaned as well. Idempotent.
pub fn normalize(v: &mut Json) {
    match v {
        Json::Object(map) => {
            if let Some(Json::Object(meta)) = map.get_mut("metadata") {
                for key in METADATA_KEYS_TO_DROP {
                    meta.remove(key);
                }
            }
            for (_k, child) in map.iter_mut() {
                normalize(child);
            }
        }
        Json::Array(items) => {
            for child in items.iter_mut() {
                normalize(child);
            }
        }
        _ => {}
    }
}
