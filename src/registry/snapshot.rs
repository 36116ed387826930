// Versioned snapshot file format for the replicated KV.
//
// UTF-8 JSON with base64 entry bytes and a CRC32 checksum computed over the
// concatenated raw key || value bytes in entries order. Loaders reject
// snapshots newer than the current version and migrate older ones through a
// registered chain of n -> n+1 upgraders before verifying the checksum.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::common::now;
use crate::error::{PlatformError, Result};

/// Current on-disk snapshot version.
pub const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// base64-encoded key bytes
    pub key: String,
    /// base64-encoded value bytes
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub node_id: String,
    /// 8 lowercase hex chars of CRC32; absent in pre-checksum snapshots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub entries: Vec<SnapshotEntry>,
}

/// CRC32 over concatenated raw key || value bytes in entries order.
pub fn compute_checksum<'a>(entries: impl Iterator<Item = (&'a [u8], &'a [u8])>) -> String {
    let mut hasher = crc32fast::Hasher::new();
    for (key, value) in entries {
        hasher.update(key);
        hasher.update(value);
    }
    format!("{:08x}", hasher.finalize())
}

/// Serialize the full KV image at the current version.
pub fn build(entries: &[(String, Vec<u8>)], node_id: &str) -> Result<Vec<u8>> {
    let checksum = compute_checksum(entries.iter().map(|(k, v)| (k.as_bytes(), v.as_slice())));
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        created_at: now(),
        node_id: node_id.to_string(),
        checksum: Some(checksum),
        entries: entries
            .iter()
            .map(|(k, v)| SnapshotEntry {
                key: B64.encode(k.as_bytes()),
                value: B64.encode(v),
            })
            .collect(),
    };
    serde_json::to_vec(&file).map_err(|e| PlatformError::Serialization(e.to_string()))
}

/// Migrates raw snapshot JSON from one version to the next.
pub type Migrator = fn(Value) -> Result<Value>;

/// Decodes snapshot files, upgrading older versions on the way in.
pub struct SnapshotLoader {
    migrators: BTreeMap<u32, Migrator>,
}

impl SnapshotLoader {
    /// Loader with the built-in upgrade chain registered.
    pub fn new() -> Self {
        let mut loader = Self {
            migrators: BTreeMap::new(),
        };
        loader.register(1, migrate_v1_to_v2);
        loader
    }

    /// Register an upgrader taking `from_version` to `from_version + 1`.
    pub fn register(&mut self, from_version: u32, migrator: Migrator) {
        self.migrators.insert(from_version, migrator);
    }

    /// Decode, migrate, and verify a snapshot; returns the raw KV image.
    pub fn load(&self, bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
        let mut raw: Value = serde_json::from_slice(bytes)
            .map_err(|e| PlatformError::Serialization(format!("snapshot decode: {}", e)))?;

        let mut version = raw
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| PlatformError::Serialization("snapshot missing version".into()))?
            as u32;

        if version > SNAPSHOT_VERSION {
            return Err(PlatformError::SnapshotVersion {
                found: version,
                supported: SNAPSHOT_VERSION,
            });
        }

        while version < SNAPSHOT_VERSION {
            let migrator = self.migrators.get(&version).ok_or_else(|| {
                PlatformError::SnapshotVersion {
                    found: version,
                    supported: SNAPSHOT_VERSION,
                }
            })?;
            raw = migrator(raw)?;
            version += 1;
            info!(version, "migrated snapshot");
        }

        let file: SnapshotFile = serde_json::from_value(raw)
            .map_err(|e| PlatformError::Serialization(format!("snapshot decode: {}", e)))?;

        let mut entries = Vec::with_capacity(file.entries.len());
        for entry in &file.entries {
            let key = B64
                .decode(&entry.key)
                .map_err(|e| PlatformError::Serialization(format!("snapshot key: {}", e)))?;
            let value = B64
                .decode(&entry.value)
                .map_err(|e| PlatformError::Serialization(format!("snapshot value: {}", e)))?;
            let key = String::from_utf8(key)
                .map_err(|e| PlatformError::Serialization(format!("snapshot key utf8: {}", e)))?;
            entries.push((key, value));
        }

        if let Some(expected) = &file.checksum {
            let computed =
                compute_checksum(entries.iter().map(|(k, v)| (k.as_bytes(), v.as_slice())));
            if &computed != expected {
                return Err(PlatformError::Checksum {
                    expected: expected.clone(),
                    computed,
                });
            }
        }

        Ok(entries)
    }
}

impl Default for SnapshotLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// v1 snapshots carried entries as `{"k": …, "v": …}` and no checksum.
fn migrate_v1_to_v2(mut raw: Value) -> Result<Value> {
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| PlatformError::Serialization("snapshot not an object".into()))?;
    if let Some(entries) = obj.get_mut("entries").and_then(Value::as_array_mut) {
        for entry in entries {
            if let Some(e) = entry.as_object_mut() {
                if let Some(k) = e.remove("k") {
                    e.insert("key".to_string(), k);
                }
                if let Some(v) = e.remove("v") {
                    e.insert("value".to_string(), v);
                }
            }
        }
    }
    obj.insert("version".to_string(), Value::from(2u32));
    if !obj.contains_key("nodeId") {
        obj.insert("nodeId".to_string(), Value::from("unknown"));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> Vec<(String, Vec<u8>)> {
        vec![
            ("tenant:a".to_string(), b"alpha".to_vec()),
            ("tenant:b".to_string(), b"beta".to_vec()),
        ]
    }

    #[test]
    fn test_round_trip() {
        let bytes = build(&image(), "cp-1").unwrap();
        let loaded = SnapshotLoader::new().load(&bytes).unwrap();
        assert_eq!(loaded, image());
    }

    #[test]
    fn test_tampered_entries_rejected() {
        let bytes = build(&image(), "cp-1").unwrap();
        let mut raw: Value = serde_json::from_slice(&bytes).unwrap();
        raw["entries"][0]["value"] = Value::from(B64.encode(b"tampered"));
        let tampered = serde_json::to_vec(&raw).unwrap();
        let err = SnapshotLoader::new().load(&tampered).unwrap_err();
        assert!(matches!(err, PlatformError::Checksum { .. }));
    }

    #[test]
    fn test_newer_version_rejected() {
        let bytes = build(&image(), "cp-1").unwrap();
        let mut raw: Value = serde_json::from_slice(&bytes).unwrap();
        raw["version"] = Value::from(SNAPSHOT_VERSION + 1);
        let err = SnapshotLoader::new()
            .load(&serde_json::to_vec(&raw).unwrap())
            .unwrap_err();
        assert!(matches!(err, PlatformError::SnapshotVersion { .. }));
    }

    #[test]
    fn test_v1_migration() {
        let v1 = serde_json::json!({
            "version": 1,
            "createdAt": "2026-01-01T00:00:00Z",
            "entries": [
                {"k": B64.encode(b"tenant:a"), "v": B64.encode(b"alpha")},
            ],
        });
        let loaded = SnapshotLoader::new()
            .load(&serde_json::to_vec(&v1).unwrap())
            .unwrap();
        assert_eq!(loaded, vec![("tenant:a".to_string(), b"alpha".to_vec())]);
    }
}
