// Local KV engine backing the replicated store.
//
// An ordered in-memory map with per-entry TTL. Ordering matters: snapshot
// checksums are computed over entries in iteration order, so every peer must
// iterate identically. Durability comes from the log engine's snapshots plus
// log replay, not from this engine.
//
// Maintenance (TTL sweep, compaction, disk-usage check) is exposed as
// methods; the owning peer schedules them on its task group.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::common::now;
use crate::error::{PlatformError, Result};

const DEFAULT_DISK_BUDGET_MB: u64 = 10 * 1024;
const DISK_WARNING_FRAC: f64 = 0.80;
const DISK_CRITICAL_FRAC: f64 = 0.95;

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn is_expired(&self, at: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if at >= exp)
    }
}

/// One operation in an atomic write batch.
#[derive(Debug, Clone)]
pub enum KvOp {
    Put {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

impl KvOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        KvOp::Put {
            key: key.into(),
            value,
            ttl: None,
        }
    }

    pub fn put_ttl(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        KvOp::Put {
            key: key.into(),
            value,
            ttl: Some(ttl),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvOp::Delete { key: key.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskPressure {
    Normal,
    Warning,
    Critical,
}

pub struct KvEngine {
    map: RwLock<BTreeMap<String, KvEntry>>,
    /// Set when disk usage crosses the critical threshold; writes are
    /// refused until pressure clears.
    read_only: AtomicBool,
    data_dir: PathBuf,
    disk_budget_mb: u64,
}

impl KvEngine {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            read_only: AtomicBool::new(false),
            data_dir: data_dir.into(),
            disk_budget_mb: DEFAULT_DISK_BUDGET_MB,
        }
    }

    pub fn with_disk_budget_mb(mut self, budget: u64) -> Self {
        self.disk_budget_mb = budget;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(PlatformError::Storage(
                "store is read-only: disk usage critical".into(),
            ));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let map = self.map.read();
        let entry = map.get(key)?;
        if entry.is_expired(now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) -> Result<()> {
        self.apply_batch(vec![KvOp::put(key, value)])
    }

    pub fn put_with_ttl(&self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.apply_batch(vec![KvOp::put_ttl(key, value, ttl)])
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.apply_batch(vec![KvOp::delete(key)])
    }

    /// Apply a batch under one write lock. Either every op lands or, on a
    /// read-only store, none do.
    pub fn apply_batch(&self, ops: Vec<KvOp>) -> Result<()> {
        self.check_writable()?;
        let at = now();
        let mut map = self.map.write();
        for op in ops {
            match op {
                KvOp::Put { key, value, ttl } => {
                    map.insert(
                        key,
                        KvEntry {
                            value,
                            expires_at: ttl.map(|t| at + t),
                        },
                    );
                }
                KvOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// All live `(key, value)` pairs with the given prefix, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let at = now();
        let map = self.map.read();
        map.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(at))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Full live image in key order, for snapshots.
    pub fn export_all(&self) -> Vec<(String, Vec<u8>)> {
        let at = now();
        let map = self.map.read();
        map.iter()
            .filter(|(_, e)| !e.is_expired(at))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Atomically replace the full image (snapshot restore).
    pub fn clear_and_load(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        self.check_writable()?;
        let mut map = self.map.write();
        map.clear();
        for (key, value) in entries {
            map.insert(
                key,
                KvEntry {
                    value,
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        let at = now();
        self.map.read().values().filter(|e| !e.is_expired(at)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Returns how many were collected.
    pub fn sweep_expired(&self) -> usize {
        let at = now();
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, e| !e.is_expired(at));
        before - map.len()
    }

    /// Hourly compaction. The tree has no tombstone slack to reclaim, so
    /// this is a sweep plus a size report.
    pub fn compact(&self) -> usize {
        let swept = self.sweep_expired();
        let len = self.map.read().len();
        tracing::debug!(entries = len, swept, "kv compaction pass");
        swept
    }

    /// Check data-dir usage against the configured budget. On critical the
    /// store flips read-only; writes resume once pressure clears.
    pub fn check_disk_usage(&self) -> DiskPressure {
        let used_mb = dir_size_bytes(&self.data_dir) / (1024 * 1024);
        let frac = used_mb as f64 / self.disk_budget_mb as f64;
        let pressure = if frac >= DISK_CRITICAL_FRAC {
            DiskPressure::Critical
        } else if frac >= DISK_WARNING_FRAC {
            DiskPressure::Warning
        } else {
            DiskPressure::Normal
        };
        match pressure {
            DiskPressure::Critical => {
                error!(used_mb, budget_mb = self.disk_budget_mb, "disk usage critical, refusing writes");
                self.read_only.store(true, Ordering::Release);
            }
            DiskPressure::Warning => {
                warn!(used_mb, budget_mb = self.disk_budget_mb, "disk usage above warning threshold");
                self.read_only.store(false, Ordering::Release);
            }
            DiskPressure::Normal => {
                self.read_only.store(false, Ordering::Release);
            }
        }
        pressure
    }
}

fn dir_size_bytes(path: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size_bytes(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = KvEngine::new("/tmp/hivedb-test");
        kv.put("tenant:a", b"1".to_vec()).unwrap();
        assert_eq!(kv.get("tenant:a"), Some(b"1".to_vec()));
        kv.delete("tenant:a").unwrap();
        assert_eq!(kv.get("tenant:a"), None);
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let kv = KvEngine::new("/tmp/hivedb-test");
        kv.put_with_ttl("token:x", b"t".to_vec(), Duration::milliseconds(-1))
            .unwrap();
        assert_eq!(kv.get("token:x"), None);
        assert_eq!(kv.sweep_expired(), 1);
    }

    #[test]
    fn test_scan_prefix_ordered() {
        let kv = KvEngine::new("/tmp/hivedb-test");
        kv.put("node:b", b"2".to_vec()).unwrap();
        kv.put("node:a", b"1".to_vec()).unwrap();
        kv.put("tenant:z", b"3".to_vec()).unwrap();
        let nodes = kv.scan_prefix("node:");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].0, "node:a");
        assert_eq!(nodes[1].0, "node:b");
    }

    #[test]
    fn test_clear_and_load_replaces_image() {
        let kv = KvEngine::new("/tmp/hivedb-test");
        kv.put("old", b"x".to_vec()).unwrap();
        kv.clear_and_load(vec![("new".to_string(), b"y".to_vec())])
            .unwrap();
        assert_eq!(kv.get("old"), None);
        assert_eq!(kv.get("new"), Some(b"y".to_vec()));
    }

    #[test]
    fn test_batch_is_atomic_per_lock() {
        let kv = KvEngine::new("/tmp/hivedb-test");
        kv.apply_batch(vec![
            KvOp::put("tenant:a", b"1".to_vec()),
            KvOp::put("tenant_domain:a.example.com", b"a".to_vec()),
        ])
        .unwrap();
        assert!(kv.contains("tenant:a"));
        assert!(kv.contains("tenant_domain:a.example.com"));
    }
}
