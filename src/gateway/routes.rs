// Advisory route cache: extraction key -> (tenant id, worker address).
//
// Entries live for a short TTL and are invalidated on upstream 5xx, on
// `tenant.migrating` broadcasts, and on proxy errors. Losing an entry is
// harmless because the control plane stays authoritative.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::common::TenantId;

pub const ROUTE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub tenant_id: TenantId,
    pub node_address: String,
    pub cached_at: Instant,
}

pub struct RouteCache {
    entries: RwLock<HashMap<String, RouteEntry>>,
    ttl: Duration,
}

impl RouteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<RouteEntry> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it on the way out.
        self.entries.write().remove(key);
        None
    }

    pub fn insert(&self, key: impl Into<String>, tenant_id: TenantId, node_address: String) {
        self.entries.write().insert(
            key.into(),
            RouteEntry {
                tenant_id,
                node_address,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop every entry pointing at this tenant (the extraction key may
    /// differ from the tenant id).
    pub fn invalidate_tenant(&self, tenant_id: &TenantId) {
        self.entries
            .write()
            .retain(|_, entry| &entry.tenant_id != tenant_id);
    }

    /// Drop every entry routed to this address.
    pub fn invalidate_address(&self, address: &str) {
        self.entries
            .write()
            .retain(|_, entry| entry.node_address != address);
    }

    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new(ROUTE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_ttl_expiry() {
        let cache = RouteCache::new(Duration::from_millis(40));
        cache.insert(
            "t1.example.com",
            "ten_1".to_string(),
            "http://10.0.0.5:8091".to_string(),
        );
        assert_eq!(
            cache.get("t1.example.com").unwrap().node_address,
            "http://10.0.0.5:8091"
        );
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("t1.example.com").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_by_tenant_and_address() {
        let cache = RouteCache::default();
        cache.insert("a.example.com", "ten_a".to_string(), "http://n1".to_string());
        cache.insert("ten_a", "ten_a".to_string(), "http://n1".to_string());
        cache.insert("b.example.com", "ten_b".to_string(), "http://n2".to_string());

        cache.invalidate_tenant(&"ten_a".to_string());
        assert!(cache.get("a.example.com").is_none());
        assert!(cache.get("ten_a").is_none());
        assert!(cache.get("b.example.com").is_some());

        cache.invalidate_address("http://n2");
        assert!(cache.is_empty());
    }
}
