use crate::{catalog::CapabilityCode, models::ResourceRef, role::CapabilitySet};
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

struct CachedValue<T> {
    value: T,
    cached_at: Instant,
}

/// The only mutable shared structure on the decision hot path.
///
/// Holds the per-principal effective capability set and the per
/// (principal, resource) active-grant capability set, each expired against a
/// TTL. Every mutation path calls one of the `invalidate_*` methods
/// synchronously before returning, so a revoked privilege never outlives the
/// call that revoked it; a freshly granted one may stay invisible for up to
/// the TTL, which fails closed.
pub struct DecisionCache {
    ttl: Duration,
    role_capabilities: DashMap<Uuid, CachedValue<CapabilitySet>>,
    grant_capabilities: DashMap<(Uuid, ResourceRef), CachedValue<HashSet<CapabilityCode>>>,
}

impl DecisionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            role_capabilities: DashMap::new(),
            grant_capabilities: DashMap::new(),
        }
    }

    pub fn role_capabilities(&self, principal_id: Uuid) -> Option<CapabilitySet> {
        // The guard from `get` must be dropped before `remove` touches the
        // same shard.
        let stale = match self.role_capabilities.get(&principal_id) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                debug!(principal = %principal_id, "capability cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.role_capabilities.remove(&principal_id);
        }
        None
    }

    pub fn store_role_capabilities(&self, principal_id: Uuid, capabilities: CapabilitySet) {
        self.role_capabilities.insert(
            principal_id,
            CachedValue {
                value: capabilities,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn grant_capabilities(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
    ) -> Option<HashSet<CapabilityCode>> {
        let key = (principal_id, resource.clone());
        let stale = match self.grant_capabilities.get(&key) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                debug!(principal = %principal_id, %resource, "grant cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.grant_capabilities.remove(&key);
        }
        None
    }

    pub fn store_grant_capabilities(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
        capabilities: HashSet<CapabilityCode>,
    ) {
        self.grant_capabilities.insert(
            (principal_id, resource.clone()),
            CachedValue {
                value: capabilities,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop everything cached for a principal: its role capability set and
    /// all of its per-resource grant sets.
    pub fn invalidate_principal(&self, principal_id: Uuid) {
        debug!(principal = %principal_id, "invalidating principal cache entries");
        self.role_capabilities.remove(&principal_id);
        self.grant_capabilities
            .retain(|(principal, _), _| *principal != principal_id);
    }

    /// Drop every principal's cached grant set for one resource.
    pub fn invalidate_resource(&self, resource: &ResourceRef) {
        debug!(%resource, "invalidating resource cache entries");
        self.grant_capabilities
            .retain(|(_, cached), _| cached != resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_within_ttl() {
        let cache = DecisionCache::new(Duration::from_secs(300));
        let principal = Uuid::new_v4();
        cache.store_role_capabilities(principal, CapabilitySet::Wildcard);

        assert_eq!(
            cache.role_capabilities(principal),
            Some(CapabilitySet::Wildcard)
        );
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = DecisionCache::new(Duration::ZERO);
        let principal = Uuid::new_v4();
        cache.store_role_capabilities(principal, CapabilitySet::Wildcard);

        assert_eq!(cache.role_capabilities(principal), None);
    }

    #[test]
    fn test_invalidate_principal_drops_grant_entries_too() {
        let cache = DecisionCache::new(Duration::from_secs(300));
        let principal = Uuid::new_v4();
        let other = Uuid::new_v4();
        let resource = ResourceRef::new("pack", "pack-42");

        cache.store_role_capabilities(principal, CapabilitySet::empty());
        cache.store_grant_capabilities(principal, &resource, HashSet::new());
        cache.store_grant_capabilities(other, &resource, HashSet::new());

        cache.invalidate_principal(principal);

        assert!(cache.role_capabilities(principal).is_none());
        assert!(cache.grant_capabilities(principal, &resource).is_none());
        // Other principals untouched
        assert!(cache.grant_capabilities(other, &resource).is_some());
    }

    #[test]
    fn test_invalidate_resource() {
        let cache = DecisionCache::new(Duration::from_secs(300));
        let principal = Uuid::new_v4();
        let pack = ResourceRef::new("pack", "pack-42");
        let doc = ResourceRef::new("document", "doc-7");

        cache.store_grant_capabilities(principal, &pack, HashSet::new());
        cache.store_grant_capabilities(principal, &doc, HashSet::new());

        cache.invalidate_resource(&pack);

        assert!(cache.grant_capabilities(principal, &pack).is_none());
        assert!(cache.grant_capabilities(principal, &doc).is_some());
    }
}
