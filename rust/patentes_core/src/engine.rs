//! `PermissionEngine`: the in-process boundary used by admin tooling and
//! authorization middleware. Composes the store, the cache, the aggregator
//! and the mutator; owns no global state.

use std::sync::Arc;

use crate::aggregate::compute_effective_permissions;
use crate::cache::{CacheStats, PermissionCache};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::graph::{find_cycles, resolve_family_closure, would_create_cycle};
use crate::mutate::AssignmentMutator;
use crate::store::GraphStore;
use crate::types::*;

pub struct PermissionEngine<S> {
    store: Arc<S>,
    cache: Arc<PermissionCache>,
    mutator: AssignmentMutator<S>,
}

impl<S: GraphStore> PermissionEngine<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        let cache = Arc::new(PermissionCache::new(&config.cache));
        let mutator = AssignmentMutator::new(Arc::clone(&store), Arc::clone(&cache), config.invalidation);
        Self {
            store,
            cache,
            mutator,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Effective permissions of `user`, served from cache when possible.
    pub fn get_effective_permissions(&self, user: &UserId) -> Result<Arc<EffectivePermissionSet>> {
        self.cache
            .get_or_compute(user, || compute_effective_permissions(&*self.store, user))
    }

    pub fn user_has_capability(&self, user: &UserId, capability: &CapabilityId) -> Result<bool> {
        Ok(self.get_effective_permissions(user)?.contains(capability))
    }

    pub fn would_create_cycle(&self, parent: &FamilyId, child: &FamilyId) -> Result<bool> {
        Ok(would_create_cycle(&*self.store, parent, child)?)
    }

    pub fn resolve_family_closure(&self, starts: &[FamilyId]) -> Result<Vec<FamilyId>> {
        let mut closure: Vec<FamilyId> =
            resolve_family_closure(&*self.store, starts.iter())?.into_iter().collect();
        closure.sort();
        Ok(closure)
    }

    /// Back edges of any cycle already present in the stored graph.
    pub fn audit_cycles(&self) -> Result<Vec<(FamilyId, FamilyId)>> {
        Ok(find_cycles(&*self.store)?)
    }

    /// Current version token, as a caller would read it at load time.
    pub fn version_of(&self, key: &VersionKey) -> Result<Option<VersionToken>> {
        Ok(self.store.fetch_version_token(key)?)
    }

    pub fn assign_families_to_user(
        &self,
        user: &UserId,
        families: &[FamilyId],
        expected: &VersionToken,
    ) -> Result<()> {
        self.mutator.assign_families_to_user(user, families, expected)
    }

    pub fn assign_capabilities_to_user(
        &self,
        user: &UserId,
        capabilities: &[CapabilityId],
        expected: &VersionToken,
    ) -> Result<()> {
        self.mutator
            .assign_capabilities_to_user(user, capabilities, expected)
    }

    pub fn assign_capabilities_to_family(
        &self,
        family: &FamilyId,
        capabilities: &[CapabilityId],
        expected: &VersionToken,
    ) -> Result<()> {
        self.mutator
            .assign_capabilities_to_family(family, capabilities, expected)
    }

    pub fn add_family_edge(&self, parent: &FamilyId, child: &FamilyId) -> Result<()> {
        self.mutator.add_family_edge(parent, child)
    }

    pub fn remove_family_edge(&self, parent: &FamilyId, child: &FamilyId) -> Result<()> {
        self.mutator.remove_family_edge(parent, child)
    }
}
