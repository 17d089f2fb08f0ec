//! Graph Store collaborator interface.
//!
//! The engine reads the four adjacency relations (user->family,
//! user->capability, family->capability, family->family) and writes them
//! only through [`GraphStore::persist_edge_change`], which must apply an
//! [`EdgeChange`] atomically: verify every guard, then apply every op and
//! bump every listed version key, or do nothing at all.
//!
//! Fetches for ids the store does not know return empty results; existence
//! is answered by `fetch_version_token`, `fetch_family` and
//! `fetch_capability`.

pub mod memory;

pub use memory::MemoryGraphStore;

use std::sync::Arc;

use crate::error::StoreResult;
use crate::types::*;

pub trait GraphStore: Send + Sync {
    fn fetch_direct_capabilities(&self, user: &UserId) -> StoreResult<Vec<CapabilityId>>;

    fn fetch_user_families(&self, user: &UserId) -> StoreResult<Vec<FamilyId>>;

    fn fetch_family_capabilities(&self, family: &FamilyId) -> StoreResult<Vec<CapabilityId>>;

    fn fetch_child_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>>;

    fn fetch_parent_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>>;

    /// Users with a direct membership edge to `family`.
    fn fetch_family_members(&self, family: &FamilyId) -> StoreResult<Vec<UserId>>;

    fn fetch_family(&self, family: &FamilyId) -> StoreResult<Option<FamilyRecord>>;

    fn fetch_capability(&self, capability: &CapabilityId)
        -> StoreResult<Option<CapabilityRecord>>;

    fn list_families(&self) -> StoreResult<Vec<FamilyId>>;

    /// Current token, or `None` if the entity does not exist.
    /// [`VersionKey::Graph`] always exists.
    fn fetch_version_token(&self, key: &VersionKey) -> StoreResult<Option<VersionToken>>;

    fn persist_edge_change(&self, change: &EdgeChange) -> StoreResult<()>;
}

impl<S: GraphStore + ?Sized> GraphStore for Arc<S> {
    fn fetch_direct_capabilities(&self, user: &UserId) -> StoreResult<Vec<CapabilityId>> {
        (**self).fetch_direct_capabilities(user)
    }

    fn fetch_user_families(&self, user: &UserId) -> StoreResult<Vec<FamilyId>> {
        (**self).fetch_user_families(user)
    }

    fn fetch_family_capabilities(&self, family: &FamilyId) -> StoreResult<Vec<CapabilityId>> {
        (**self).fetch_family_capabilities(family)
    }

    fn fetch_child_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>> {
        (**self).fetch_child_families(family)
    }

    fn fetch_parent_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>> {
        (**self).fetch_parent_families(family)
    }

    fn fetch_family_members(&self, family: &FamilyId) -> StoreResult<Vec<UserId>> {
        (**self).fetch_family_members(family)
    }

    fn fetch_family(&self, family: &FamilyId) -> StoreResult<Option<FamilyRecord>> {
        (**self).fetch_family(family)
    }

    fn fetch_capability(
        &self,
        capability: &CapabilityId,
    ) -> StoreResult<Option<CapabilityRecord>> {
        (**self).fetch_capability(capability)
    }

    fn list_families(&self) -> StoreResult<Vec<FamilyId>> {
        (**self).list_families()
    }

    fn fetch_version_token(&self, key: &VersionKey) -> StoreResult<Option<VersionToken>> {
        (**self).fetch_version_token(key)
    }

    fn persist_edge_change(&self, change: &EdgeChange) -> StoreResult<()> {
        (**self).persist_edge_change(change)
    }
}
