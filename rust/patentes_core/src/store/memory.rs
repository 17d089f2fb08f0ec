//! In-memory [`GraphStore`] backed by `ahash` maps under one `RwLock`.
//!
//! Reads take the shared lock; `persist_edge_change` takes the exclusive lock
//! for the whole guard-check/apply/bump sequence, which is what makes the
//! change atomic.

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use super::GraphStore;
use crate::error::{StoreError, StoreResult};
use crate::types::*;

#[derive(Debug, Default)]
struct GraphState {
    users: AHashMap<UserId, String>,
    families: AHashMap<FamilyId, String>,
    capabilities: AHashMap<CapabilityId, String>,
    memberships: AHashMap<UserId, AHashSet<FamilyId>>,
    members: AHashMap<FamilyId, AHashSet<UserId>>,
    user_grants: AHashMap<UserId, AHashSet<CapabilityId>>,
    family_grants: AHashMap<FamilyId, AHashSet<CapabilityId>>,
    children: AHashMap<FamilyId, AHashSet<FamilyId>>,
    parents: AHashMap<FamilyId, AHashSet<FamilyId>>,
    versions: AHashMap<VersionKey, u64>,
    /// Global counter so a token is never reused for any key.
    next_version: u64,
}

fn link<K, V>(index: &mut AHashMap<K, AHashSet<V>>, key: &K, value: &V)
where
    K: std::hash::Hash + Eq + Clone,
    V: std::hash::Hash + Eq + Clone,
{
    index.entry(key.clone()).or_default().insert(value.clone());
}

fn unlink<K, V>(index: &mut AHashMap<K, AHashSet<V>>, key: &K, value: &V)
where
    K: std::hash::Hash + Eq,
    V: std::hash::Hash + Eq,
{
    if let Some(set) = index.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

fn listed<K, V>(index: &AHashMap<K, AHashSet<V>>, key: &K) -> Vec<V>
where
    K: std::hash::Hash + Eq,
    V: Clone,
{
    index
        .get(key)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default()
}

impl GraphState {
    fn bump(&mut self, key: VersionKey) {
        self.next_version += 1;
        self.versions.insert(key, self.next_version);
    }

    fn exists(&self, key: &VersionKey) -> bool {
        match key {
            VersionKey::User(id) => self.users.contains_key(id),
            VersionKey::Family(id) => self.families.contains_key(id),
            VersionKey::Graph => true,
        }
    }

    fn token(&self, key: &VersionKey) -> Option<VersionToken> {
        if !self.exists(key) {
            return None;
        }
        let counter = self.versions.get(key).copied().unwrap_or(0);
        Some(VersionToken::from_counter(counter))
    }

    fn require_user(&self, id: &UserId) -> StoreResult<()> {
        if self.users.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::Missing(EntityRef::User(id.clone())))
        }
    }

    fn require_family(&self, id: &FamilyId) -> StoreResult<()> {
        if self.families.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::Missing(EntityRef::Family(id.clone())))
        }
    }

    fn require_capability(&self, id: &CapabilityId) -> StoreResult<()> {
        if self.capabilities.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::Missing(EntityRef::Capability(id.clone())))
        }
    }

    /// Insertions must reference known entities; removals need not.
    fn check_op(&self, op: &EdgeOp) -> StoreResult<()> {
        match op {
            EdgeOp::AddMembership { user, family } => {
                self.require_user(user)?;
                self.require_family(family)
            }
            EdgeOp::AddUserGrant { user, capability } => {
                self.require_user(user)?;
                self.require_capability(capability)
            }
            EdgeOp::AddFamilyGrant { family, capability } => {
                self.require_family(family)?;
                self.require_capability(capability)
            }
            EdgeOp::AddFamilyEdge { parent, child } => {
                self.require_family(parent)?;
                self.require_family(child)
            }
            EdgeOp::RemoveMembership { .. }
            | EdgeOp::RemoveUserGrant { .. }
            | EdgeOp::RemoveFamilyGrant { .. }
            | EdgeOp::RemoveFamilyEdge { .. } => Ok(()),
        }
    }

    fn apply(&mut self, op: &EdgeOp) {
        match op {
            EdgeOp::AddMembership { user, family } => {
                link(&mut self.memberships, user, family);
                link(&mut self.members, family, user);
            }
            EdgeOp::RemoveMembership { user, family } => {
                unlink(&mut self.memberships, user, family);
                unlink(&mut self.members, family, user);
            }
            EdgeOp::AddUserGrant { user, capability } => {
                link(&mut self.user_grants, user, capability)
            }
            EdgeOp::RemoveUserGrant { user, capability } => {
                unlink(&mut self.user_grants, user, capability)
            }
            EdgeOp::AddFamilyGrant { family, capability } => {
                link(&mut self.family_grants, family, capability)
            }
            EdgeOp::RemoveFamilyGrant { family, capability } => {
                unlink(&mut self.family_grants, family, capability)
            }
            EdgeOp::AddFamilyEdge { parent, child } => {
                link(&mut self.children, parent, child);
                link(&mut self.parents, child, parent);
            }
            EdgeOp::RemoveFamilyEdge { parent, child } => {
                unlink(&mut self.children, parent, child);
                unlink(&mut self.parents, child, parent);
            }
        }
    }
}

/// In-memory graph store. Cheap to construct; intended for tests, fixtures
/// and read-only CLI sessions over a JSON snapshot.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: RwLock<GraphState>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot. Edges are inserted verbatim.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let store = Self::new();
        store.load_snapshot(snapshot);
        store
    }

    /// Merge a snapshot into the store, bypassing guards and validation.
    pub fn load_snapshot(&self, snapshot: &GraphSnapshot) {
        let mut state = self.state.write();
        for (id, name) in &snapshot.users {
            state.users.insert(id.clone(), name.clone());
            state.bump(VersionKey::User(id.clone()));
        }
        for (id, name) in &snapshot.families {
            state.families.insert(id.clone(), name.clone());
            state.bump(VersionKey::Family(id.clone()));
        }
        for (id, name) in &snapshot.capabilities {
            state.capabilities.insert(id.clone(), name.clone());
        }
        for (user, family) in &snapshot.memberships {
            state.apply(&EdgeOp::AddMembership {
                user: user.clone(),
                family: family.clone(),
            });
        }
        for (user, capability) in &snapshot.user_grants {
            state.apply(&EdgeOp::AddUserGrant {
                user: user.clone(),
                capability: capability.clone(),
            });
        }
        for (family, capability) in &snapshot.family_grants {
            state.apply(&EdgeOp::AddFamilyGrant {
                family: family.clone(),
                capability: capability.clone(),
            });
        }
        for (parent, child) in &snapshot.family_edges {
            state.apply(&EdgeOp::AddFamilyEdge {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        state.bump(VersionKey::Graph);
    }

    pub fn insert_user(&self, id: impl Into<UserId>, name: impl Into<String>) -> UserId {
        let id = id.into();
        let mut state = self.state.write();
        state.users.insert(id.clone(), name.into());
        state.bump(VersionKey::User(id.clone()));
        id
    }

    pub fn insert_family(&self, id: impl Into<FamilyId>, name: impl Into<String>) -> FamilyId {
        let id = id.into();
        let mut state = self.state.write();
        state.families.insert(id.clone(), name.into());
        state.bump(VersionKey::Family(id.clone()));
        id
    }

    pub fn insert_capability(
        &self,
        id: impl Into<CapabilityId>,
        name: impl Into<String>,
    ) -> CapabilityId {
        let id = id.into();
        self.state
            .write()
            .capabilities
            .insert(id.clone(), name.into());
        id
    }

    /// Write a parent/child edge without any guard. Only for building
    /// fixtures, including deliberately corrupt (cyclic) ones.
    pub fn insert_family_edge_unchecked(&self, parent: &FamilyId, child: &FamilyId) {
        self.state.write().apply(&EdgeOp::AddFamilyEdge {
            parent: parent.clone(),
            child: child.clone(),
        });
    }
}

impl GraphStore for MemoryGraphStore {
    fn fetch_direct_capabilities(&self, user: &UserId) -> StoreResult<Vec<CapabilityId>> {
        Ok(listed(&self.state.read().user_grants, user))
    }

    fn fetch_user_families(&self, user: &UserId) -> StoreResult<Vec<FamilyId>> {
        Ok(listed(&self.state.read().memberships, user))
    }

    fn fetch_family_capabilities(&self, family: &FamilyId) -> StoreResult<Vec<CapabilityId>> {
        Ok(listed(&self.state.read().family_grants, family))
    }

    fn fetch_child_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>> {
        Ok(listed(&self.state.read().children, family))
    }

    fn fetch_parent_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>> {
        Ok(listed(&self.state.read().parents, family))
    }

    fn fetch_family_members(&self, family: &FamilyId) -> StoreResult<Vec<UserId>> {
        Ok(listed(&self.state.read().members, family))
    }

    fn fetch_family(&self, family: &FamilyId) -> StoreResult<Option<FamilyRecord>> {
        Ok(self
            .state
            .read()
            .families
            .get(family)
            .map(|name| FamilyRecord {
                id: family.clone(),
                name: name.clone(),
            }))
    }

    fn fetch_capability(
        &self,
        capability: &CapabilityId,
    ) -> StoreResult<Option<CapabilityRecord>> {
        Ok(self
            .state
            .read()
            .capabilities
            .get(capability)
            .map(|name| CapabilityRecord {
                id: capability.clone(),
                name: name.clone(),
            }))
    }

    fn list_families(&self) -> StoreResult<Vec<FamilyId>> {
        Ok(self.state.read().families.keys().cloned().collect())
    }

    fn fetch_version_token(&self, key: &VersionKey) -> StoreResult<Option<VersionToken>> {
        Ok(self.state.read().token(key))
    }

    fn persist_edge_change(&self, change: &EdgeChange) -> StoreResult<()> {
        let mut state = self.state.write();

        for guard in &change.guards {
            let actual = state.token(&guard.key);
            if actual.as_ref() != Some(&guard.expected) {
                return Err(StoreError::VersionMismatch {
                    key: guard.key.clone(),
                    expected: guard.expected.clone(),
                    actual,
                });
            }
        }
        for op in &change.ops {
            state.check_op(op)?;
        }

        for op in &change.ops {
            state.apply(op);
        }
        for key in &change.bumps {
            state.bump(key.clone());
        }
        Ok(())
    }
}
