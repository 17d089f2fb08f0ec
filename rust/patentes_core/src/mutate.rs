//! Assignment Mutator: optimistic-concurrency edits of the four edge sets.
//!
//! Every operation walks Loaded -> Validating -> Committing -> Committed,
//! or drops to Rejected on the first failed check with nothing written.
//! The version check runs twice: once up front for a cheap rejection, and
//! again inside the store's atomic `persist_edge_change` as a guard, so two
//! racing mutations of the same target can never both commit.
//!
//! Structural edits of the family graph are guarded by the global
//! [`VersionKey::Graph`] token read at load time, which serializes them
//! against each other; the cycle check therefore always runs against the
//! graph that the write lands on.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use ahash::AHashSet;

use crate::cache::PermissionCache;
use crate::config::InvalidationStrategy;
use crate::error::{PermissionError, Result, StoreError};
use crate::graph::{collect_ancestors, would_create_cycle};
use crate::store::GraphStore;
use crate::types::*;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MutationState {
    Loaded,
    Validating,
    Committing,
    Committed,
    Rejected,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationState::Loaded => "loaded",
            MutationState::Validating => "validating",
            MutationState::Committing => "committing",
            MutationState::Committed => "committed",
            MutationState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Tracks one mutation through its state machine.
#[derive(Debug)]
pub struct Mutation {
    operation: &'static str,
    target: VersionKey,
    state: MutationState,
}

impl Mutation {
    fn new(operation: &'static str, target: VersionKey) -> Self {
        tracing::debug!(operation, target = %target, state = %MutationState::Loaded, "mutation");
        Self {
            operation,
            target,
            state: MutationState::Loaded,
        }
    }

    fn advance(&mut self, next: MutationState) {
        tracing::debug!(
            operation = self.operation,
            target = %self.target,
            from = %self.state,
            to = %next,
            "mutation"
        );
        self.state = next;
    }

    pub fn state(&self) -> MutationState {
        self.state
    }
}

/// What a committed change requires of the cache.
enum Invalidation {
    Nothing,
    User(UserId),
    /// Members of these families (ancestor-or-self of the edit) may be stale.
    Families(AHashSet<FamilyId>),
}

pub struct AssignmentMutator<S> {
    store: Arc<S>,
    cache: Arc<PermissionCache>,
    strategy: InvalidationStrategy,
}

impl<S: GraphStore> AssignmentMutator<S> {
    pub fn new(store: Arc<S>, cache: Arc<PermissionCache>, strategy: InvalidationStrategy) -> Self {
        Self {
            store,
            cache,
            strategy,
        }
    }

    /// Replace the user's family memberships with `families`.
    pub fn assign_families_to_user(
        &self,
        user: &UserId,
        families: &[FamilyId],
        expected: &VersionToken,
    ) -> Result<()> {
        let key = VersionKey::User(user.clone());
        self.run("assign_families_to_user", key.clone(), |m| {
            m.advance(MutationState::Validating);
            self.check_version(&key, expected)?;
            let wanted: BTreeSet<&FamilyId> = families.iter().collect();
            for family in &wanted {
                self.require_family(family)?;
            }
            let current: BTreeSet<FamilyId> =
                self.store.fetch_user_families(user)?.into_iter().collect();

            let added = wanted
                .iter()
                .filter(|f| !current.contains(**f))
                .map(|f| EdgeOp::AddMembership {
                    user: user.clone(),
                    family: (*f).clone(),
                });
            let removed = current
                .iter()
                .filter(|f| !wanted.contains(f))
                .map(|f| EdgeOp::RemoveMembership {
                    user: user.clone(),
                    family: f.clone(),
                });
            let change = EdgeChange::new()
                .guard(key.clone(), expected.clone())
                .ops(added)
                .ops(removed)
                .bump(key.clone());

            m.advance(MutationState::Committing);
            self.store.persist_edge_change(&change)?;
            Ok(Invalidation::User(user.clone()))
        })
    }

    /// Replace the user's direct capability grants with `capabilities`.
    pub fn assign_capabilities_to_user(
        &self,
        user: &UserId,
        capabilities: &[CapabilityId],
        expected: &VersionToken,
    ) -> Result<()> {
        let key = VersionKey::User(user.clone());
        self.run("assign_capabilities_to_user", key.clone(), |m| {
            m.advance(MutationState::Validating);
            self.check_version(&key, expected)?;
            let wanted: BTreeSet<&CapabilityId> = capabilities.iter().collect();
            for capability in &wanted {
                self.require_capability(capability)?;
            }
            let current: BTreeSet<CapabilityId> = self
                .store
                .fetch_direct_capabilities(user)?
                .into_iter()
                .collect();

            let added = wanted
                .iter()
                .filter(|c| !current.contains(**c))
                .map(|c| EdgeOp::AddUserGrant {
                    user: user.clone(),
                    capability: (*c).clone(),
                });
            let removed = current
                .iter()
                .filter(|c| !wanted.contains(c))
                .map(|c| EdgeOp::RemoveUserGrant {
                    user: user.clone(),
                    capability: c.clone(),
                });
            let change = EdgeChange::new()
                .guard(key.clone(), expected.clone())
                .ops(added)
                .ops(removed)
                .bump(key.clone());

            m.advance(MutationState::Committing);
            self.store.persist_edge_change(&change)?;
            Ok(Invalidation::User(user.clone()))
        })
    }

    /// Replace the capabilities granted directly to `family`.
    pub fn assign_capabilities_to_family(
        &self,
        family: &FamilyId,
        capabilities: &[CapabilityId],
        expected: &VersionToken,
    ) -> Result<()> {
        let key = VersionKey::Family(family.clone());
        self.run("assign_capabilities_to_family", key.clone(), |m| {
            let graph_version = self.load_graph_version()?;

            m.advance(MutationState::Validating);
            self.check_version(&key, expected)?;
            let wanted: BTreeSet<&CapabilityId> = capabilities.iter().collect();
            for capability in &wanted {
                self.require_capability(capability)?;
            }
            let current: BTreeSet<CapabilityId> = self
                .store
                .fetch_family_capabilities(family)?
                .into_iter()
                .collect();
            let affected = self.affected_families(family)?;

            let added = wanted
                .iter()
                .filter(|c| !current.contains(**c))
                .map(|c| EdgeOp::AddFamilyGrant {
                    family: family.clone(),
                    capability: (*c).clone(),
                });
            let removed = current
                .iter()
                .filter(|c| !wanted.contains(c))
                .map(|c| EdgeOp::RemoveFamilyGrant {
                    family: family.clone(),
                    capability: c.clone(),
                });
            // The graph guard pins the ancestor set used for invalidation.
            let change = EdgeChange::new()
                .guard(key.clone(), expected.clone())
                .guard(VersionKey::Graph, graph_version)
                .ops(added)
                .ops(removed)
                .bump(key.clone());

            m.advance(MutationState::Committing);
            self.store.persist_edge_change(&change)?;
            Ok(Invalidation::Families(affected))
        })
    }

    /// Make `child` a child of `parent`. Rejected with `CycleViolation` if
    /// `parent` is `child` or already descends from it. Adding an existing
    /// edge writes nothing.
    pub fn add_family_edge(&self, parent: &FamilyId, child: &FamilyId) -> Result<()> {
        self.run("add_family_edge", VersionKey::Graph, |m| {
            let graph_version = self.load_graph_version()?;

            m.advance(MutationState::Validating);
            self.require_family(parent)?;
            self.require_family(child)?;
            if self.store.fetch_child_families(parent)?.contains(child) {
                tracing::debug!(parent = %parent, child = %child, "edge already present");
                return Ok(Invalidation::Nothing);
            }
            if would_create_cycle(&*self.store, parent, child)? {
                return Err(PermissionError::CycleViolation {
                    parent: parent.clone(),
                    child: child.clone(),
                });
            }
            let affected = self.affected_families(parent)?;

            let change = EdgeChange::new()
                .guard(VersionKey::Graph, graph_version)
                .op(EdgeOp::AddFamilyEdge {
                    parent: parent.clone(),
                    child: child.clone(),
                })
                .bump(VersionKey::Graph)
                .bump(VersionKey::Family(parent.clone()))
                .bump(VersionKey::Family(child.clone()));

            m.advance(MutationState::Committing);
            self.store.persist_edge_change(&change)?;
            Ok(Invalidation::Families(affected))
        })
    }

    /// Remove the `parent -> child` edge. Removing an absent edge writes
    /// nothing.
    pub fn remove_family_edge(&self, parent: &FamilyId, child: &FamilyId) -> Result<()> {
        self.run("remove_family_edge", VersionKey::Graph, |m| {
            let graph_version = self.load_graph_version()?;

            m.advance(MutationState::Validating);
            self.require_family(parent)?;
            self.require_family(child)?;
            if !self.store.fetch_child_families(parent)?.contains(child) {
                tracing::debug!(parent = %parent, child = %child, "edge not present");
                return Ok(Invalidation::Nothing);
            }
            let affected = self.affected_families(parent)?;

            let change = EdgeChange::new()
                .guard(VersionKey::Graph, graph_version)
                .op(EdgeOp::RemoveFamilyEdge {
                    parent: parent.clone(),
                    child: child.clone(),
                })
                .bump(VersionKey::Graph)
                .bump(VersionKey::Family(parent.clone()))
                .bump(VersionKey::Family(child.clone()));

            m.advance(MutationState::Committing);
            self.store.persist_edge_change(&change)?;
            Ok(Invalidation::Families(affected))
        })
    }

    fn run<F>(&self, operation: &'static str, target: VersionKey, body: F) -> Result<()>
    where
        F: FnOnce(&mut Mutation) -> Result<Invalidation>,
    {
        let mut mutation = Mutation::new(operation, target);
        match body(&mut mutation) {
            Ok(invalidation) => {
                mutation.advance(MutationState::Committed);
                tracing::info!(operation, target = %mutation.target, "mutation committed");
                self.invalidate(invalidation);
                Ok(())
            }
            Err(e) => {
                mutation.advance(MutationState::Rejected);
                tracing::warn!(operation, target = %mutation.target, error = %e, "mutation rejected");
                Err(e)
            }
        }
    }

    fn invalidate(&self, invalidation: Invalidation) {
        match invalidation {
            Invalidation::Nothing => {}
            Invalidation::User(user) => self.cache.invalidate(&user),
            Invalidation::Families(families) => match self.strategy {
                InvalidationStrategy::Full => self.cache.invalidate_all(),
                InvalidationStrategy::Precise => match self.members_of(&families) {
                    Ok(users) => {
                        tracing::debug!(users = users.len(), "precise invalidation");
                        self.cache.invalidate_many(users.iter());
                    }
                    Err(e) => {
                        // The write is committed; never leave entries stale.
                        tracing::warn!(error = %e, "member lookup failed; clearing permission cache");
                        self.cache.invalidate_all();
                    }
                },
            },
        }
    }

    fn members_of(&self, families: &AHashSet<FamilyId>) -> Result<AHashSet<UserId>> {
        let mut users = AHashSet::new();
        for family in families {
            users.extend(self.store.fetch_family_members(family)?);
        }
        Ok(users)
    }

    /// Families whose members' closures contain `family`. Only walked when
    /// the strategy needs it.
    fn affected_families(&self, family: &FamilyId) -> Result<AHashSet<FamilyId>> {
        match self.strategy {
            InvalidationStrategy::Full => Ok(AHashSet::new()),
            InvalidationStrategy::Precise => Ok(collect_ancestors(&*self.store, [family])?),
        }
    }

    fn load_graph_version(&self) -> Result<VersionToken> {
        self.store
            .fetch_version_token(&VersionKey::Graph)?
            .ok_or_else(graph_token_missing)
    }

    fn check_version(&self, key: &VersionKey, expected: &VersionToken) -> Result<()> {
        match self.store.fetch_version_token(key)? {
            None => Err(key
                .entity()
                .map(PermissionError::NotFound)
                .unwrap_or_else(graph_token_missing)),
            Some(actual) if &actual == expected => Ok(()),
            Some(actual) => Err(PermissionError::ConcurrencyConflict {
                key: key.clone(),
                expected: expected.clone(),
                actual: Some(actual),
            }),
        }
    }

    fn require_family(&self, family: &FamilyId) -> Result<()> {
        match self.store.fetch_family(family)? {
            Some(_) => Ok(()),
            None => Err(PermissionError::NotFound(EntityRef::Family(family.clone()))),
        }
    }

    fn require_capability(&self, capability: &CapabilityId) -> Result<()> {
        match self.store.fetch_capability(capability)? {
            Some(_) => Ok(()),
            None => Err(PermissionError::NotFound(EntityRef::Capability(
                capability.clone(),
            ))),
        }
    }
}

fn graph_token_missing() -> PermissionError {
    PermissionError::Upstream(StoreError::Backend(
        "graph version token missing".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::MemoryGraphStore;

    type Fixture = (
        Arc<MemoryGraphStore>,
        Arc<PermissionCache>,
        AssignmentMutator<MemoryGraphStore>,
    );

    fn fixture(strategy: InvalidationStrategy) -> Fixture {
        let store = MemoryGraphStore::new();
        store.insert_user("u1", "Una");
        store.insert_user("u2", "Dos");
        store.insert_family("admins", "Admins");
        store.insert_family("ops", "Ops");
        store.insert_family("oncall", "Oncall");
        store.insert_family("audit", "Audit");
        store.insert_family_edge_unchecked(&FamilyId::new("admins"), &FamilyId::new("ops"));
        store.load_snapshot(
            &GraphSnapshot::from_json(r#"{"memberships": [["u1", "admins"], ["u2", "audit"]]}"#)
                .unwrap(),
        );
        let store = Arc::new(store);
        let cache = Arc::new(PermissionCache::new(&CacheConfig::default()));
        let mutator = AssignmentMutator::new(Arc::clone(&store), Arc::clone(&cache), strategy);
        (store, cache, mutator)
    }

    fn prime(cache: &PermissionCache, users: &[&str]) {
        for id in users {
            cache
                .get_or_compute(&UserId::new(*id), || {
                    Ok::<_, PermissionError>(EffectivePermissionSet::new())
                })
                .unwrap();
        }
    }

    fn user_token(store: &MemoryGraphStore, id: &str) -> VersionToken {
        store
            .fetch_version_token(&VersionKey::User(UserId::new(id)))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn mutation_tracks_state() {
        let mut m = Mutation::new("link", VersionKey::Graph);
        assert_eq!(m.state(), MutationState::Loaded);
        m.advance(MutationState::Validating);
        m.advance(MutationState::Rejected);
        assert_eq!(m.state(), MutationState::Rejected);
        assert_eq!(MutationState::Committing.to_string(), "committing");
    }

    #[test]
    fn user_edit_invalidates_only_that_user() {
        let (store, cache, mutator) = fixture(InvalidationStrategy::Full);
        prime(&cache, &["u1", "u2"]);

        let expected = user_token(&store, "u1");
        mutator
            .assign_families_to_user(&UserId::new("u1"), &[FamilyId::new("ops")], &expected)
            .unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(
            store.fetch_user_families(&UserId::new("u1")).unwrap(),
            vec![FamilyId::new("ops")]
        );
    }

    #[test]
    fn rejected_mutation_leaves_cache_alone() {
        let (_store, cache, mutator) = fixture(InvalidationStrategy::Full);
        prime(&cache, &["u1", "u2"]);

        let err = mutator
            .assign_families_to_user(&UserId::new("u1"), &[], &VersionToken::from_counter(0))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn full_strategy_clears_cache_on_graph_edit() {
        let (_store, cache, mutator) = fixture(InvalidationStrategy::Full);
        prime(&cache, &["u1", "u2"]);

        mutator
            .add_family_edge(&FamilyId::new("ops"), &FamilyId::new("oncall"))
            .unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn precise_strategy_hits_members_of_ancestors_only() {
        let (_store, cache, mutator) = fixture(InvalidationStrategy::Precise);
        prime(&cache, &["u1", "u2"]);

        mutator
            .add_family_edge(&FamilyId::new("ops"), &FamilyId::new("oncall"))
            .unwrap();

        // u1 reaches ops through admins; u2 is unrelated.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn noop_edge_edits_write_nothing() {
        let (store, cache, mutator) = fixture(InvalidationStrategy::Full);
        prime(&cache, &["u1"]);
        let graph = store.fetch_version_token(&VersionKey::Graph).unwrap();

        mutator
            .add_family_edge(&FamilyId::new("admins"), &FamilyId::new("ops"))
            .unwrap();
        mutator
            .remove_family_edge(&FamilyId::new("ops"), &FamilyId::new("audit"))
            .unwrap();

        assert_eq!(store.fetch_version_token(&VersionKey::Graph).unwrap(), graph);
        assert_eq!(cache.len(), 1);
    }
}
