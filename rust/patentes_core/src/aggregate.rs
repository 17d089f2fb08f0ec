//! Permission Aggregator: direct grants plus grants inherited through the
//! user's family closure, deduplicated per capability with provenance.

use ahash::AHashMap;

use crate::error::{PermissionError, Result};
use crate::graph::resolve_family_closure;
use crate::store::GraphStore;
use crate::types::*;

/// Compute the effective permission set of `user`.
///
/// Fails with `NotFound` for an unknown user, or when a grant references a
/// capability or granting family without a record. Store errors propagate
/// unchanged; nothing is returned on partial failure.
pub fn compute_effective_permissions<S>(store: &S, user: &UserId) -> Result<EffectivePermissionSet>
where
    S: GraphStore + ?Sized,
{
    if store
        .fetch_version_token(&VersionKey::User(user.clone()))?
        .is_none()
    {
        return Err(PermissionError::NotFound(EntityRef::User(user.clone())));
    }

    let mut result = EffectivePermissionSet::new();
    let mut capabilities = CapabilityLookup::new(store);

    for capability in store.fetch_direct_capabilities(user)? {
        let record = capabilities.get(&capability)?;
        result.add_direct(&record);
    }

    let memberships = store.fetch_user_families(user)?;
    let closure = resolve_family_closure(store, memberships.iter())?;

    for family in &closure {
        let granted = store.fetch_family_capabilities(family)?;
        if granted.is_empty() {
            continue;
        }
        let origin = match store.fetch_family(family)? {
            Some(record) => FamilyOrigin::from(&record),
            None => return Err(PermissionError::NotFound(EntityRef::Family(family.clone()))),
        };
        for capability in granted {
            let record = capabilities.get(&capability)?;
            result.add_inherited(&record, origin.clone());
        }
    }

    tracing::trace!(
        user = %user,
        families = closure.len(),
        capabilities = result.len(),
        "computed effective permissions"
    );
    Ok(result)
}

/// Per-computation memo of capability records; a capability granted by
/// several families is fetched once.
struct CapabilityLookup<'s, S: ?Sized> {
    store: &'s S,
    seen: AHashMap<CapabilityId, CapabilityRecord>,
}

impl<'s, S: GraphStore + ?Sized> CapabilityLookup<'s, S> {
    fn new(store: &'s S) -> Self {
        Self {
            store,
            seen: AHashMap::new(),
        }
    }

    fn get(&mut self, id: &CapabilityId) -> Result<CapabilityRecord> {
        if let Some(record) = self.seen.get(id) {
            return Ok(record.clone());
        }
        let record = self
            .store
            .fetch_capability(id)?
            .ok_or_else(|| PermissionError::NotFound(EntityRef::Capability(id.clone())))?;
        self.seen.insert(id.clone(), record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;

    fn cap(id: &str) -> CapabilityId {
        CapabilityId::new(id)
    }

    fn admins_ops_store() -> MemoryGraphStore {
        let snapshot = GraphSnapshot::from_json(
            r#"{
                "users": {"u1": "U1", "u2": "U2"},
                "families": {"admins": "Admins", "ops": "Ops"},
                "capabilities": {"DeleteUser": "DeleteUser", "ViewLogs": "ViewLogs"},
                "memberships": [["u1", "ops"]],
                "family_grants": [["admins", "DeleteUser"], ["ops", "ViewLogs"]],
                "family_edges": [["ops", "admins"]]
            }"#,
        )
        .unwrap();
        MemoryGraphStore::from_snapshot(&snapshot)
    }

    #[test]
    fn inherits_grants_from_every_family_in_closure() {
        // ops is parent of admins here, so a member of ops reaches admins.
        let store = admins_ops_store();
        let perms = compute_effective_permissions(&store, &UserId::new("u1")).unwrap();

        assert_eq!(perms.len(), 2);
        let delete = perms.get(&cap("DeleteUser")).unwrap();
        assert!(delete.is_inherited && !delete.is_direct);
        assert_eq!(delete.origin_names(), vec!["Admins"]);
        let view = perms.get(&cap("ViewLogs")).unwrap();
        assert_eq!(view.origin_names(), vec!["Ops"]);
    }

    #[test]
    fn user_without_grants_has_empty_set() {
        let store = admins_ops_store();
        let perms = compute_effective_permissions(&store, &UserId::new("u2")).unwrap();
        assert!(perms.is_empty());
    }

    #[test]
    fn unknown_user_is_not_found() {
        let store = admins_ops_store();
        let err = compute_effective_permissions(&store, &UserId::new("ghost")).unwrap_err();
        assert!(matches!(err, PermissionError::NotFound(EntityRef::User(_))));
    }

    #[test]
    fn origin_records_family_id_and_name() {
        let store = admins_ops_store();
        let perms = compute_effective_permissions(&store, &UserId::new("u1")).unwrap();
        let origin = perms
            .get(&cap("ViewLogs"))
            .unwrap()
            .origins
            .iter()
            .next()
            .unwrap()
            .clone();
        assert_eq!(origin.id, FamilyId::new("ops"));
        assert_eq!(origin.name, "Ops");
    }

    #[test]
    fn dangling_capability_grant_is_not_found() {
        let store = admins_ops_store();
        // Snapshot seeding does not validate; simulate a dangling row.
        store.load_snapshot(
            &GraphSnapshot::from_json(r#"{"user_grants": [["u2", "Vanished"]]}"#).unwrap(),
        );
        let err = compute_effective_permissions(&store, &UserId::new("u2")).unwrap_err();
        assert!(matches!(
            err,
            PermissionError::NotFound(EntityRef::Capability(ref c)) if c.as_str() == "Vanished"
        ));
    }
}
