//! Domain types shared across patentes_core modules.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identity of a user.
    UserId
);
string_id!(
    /// Identity of a family (role group) node.
    FamilyId
);
string_id!(
    /// Identity of a capability ("patente").
    CapabilityId
);

/// Opaque optimistic-concurrency token.
///
/// Stores mint tokens from a per-entity counter; callers only compare them.
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct VersionToken(Vec<u8>);

impl VersionToken {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Big-endian encoding of a counter value.
    pub fn from_counter(counter: u64) -> Self {
        Self(counter.to_be_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionToken({})", self)
    }
}

/// Anything that carries a version token.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum VersionKey {
    User(UserId),
    Family(FamilyId),
    /// Global token for the family parent/child edge set.
    Graph,
}

impl VersionKey {
    /// The entity behind this key; `None` for [`VersionKey::Graph`].
    pub fn entity(&self) -> Option<EntityRef> {
        match self {
            VersionKey::User(id) => Some(EntityRef::User(id.clone())),
            VersionKey::Family(id) => Some(EntityRef::Family(id.clone())),
            VersionKey::Graph => None,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionKey::User(id) => write!(f, "user:{}", id),
            VersionKey::Family(id) => write!(f, "family:{}", id),
            VersionKey::Graph => f.write_str("graph"),
        }
    }
}

/// Reference to a stored entity, used when reporting missing ids.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum EntityRef {
    User(UserId),
    Family(FamilyId),
    Capability(CapabilityId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::User(id) => write!(f, "user {}", id),
            EntityRef::Family(id) => write!(f, "family {}", id),
            EntityRef::Capability(id) => write!(f, "capability {}", id),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub id: FamilyId,
    pub name: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub id: CapabilityId,
    pub name: String,
}

/// Family through which a capability was inherited.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FamilyOrigin {
    pub id: FamilyId,
    pub name: String,
}

impl From<&FamilyRecord> for FamilyOrigin {
    fn from(record: &FamilyRecord) -> Self {
        FamilyOrigin {
            id: record.id.clone(),
            name: record.name.clone(),
        }
    }
}

/// One capability a user effectively holds, with provenance.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EffectivePermission {
    pub capability: CapabilityId,
    pub name: String,
    pub is_direct: bool,
    pub is_inherited: bool,
    /// Every family that grants this capability inside the user's closure.
    pub origins: BTreeSet<FamilyOrigin>,
}

impl EffectivePermission {
    pub fn origin_names(&self) -> Vec<&str> {
        self.origins.iter().map(|o| o.name.as_str()).collect()
    }
}

/// Deduplicated set of effective permissions keyed by capability.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct EffectivePermissionSet {
    entries: AHashMap<CapabilityId, EffectivePermission>,
}

impl EffectivePermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a direct grant, merging into an existing entry.
    pub fn add_direct(&mut self, capability: &CapabilityRecord) {
        self.entry(capability).is_direct = true;
    }

    /// Record an inherited grant; origins accumulate, never replace.
    pub fn add_inherited(&mut self, capability: &CapabilityRecord, origin: FamilyOrigin) {
        let entry = self.entry(capability);
        entry.is_inherited = true;
        entry.origins.insert(origin);
    }

    fn entry(&mut self, capability: &CapabilityRecord) -> &mut EffectivePermission {
        self.entries
            .entry(capability.id.clone())
            .or_insert_with(|| EffectivePermission {
                capability: capability.id.clone(),
                name: capability.name.clone(),
                is_direct: false,
                is_inherited: false,
                origins: BTreeSet::new(),
            })
    }

    pub fn contains(&self, capability: &CapabilityId) -> bool {
        self.entries.contains_key(capability)
    }

    pub fn get(&self, capability: &CapabilityId) -> Option<&EffectivePermission> {
        self.entries.get(capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectivePermission> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by capability id, for display and stable output.
    pub fn sorted(&self) -> Vec<&EffectivePermission> {
        let mut out: Vec<&EffectivePermission> = self.entries.values().collect();
        out.sort_by(|a, b| a.capability.cmp(&b.capability));
        out
    }
}

/// A single edge insertion or removal.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum EdgeOp {
    AddMembership { user: UserId, family: FamilyId },
    RemoveMembership { user: UserId, family: FamilyId },
    AddUserGrant { user: UserId, capability: CapabilityId },
    RemoveUserGrant { user: UserId, capability: CapabilityId },
    AddFamilyGrant { family: FamilyId, capability: CapabilityId },
    RemoveFamilyGrant { family: FamilyId, capability: CapabilityId },
    AddFamilyEdge { parent: FamilyId, child: FamilyId },
    RemoveFamilyEdge { parent: FamilyId, child: FamilyId },
}

/// Expected token for one versioned entity.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionGuard {
    pub key: VersionKey,
    pub expected: VersionToken,
}

/// A batch of edge ops applied atomically by a [`GraphStore`](crate::store::GraphStore).
///
/// All guards are verified before any op is applied; a mismatch aborts the
/// whole change. Every key in `bumps` receives a fresh token on commit.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct EdgeChange {
    pub guards: Vec<VersionGuard>,
    pub ops: Vec<EdgeOp>,
    pub bumps: Vec<VersionKey>,
}

impl EdgeChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, key: VersionKey, expected: VersionToken) -> Self {
        self.guards.push(VersionGuard { key, expected });
        self
    }

    pub fn op(mut self, op: EdgeOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn ops(mut self, ops: impl IntoIterator<Item = EdgeOp>) -> Self {
        self.ops.extend(ops);
        self
    }

    pub fn bump(mut self, key: VersionKey) -> Self {
        if !self.bumps.contains(&key) {
            self.bumps.push(key);
        }
        self
    }
}

/// Serializable description of a whole graph.
///
/// Used to seed stores and by the admin CLI. Edges are written verbatim:
/// seeding does not run the cycle guard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSnapshot {
    /// user id -> display name
    pub users: BTreeMap<UserId, String>,
    /// family id -> display name
    pub families: BTreeMap<FamilyId, String>,
    /// capability id -> display name
    pub capabilities: BTreeMap<CapabilityId, String>,
    pub memberships: Vec<(UserId, FamilyId)>,
    pub user_grants: Vec<(UserId, CapabilityId)>,
    pub family_grants: Vec<(FamilyId, CapabilityId)>,
    /// (parent, child)
    pub family_edges: Vec<(FamilyId, FamilyId)>,
}

impl GraphSnapshot {
    /// Parse a snapshot from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
