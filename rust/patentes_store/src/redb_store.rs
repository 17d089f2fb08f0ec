#![allow(clippy::result_large_err)]
//! Graph store persisted in redb.
//!
//! Records live in three name tables, adjacency in six multimap tables
//! (every relation has a forward and a reverse index), and version counters
//! in one `u64` table keyed by the rendered [`VersionKey`] (`user:<id>`,
//! `family:<id>`, `graph`). An entity without a counter row has version 0.
//!
//! `persist_edge_change` runs in a single write transaction. redb admits one
//! writer at a time, so checking the guards inside that transaction makes
//! the whole change a compare-and-swap.

use std::path::Path;

use redb::{
    Database, MultimapTable, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, Table,
    TableDefinition, WriteTransaction,
};
use thiserror::Error;

use patentes_core::{
    CapabilityId, CapabilityRecord, EdgeChange, EdgeOp, EntityRef, FamilyId, FamilyRecord,
    GraphSnapshot, GraphStore, StoreError, StoreResult, UserId, VersionKey, VersionToken,
};

type Names = TableDefinition<'static, &'static str, &'static str>;
type Edges = MultimapTableDefinition<'static, &'static str, &'static str>;

const USERS: Names = TableDefinition::new("users");
const FAMILIES: Names = TableDefinition::new("families");
const CAPABILITIES: Names = TableDefinition::new("capabilities");
const VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("versions");

/// user -> family
const MEMBERSHIPS: Edges = MultimapTableDefinition::new("memberships");
/// family -> user
const MEMBERS: Edges = MultimapTableDefinition::new("members");
/// user -> capability
const USER_GRANTS: Edges = MultimapTableDefinition::new("user_grants");
/// family -> capability
const FAMILY_GRANTS: Edges = MultimapTableDefinition::new("family_grants");
/// parent -> child
const CHILDREN: Edges = MultimapTableDefinition::new("children");
/// child -> parent
const PARENTS: Edges = MultimapTableDefinition::new("parents");

#[derive(Error, Debug)]
pub enum RedbStoreError {
    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    /// The change was refused by a guard or op check; nothing was written.
    #[error(transparent)]
    Rejected(#[from] StoreError),
}

impl From<RedbStoreError> for StoreError {
    fn from(e: RedbStoreError) -> Self {
        match e {
            RedbStoreError::Rejected(inner) => inner,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, RedbStoreError>;

fn token_from<N, V>(
    users: &N,
    families: &N,
    versions: &V,
    key: &VersionKey,
) -> std::result::Result<Option<VersionToken>, redb::StorageError>
where
    N: ReadableTable<&'static str, &'static str>,
    V: ReadableTable<&'static str, u64>,
{
    let exists = match key {
        VersionKey::User(id) => users.get(id.as_str())?.is_some(),
        VersionKey::Family(id) => families.get(id.as_str())?.is_some(),
        VersionKey::Graph => true,
    };
    if !exists {
        return Ok(None);
    }
    let name = key.to_string();
    let counter = versions.get(name.as_str())?.map(|v| v.value()).unwrap_or(0);
    Ok(Some(VersionToken::from_counter(counter)))
}

/// Every table, opened inside one write transaction.
struct WriteTables<'txn> {
    users: Table<'txn, &'static str, &'static str>,
    families: Table<'txn, &'static str, &'static str>,
    capabilities: Table<'txn, &'static str, &'static str>,
    versions: Table<'txn, &'static str, u64>,
    memberships: MultimapTable<'txn, &'static str, &'static str>,
    members: MultimapTable<'txn, &'static str, &'static str>,
    user_grants: MultimapTable<'txn, &'static str, &'static str>,
    family_grants: MultimapTable<'txn, &'static str, &'static str>,
    children: MultimapTable<'txn, &'static str, &'static str>,
    parents: MultimapTable<'txn, &'static str, &'static str>,
}

impl<'txn> WriteTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            users: txn.open_table(USERS)?,
            families: txn.open_table(FAMILIES)?,
            capabilities: txn.open_table(CAPABILITIES)?,
            versions: txn.open_table(VERSIONS)?,
            memberships: txn.open_multimap_table(MEMBERSHIPS)?,
            members: txn.open_multimap_table(MEMBERS)?,
            user_grants: txn.open_multimap_table(USER_GRANTS)?,
            family_grants: txn.open_multimap_table(FAMILY_GRANTS)?,
            children: txn.open_multimap_table(CHILDREN)?,
            parents: txn.open_multimap_table(PARENTS)?,
        })
    }

    fn token(&self, key: &VersionKey) -> Result<Option<VersionToken>> {
        Ok(token_from(&self.users, &self.families, &self.versions, key)?)
    }

    fn bump(&mut self, key: &VersionKey) -> Result<()> {
        let name = key.to_string();
        let current = self
            .versions
            .get(name.as_str())?
            .map(|v| v.value())
            .unwrap_or(0);
        self.versions.insert(name.as_str(), current + 1)?;
        Ok(())
    }

    fn require(&self, entity: EntityRef) -> Result<()> {
        let table = match &entity {
            EntityRef::User(_) => &self.users,
            EntityRef::Family(_) => &self.families,
            EntityRef::Capability(_) => &self.capabilities,
        };
        let id = match &entity {
            EntityRef::User(id) => id.as_str(),
            EntityRef::Family(id) => id.as_str(),
            EntityRef::Capability(id) => id.as_str(),
        };
        if table.get(id)?.is_some() {
            Ok(())
        } else {
            Err(StoreError::Missing(entity).into())
        }
    }

    /// Insertions must reference known entities; removals need not.
    fn check_op(&self, op: &EdgeOp) -> Result<()> {
        match op {
            EdgeOp::AddMembership { user, family } => {
                self.require(EntityRef::User(user.clone()))?;
                self.require(EntityRef::Family(family.clone()))
            }
            EdgeOp::AddUserGrant { user, capability } => {
                self.require(EntityRef::User(user.clone()))?;
                self.require(EntityRef::Capability(capability.clone()))
            }
            EdgeOp::AddFamilyGrant { family, capability } => {
                self.require(EntityRef::Family(family.clone()))?;
                self.require(EntityRef::Capability(capability.clone()))
            }
            EdgeOp::AddFamilyEdge { parent, child } => {
                self.require(EntityRef::Family(parent.clone()))?;
                self.require(EntityRef::Family(child.clone()))
            }
            EdgeOp::RemoveMembership { .. }
            | EdgeOp::RemoveUserGrant { .. }
            | EdgeOp::RemoveFamilyGrant { .. }
            | EdgeOp::RemoveFamilyEdge { .. } => Ok(()),
        }
    }

    fn apply(&mut self, op: &EdgeOp) -> Result<()> {
        match op {
            EdgeOp::AddMembership { user, family } => {
                self.memberships.insert(user.as_str(), family.as_str())?;
                self.members.insert(family.as_str(), user.as_str())?;
            }
            EdgeOp::RemoveMembership { user, family } => {
                self.memberships.remove(user.as_str(), family.as_str())?;
                self.members.remove(family.as_str(), user.as_str())?;
            }
            EdgeOp::AddUserGrant { user, capability } => {
                self.user_grants.insert(user.as_str(), capability.as_str())?;
            }
            EdgeOp::RemoveUserGrant { user, capability } => {
                self.user_grants.remove(user.as_str(), capability.as_str())?;
            }
            EdgeOp::AddFamilyGrant { family, capability } => {
                self.family_grants
                    .insert(family.as_str(), capability.as_str())?;
            }
            EdgeOp::RemoveFamilyGrant { family, capability } => {
                self.family_grants
                    .remove(family.as_str(), capability.as_str())?;
            }
            EdgeOp::AddFamilyEdge { parent, child } => {
                self.children.insert(parent.as_str(), child.as_str())?;
                self.parents.insert(child.as_str(), parent.as_str())?;
            }
            EdgeOp::RemoveFamilyEdge { parent, child } => {
                self.children.remove(parent.as_str(), child.as_str())?;
                self.parents.remove(child.as_str(), parent.as_str())?;
            }
        }
        Ok(())
    }
}

/// [`GraphStore`] over a redb database file.
pub struct RedbGraphStore {
    db: Database,
}

impl RedbGraphStore {
    /// Open or create the database at `path` and make sure every table
    /// exists, so read transactions never see a missing table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        let store = Self { db };
        store.write(|_| Ok(()))?;
        tracing::debug!(path = %path.as_ref().display(), "opened redb graph store");
        Ok(store)
    }

    /// Run `f` against every table in one write transaction. Any error
    /// drops the transaction uncommitted, which rolls it back.
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTables<'_>) -> Result<T>,
    {
        let txn = self.db.begin_write()?;
        let out = {
            let mut tables = WriteTables::open(&txn)?;
            f(&mut tables)?
        };
        txn.commit()?;
        Ok(out)
    }

    fn read_edges(&self, table: Edges, key: &str) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_multimap_table(table)?;
        let mut out = Vec::new();
        for value in table.get(key)? {
            out.push(value?.value().to_string());
        }
        Ok(out)
    }

    fn read_name(&self, table: Names, id: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table)?;
        Ok(table.get(id)?.map(|v| v.value().to_string()))
    }

    /// Merge a snapshot into the database in one transaction. Edges are
    /// written verbatim, without the cycle guard.
    pub fn import_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()> {
        self.write(|t| {
            for (id, name) in &snapshot.users {
                t.users.insert(id.as_str(), name.as_str())?;
                t.bump(&VersionKey::User(id.clone()))?;
            }
            for (id, name) in &snapshot.families {
                t.families.insert(id.as_str(), name.as_str())?;
                t.bump(&VersionKey::Family(id.clone()))?;
            }
            for (id, name) in &snapshot.capabilities {
                t.capabilities.insert(id.as_str(), name.as_str())?;
            }
            for (user, family) in &snapshot.memberships {
                t.apply(&EdgeOp::AddMembership {
                    user: user.clone(),
                    family: family.clone(),
                })?;
            }
            for (user, capability) in &snapshot.user_grants {
                t.apply(&EdgeOp::AddUserGrant {
                    user: user.clone(),
                    capability: capability.clone(),
                })?;
            }
            for (family, capability) in &snapshot.family_grants {
                t.apply(&EdgeOp::AddFamilyGrant {
                    family: family.clone(),
                    capability: capability.clone(),
                })?;
            }
            for (parent, child) in &snapshot.family_edges {
                t.apply(&EdgeOp::AddFamilyEdge {
                    parent: parent.clone(),
                    child: child.clone(),
                })?;
            }
            t.bump(&VersionKey::Graph)
        })?;
        tracing::info!(
            users = snapshot.users.len(),
            families = snapshot.families.len(),
            capabilities = snapshot.capabilities.len(),
            edges = snapshot.family_edges.len(),
            "imported snapshot"
        );
        Ok(())
    }

    pub fn insert_user(&self, id: &UserId, name: &str) -> Result<()> {
        self.write(|t| {
            t.users.insert(id.as_str(), name)?;
            t.bump(&VersionKey::User(id.clone()))
        })
    }

    pub fn insert_family(&self, id: &FamilyId, name: &str) -> Result<()> {
        self.write(|t| {
            t.families.insert(id.as_str(), name)?;
            t.bump(&VersionKey::Family(id.clone()))
        })
    }

    pub fn insert_capability(&self, id: &CapabilityId, name: &str) -> Result<()> {
        self.write(|t| {
            t.capabilities.insert(id.as_str(), name)?;
            Ok(())
        })
    }
}

impl GraphStore for RedbGraphStore {
    fn fetch_direct_capabilities(&self, user: &UserId) -> StoreResult<Vec<CapabilityId>> {
        let ids = self.read_edges(USER_GRANTS, user.as_str())?;
        Ok(ids.into_iter().map(CapabilityId::from).collect())
    }

    fn fetch_user_families(&self, user: &UserId) -> StoreResult<Vec<FamilyId>> {
        let ids = self.read_edges(MEMBERSHIPS, user.as_str())?;
        Ok(ids.into_iter().map(FamilyId::from).collect())
    }

    fn fetch_family_capabilities(&self, family: &FamilyId) -> StoreResult<Vec<CapabilityId>> {
        let ids = self.read_edges(FAMILY_GRANTS, family.as_str())?;
        Ok(ids.into_iter().map(CapabilityId::from).collect())
    }

    fn fetch_child_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>> {
        let ids = self.read_edges(CHILDREN, family.as_str())?;
        Ok(ids.into_iter().map(FamilyId::from).collect())
    }

    fn fetch_parent_families(&self, family: &FamilyId) -> StoreResult<Vec<FamilyId>> {
        let ids = self.read_edges(PARENTS, family.as_str())?;
        Ok(ids.into_iter().map(FamilyId::from).collect())
    }

    fn fetch_family_members(&self, family: &FamilyId) -> StoreResult<Vec<UserId>> {
        let ids = self.read_edges(MEMBERS, family.as_str())?;
        Ok(ids.into_iter().map(UserId::from).collect())
    }

    fn fetch_family(&self, family: &FamilyId) -> StoreResult<Option<FamilyRecord>> {
        Ok(self
            .read_name(FAMILIES, family.as_str())?
            .map(|name| FamilyRecord {
                id: family.clone(),
                name,
            }))
    }

    fn fetch_capability(
        &self,
        capability: &CapabilityId,
    ) -> StoreResult<Option<CapabilityRecord>> {
        Ok(self
            .read_name(CAPABILITIES, capability.as_str())?
            .map(|name| CapabilityRecord {
                id: capability.clone(),
                name,
            }))
    }

    fn list_families(&self) -> StoreResult<Vec<FamilyId>> {
        let families = || -> Result<Vec<FamilyId>> {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(FAMILIES)?;
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (id, _) = entry?;
                out.push(FamilyId::new(id.value()));
            }
            Ok(out)
        };
        Ok(families()?)
    }

    fn fetch_version_token(&self, key: &VersionKey) -> StoreResult<Option<VersionToken>> {
        let token = || -> Result<Option<VersionToken>> {
            let txn = self.db.begin_read()?;
            let users = txn.open_table(USERS)?;
            let families = txn.open_table(FAMILIES)?;
            let versions = txn.open_table(VERSIONS)?;
            Ok(token_from(&users, &families, &versions, key)?)
        };
        Ok(token()?)
    }

    fn persist_edge_change(&self, change: &EdgeChange) -> StoreResult<()> {
        self.write(|t| {
            for guard in &change.guards {
                let actual = t.token(&guard.key)?;
                if actual.as_ref() != Some(&guard.expected) {
                    return Err(StoreError::VersionMismatch {
                        key: guard.key.clone(),
                        expected: guard.expected.clone(),
                        actual,
                    }
                    .into());
                }
            }
            for op in &change.ops {
                t.check_op(op)?;
            }
            for op in &change.ops {
                t.apply(op)?;
            }
            for key in &change.bumps {
                t.bump(key)?;
            }
            Ok(())
        })?;
        tracing::debug!(
            ops = change.ops.len(),
            bumps = change.bumps.len(),
            "edge change committed"
        );
        Ok(())
    }
}
