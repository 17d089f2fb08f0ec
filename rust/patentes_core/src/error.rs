//! Error types for the permission engine and its store collaborator.

use thiserror::Error;

use crate::types::{EntityRef, FamilyId, VersionKey, VersionToken};

/// Errors reported by a [`GraphStore`](crate::store::GraphStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend read/write failure (I/O, transaction, corruption).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A guard in an `EdgeChange` did not match the current token.
    #[error("version mismatch on {key}: expected {expected}, found {actual:?}")]
    VersionMismatch {
        key: VersionKey,
        expected: VersionToken,
        actual: Option<VersionToken>,
    },

    /// An op referenced an entity the store does not know.
    #[error("missing {0}")]
    Missing(EntityRef),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the engine to its callers.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// Referenced user, family or capability does not exist.
    #[error("not found: {0}")]
    NotFound(EntityRef),

    /// Adding the edge would make a family its own ancestor.
    #[error("edge {parent} -> {child} would create a cycle in the family graph")]
    CycleViolation { parent: FamilyId, child: FamilyId },

    /// Target changed since the caller loaded it; reload and retry.
    #[error("concurrent modification of {key}: expected version {expected}, found {actual:?}")]
    ConcurrencyConflict {
        key: VersionKey,
        expected: VersionToken,
        actual: Option<VersionToken>,
    },

    /// Store failure, propagated unchanged.
    #[error(transparent)]
    Upstream(StoreError),
}

impl PermissionError {
    /// True when reloading the target and retrying can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for PermissionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionMismatch {
                key,
                expected,
                actual,
            } => PermissionError::ConcurrencyConflict {
                key,
                expected,
                actual,
            },
            StoreError::Missing(entity) => PermissionError::NotFound(entity),
            other => PermissionError::Upstream(other),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, PermissionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    #[test]
    fn version_mismatch_maps_to_concurrency_conflict() {
        let err: PermissionError = StoreError::VersionMismatch {
            key: VersionKey::User(UserId::new("u1")),
            expected: VersionToken::from_counter(1),
            actual: Some(VersionToken::from_counter(2)),
        }
        .into();
        assert!(err.is_retryable());
        assert!(matches!(err, PermissionError::ConcurrencyConflict { .. }));
    }

    #[test]
    fn backend_error_passes_through() {
        let err: PermissionError = StoreError::Backend("disk full".into()).into();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "storage backend error: disk full");
    }

    #[test]
    fn missing_maps_to_not_found() {
        let err: PermissionError =
            StoreError::Missing(EntityRef::User(UserId::new("ghost"))).into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: user ghost");
    }
}
