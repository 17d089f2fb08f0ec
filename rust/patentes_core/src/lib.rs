//! `patentes_core` — hierarchical permission resolution engine.
//!
//! Computes the capabilities ("patentes") a user effectively holds: direct
//! grants plus grants inherited through membership in a family hierarchy
//! that must stay acyclic.
//!
//! Modules:
//! - `types`     — ids, version tokens, effective permissions, edge changes
//! - `store`     — `GraphStore` collaborator trait + in-memory implementation
//! - `graph`     — closure resolution, cycle guard, acyclicity audit
//! - `aggregate` — effective permission computation with provenance
//! - `cache`     — bounded per-user result cache with explicit invalidation
//! - `mutate`    — optimistic-concurrency assignment mutations
//! - `engine`    — `PermissionEngine` facade
//! - `config`    — engine configuration (JSON)
//! - `error`     — error types

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod mutate;
pub mod store;
pub mod types;

pub use config::{parse_engine_config, CacheConfig, EngineConfig, InvalidationStrategy};
pub use engine::PermissionEngine;
pub use error::{PermissionError, Result, StoreError, StoreResult};
pub use store::{GraphStore, MemoryGraphStore};
pub use types::*;
