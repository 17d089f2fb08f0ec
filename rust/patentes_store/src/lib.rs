//! `patentes_store` — durable [`GraphStore`](patentes_core::GraphStore)
//! adapter on top of the embedded `redb` database.

mod redb_store;

pub use redb_store::{RedbGraphStore, RedbStoreError};
