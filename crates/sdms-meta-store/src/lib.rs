//! SDMS metadata store
//!
//! A redb database holding one table per collection. Every record type has a
//! natural key, and every mutation runs inside a single write transaction, so
//! find-and-modify, upsert and claim-next are atomic with respect to every
//! other caller of the same database.

pub mod collection;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;

pub use collection::{Change, Collection, InsertManyReport, InsertOutcome, Record, UpsertOutcome};
pub use lock::{LockState, ProcessLocks};
pub use store::{ArchiveCollections, CacheCollections, MetaStore, MetaStoreError, MetaStoreResult};
pub use types::*;
