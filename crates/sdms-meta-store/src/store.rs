//! Persistent metadata store backed by redb.
//!
//! Opens the database, creates every collection eagerly and hands out typed
//! [`Collection`] handles. Per-target collections are grouped in
//! [`TargetMap`]s so a missing target is a compile error, not a lookup miss.

use crate::collection::Collection;
use crate::lock::ProcessLocks;
use crate::tables;
use crate::types::{
    ArchiveFile, ArchiveItem, CacheEntry, CacheObservation, DataServer, DuplicateItem,
    QuarantinedFile, StageFromArchiveJob, StageToCacheJob,
};
use redb::Database;
use sdms_common::{StageTarget, TargetClass, TargetMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for sdms_common::Error {
    fn from(e: MetaStoreError) -> Self {
        Self::store(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Archive-side collections of one target class
#[derive(Debug, Clone)]
pub struct ArchiveCollections {
    /// Primary Archive Items, one per logical path
    pub items: Collection<ArchiveItem>,
    pub duplicates: Collection<DuplicateItem>,
}

/// Cache-side collections of one target class
#[derive(Debug, Clone)]
pub struct CacheCollections {
    /// Canonical Cache Entries
    pub entries: Collection<CacheEntry>,
    pub new: Collection<CacheObservation>,
    pub missing: Collection<CacheObservation>,
    pub broken_link: Collection<CacheObservation>,
    /// Broken links already handed over by the processor
    pub broken_link_archive: Collection<CacheObservation>,
    pub corrupt: Collection<QuarantinedFile>,
    pub no_archive: Collection<QuarantinedFile>,
}

/// Persistent metadata store backed by redb.
#[derive(Debug, Clone)]
pub struct MetaStore {
    archive_files: Collection<ArchiveFile>,
    archive: TargetMap<ArchiveCollections>,
    cache: TargetMap<CacheCollections>,
    stage_from_archive: Collection<StageFromArchiveJob>,
    stage_to_xrd: Collection<StageToCacheJob>,
    data_servers: Collection<DataServer>,
    locks: ProcessLocks,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Arc::new(Database::create(path)?);

        let archive = TargetMap::from_fn(|target| ArchiveCollections {
            items: Collection::new(Arc::clone(&db), tables::archive_items(target)),
            duplicates: Collection::new(Arc::clone(&db), tables::archive_duplicates(target)),
        });
        let cache = TargetMap::from_fn(|target| {
            let side = |suffix: &str| Collection::new(Arc::clone(&db), tables::cache_side(target, suffix));
            CacheCollections {
                entries: Collection::new(Arc::clone(&db), tables::cache_entries(target)),
                new: side("new"),
                missing: side("missing"),
                broken_link: side("brokenLink"),
                broken_link_archive: side("brokenLinkArchive"),
                corrupt: Collection::new(Arc::clone(&db), tables::cache_side(target, "corrupt")),
                no_archive: Collection::new(Arc::clone(&db), tables::cache_side(target, "noHpss")),
            }
        });

        let store = Self {
            archive_files: Collection::new(Arc::clone(&db), tables::ARCHIVE_FILES),
            archive,
            cache,
            stage_from_archive: Collection::new(Arc::clone(&db), tables::STAGE_FROM_ARCHIVE),
            stage_to_xrd: Collection::new(
                Arc::clone(&db),
                tables::stage_to_cache(StageTarget::Xrd),
            ),
            data_servers: Collection::new(Arc::clone(&db), tables::DATA_SERVERS),
            locks: ProcessLocks::new(Collection::new(db, tables::PROCESS_LOCKS)),
        };

        // Create all tables eagerly so later read txns don't fail
        store.create_tables()?;
        info!("Opened metadata store at {}", path.display());

        Ok(store)
    }

    fn create_tables(&self) -> MetaStoreResult<()> {
        self.archive_files.ensure_table()?;
        self.stage_from_archive.ensure_table()?;
        self.stage_to_xrd.ensure_table()?;
        self.data_servers.ensure_table()?;
        self.locks.collection().ensure_table()?;
        for (_, colls) in self.archive.iter() {
            colls.items.ensure_table()?;
            colls.duplicates.ensure_table()?;
        }
        for (_, colls) in self.cache.iter() {
            colls.entries.ensure_table()?;
            for side in [
                &colls.new,
                &colls.missing,
                &colls.broken_link,
                &colls.broken_link_archive,
            ] {
                side.ensure_table()?;
            }
            colls.corrupt.ensure_table()?;
            colls.no_archive.ensure_table()?;
        }
        Ok(())
    }

    // ---- Handles ----

    pub const fn archive_files(&self) -> &Collection<ArchiveFile> {
        &self.archive_files
    }

    pub const fn archive(&self, target: TargetClass) -> &ArchiveCollections {
        self.archive.get(target)
    }

    pub const fn cache(&self, target: TargetClass) -> &CacheCollections {
        self.cache.get(target)
    }

    pub const fn stage_from_archive(&self) -> &Collection<StageFromArchiveJob> {
        &self.stage_from_archive
    }

    pub const fn stage_to_cache(&self, stage_target: StageTarget) -> &Collection<StageToCacheJob> {
        match stage_target {
            StageTarget::Xrd => &self.stage_to_xrd,
        }
    }

    pub const fn data_servers(&self) -> &Collection<DataServer> {
        &self.data_servers
    }

    pub const fn locks(&self) -> &ProcessLocks {
        &self.locks
    }

    /// Size of every collection, in a stable order
    pub fn collection_counts(&self) -> MetaStoreResult<Vec<(String, u64)>> {
        let mut counts = vec![(
            self.archive_files.name().to_string(),
            self.archive_files.count()?,
        )];
        for (_, colls) in self.archive.iter() {
            counts.push((colls.items.name().to_string(), colls.items.count()?));
            counts.push((colls.duplicates.name().to_string(), colls.duplicates.count()?));
        }
        for (_, colls) in self.cache.iter() {
            counts.push((colls.entries.name().to_string(), colls.entries.count()?));
            for side in [
                &colls.new,
                &colls.missing,
                &colls.broken_link,
                &colls.broken_link_archive,
            ] {
                counts.push((side.name().to_string(), side.count()?));
            }
            counts.push((colls.corrupt.name().to_string(), colls.corrupt.count()?));
            counts.push((colls.no_archive.name().to_string(), colls.no_archive.count()?));
        }
        counts.push((
            self.stage_from_archive.name().to_string(),
            self.stage_from_archive.count()?,
        ));
        counts.push((self.stage_to_xrd.name().to_string(), self.stage_to_xrd.count()?));
        counts.push((self.data_servers.name().to_string(), self.data_servers.count()?));
        counts.push((
            self.locks.collection().name().to_string(),
            self.locks.collection().count()?,
        ));
        Ok(counts)
    }
}
