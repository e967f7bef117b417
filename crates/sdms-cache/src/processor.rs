//! Reconciliation Processor
//!
//! Folds the observations produced by cache crawls into the canonical
//! Cache Entries. Both folds run under the per-target reconciliation lock
//! and consume observations one logical path at a time, so a crashed run
//! can simply be repeated.

use chrono::Utc;
use sdms_common::{NodeName, Result, TargetClass};
use sdms_meta_store::{
    CacheCollections, CacheEntry, CacheObservation, Change, Collection, InsertOutcome, LockState,
    MetaStore, QuarantinedFile, Record,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the reconciliation lock of `target`
pub fn process_lock_name(target: TargetClass) -> String {
    format!("process_XRD_{}", target.as_str())
}

/// Counters of one new-file fold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewFileStats {
    /// Another processor held the lock
    pub skipped: bool,
    pub created: usize,
    pub merged: usize,
    pub corrupt: usize,
    pub no_archive: usize,
}

/// Counters of one missing-file fold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingFileStats {
    pub skipped: bool,
    pub broken_links: usize,
    pub nodes_removed: usize,
    pub entries_deleted: usize,
    /// Missing reports without a matching entry
    pub unmatched: usize,
}

/// Result of folding one group of new-file observations into an entry
enum Merge {
    Merged,
    Conflict(u64),
    NoEntry,
}

/// Result of applying one missing-file observation
enum Removal {
    NodeRemoved,
    EntryDeleted,
    Unmatched,
}

pub struct ReconciliationProcessor {
    store: MetaStore,
    lock_ttl: Duration,
}

impl ReconciliationProcessor {
    pub const fn new(store: MetaStore, lock_ttl: Duration) -> Self {
        Self { store, lock_ttl }
    }

    /// Run `fold` under the reconciliation lock of `target`. Returns `None`
    /// when another processor holds the lock.
    fn locked<R>(&self, target: TargetClass, fold: impl FnOnce() -> Result<R>) -> Result<Option<R>> {
        let name = process_lock_name(target);
        if let LockState::Held(lock) = self.store.locks().acquire(&name, self.lock_ttl)? {
            info!(target = %target, "Reconciliation already running on {}, skipping", lock.host);
            return Ok(None);
        }
        let result = fold();
        self.store.locks().release(&name)?;
        result.map(Some)
    }

    /// Fold every pending new-file observation of `target`
    pub fn apply_new(&self, target: TargetClass) -> Result<NewFileStats> {
        let stats = self.locked(target, || self.fold_new(target))?;
        Ok(stats.unwrap_or(NewFileStats {
            skipped: true,
            ..NewFileStats::default()
        }))
    }

    /// Fold every pending missing-file observation of `target`
    pub fn apply_missing(&self, target: TargetClass) -> Result<MissingFileStats> {
        let stats = self.locked(target, || self.fold_missing(target))?;
        Ok(stats.unwrap_or(MissingFileStats {
            skipped: true,
            ..MissingFileStats::default()
        }))
    }

    fn fold_new(&self, target: TargetClass) -> Result<NewFileStats> {
        let colls = self.store.cache(target);
        let mut stats = NewFileStats::default();

        while let Some(first) = colls.new.find_one(|_| true)? {
            let mut group = colls.new.find(|o| o.path == first.path)?;
            if group.iter().any(|o| o.size != first.size) {
                debug!("Conflicting sizes reported for {}, folding one at a time", first.path);
                group = vec![first.clone()];
            }
            let size = first.size.unwrap_or_default();
            let nodes: BTreeMap<NodeName, String> = group
                .iter()
                .map(|o| (o.node.clone(), o.disk.clone().unwrap_or_default()))
                .collect();

            let merge = colls.entries.modify(&first.path, |current| match current {
                Some(entry) if entry.size != size => (Change::Keep, Merge::Conflict(entry.size)),
                Some(mut entry) => {
                    entry.add_nodes(nodes.clone());
                    (Change::Put(entry), Merge::Merged)
                }
                None => (Change::Keep, Merge::NoEntry),
            })?;

            match merge {
                Merge::Merged => stats.merged += 1,
                Merge::Conflict(expected) => {
                    warn!(path = %first.path, "Size {} conflicts with cached size {}", size, expected);
                    quarantine(&colls.corrupt, &group, Some(expected))?;
                    stats.corrupt += group.len();
                }
                Merge::NoEntry => {
                    self.create_entry(target, colls, &first, &mut group, nodes, &mut stats)?;
                }
            }

            for observation in &group {
                colls.new.delete(&observation.key())?;
            }
        }

        info!(
            target = %target,
            "New-file fold done: {} created, {} merged, {} corrupt, {} without archive copy",
            stats.created,
            stats.merged,
            stats.corrupt,
            stats.no_archive
        );
        Ok(stats)
    }

    /// First sighting of a path in the cache: seed the entry from the
    /// archive catalog. `group` is widened to every consumed observation.
    fn create_entry(
        &self,
        target: TargetClass,
        colls: &CacheCollections,
        first: &CacheObservation,
        group: &mut Vec<CacheObservation>,
        nodes: BTreeMap<NodeName, String>,
        stats: &mut NewFileStats,
    ) -> Result<()> {
        let size = first.size.unwrap_or_default();
        let Some(item) = self.store.archive(target).items.get(&first.path)? else {
            warn!(path = %first.path, "No archive counterpart");
            quarantine(&colls.no_archive, group, None)?;
            stats.no_archive += group.len();
            return Ok(());
        };

        if item.size != size {
            warn!(path = %first.path, "Cached size {} differs from archive size {}", size, item.size);
            *group = colls.new.find(|o| o.path == first.path)?;
            quarantine(&colls.corrupt, group, Some(item.size))?;
            stats.corrupt += group.len();
            return Ok(());
        }

        let entry = CacheEntry::from_archive(&item, &first.full_path, nodes);
        match colls.entries.insert(&entry)? {
            InsertOutcome::Inserted => stats.created += 1,
            InsertOutcome::AlreadyExists => {
                colls
                    .entries
                    .update_one(&entry.path, |e| e.add_nodes(entry.nodes().clone()))?;
                stats.merged += 1;
            }
        }
        Ok(())
    }

    fn fold_missing(&self, target: TargetClass) -> Result<MissingFileStats> {
        let colls = self.store.cache(target);
        let mut stats = MissingFileStats {
            broken_links: colls.broken_link.drain_into(&colls.broken_link_archive, |o| o)?,
            ..MissingFileStats::default()
        };

        while let Some(observation) = colls.missing.find_one(|_| true)? {
            let node = &observation.node;
            let removal = colls.entries.modify(&observation.path, |current| match current {
                Some(entry) if !entry.holds(node) => (Change::Keep, Removal::Unmatched),
                Some(entry) if entry.copy_count() <= 1 => (Change::Delete, Removal::EntryDeleted),
                Some(mut entry) => {
                    entry.remove_node(node);
                    (Change::Put(entry), Removal::NodeRemoved)
                }
                None => (Change::Keep, Removal::Unmatched),
            })?;

            match removal {
                Removal::NodeRemoved => stats.nodes_removed += 1,
                Removal::EntryDeleted => stats.entries_deleted += 1,
                Removal::Unmatched => {
                    debug!(node = %node, path = %observation.path, "Missing file has no cache entry");
                    stats.unmatched += 1;
                }
            }
            colls.missing.delete(&observation.key())?;
        }

        info!(
            target = %target,
            "Missing-file fold done: {} copies removed, {} entries deleted, {} unmatched, {} broken links archived",
            stats.nodes_removed,
            stats.entries_deleted,
            stats.unmatched,
            stats.broken_links
        );
        Ok(stats)
    }
}

fn quarantine(
    side: &Collection<QuarantinedFile>,
    observations: &[CacheObservation],
    expected_size: Option<u64>,
) -> Result<()> {
    let now = Utc::now();
    for observation in observations {
        side.put(&QuarantinedFile {
            observation: observation.clone(),
            expected_size,
            quarantined_at: now,
        })?;
    }
    Ok(())
}
