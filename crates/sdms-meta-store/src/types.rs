//! Stored record types.
//!
//! These types are serialized to redb via bincode, so no field may rely on
//! self-describing formats (no untagged enums, no flattening).

use crate::collection::Record;
use chrono::{DateTime, Utc};
use sdms_common::{
    ArchiveStatus, AttrValue, DeliveryStatus, Details, ErrorClass, FileKind, NodeName, StageTarget,
    TargetClass, node_file_key,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ---- Archive ----

/// One physical object on tape, keyed by absolute path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub path: String,
    pub size: u64,
    pub kind: FileKind,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Number of payload members, set once the container was inventoried
    pub member_count: Option<u32>,
}

impl ArchiveFile {
    pub fn new(path: impl Into<String>, size: u64, kind: FileKind, now: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size,
            kind,
            first_seen: now,
            last_seen: now,
            member_count: None,
        }
    }

    /// Container whose member inventory is still missing
    pub fn needs_inventory(&self) -> bool {
        self.kind == FileKind::Container && self.member_count.is_none()
    }
}

impl Record for ArchiveFile {
    fn key(&self) -> String {
        self.path.clone()
    }
}

/// One logical payload file on tape, keyed by logical path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveItem {
    /// Logical path, relative to the run root (`Run10/AuAu/...`)
    pub path: String,
    /// Absolute path as recorded by the archive (member path for containers)
    pub full_path: String,
    pub size: u64,
    pub target: TargetClass,
    pub details: Details,
    /// Absolute path of the enclosing container, if any
    pub container: Option<String>,
    pub staging: BTreeMap<StageTarget, bool>,
    /// Found below a legacy `.bak` run-year folder
    pub is_backup: bool,
}

impl ArchiveItem {
    pub const fn in_container(&self) -> bool {
        self.container.is_some()
    }

    /// Path of the object that has to be retrieved from tape
    pub fn archive_path(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.full_path)
    }

    pub fn detail(&self, name: &str) -> Option<&AttrValue> {
        self.details.get(name)
    }

    pub fn is_marked(&self, stage_target: StageTarget) -> bool {
        self.staging.get(&stage_target).copied().unwrap_or(false)
    }
}

impl Record for ArchiveItem {
    fn key(&self) -> String {
        self.path.clone()
    }
}

/// A later sighting of an already catalogued logical path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateItem {
    pub item: ArchiveItem,
    pub primary_size: u64,
    /// Sizes disagree; both copies stay pending manual resolution
    pub size_mismatch: bool,
    pub found_at: DateTime<Utc>,
}

impl DuplicateItem {
    pub fn new(item: ArchiveItem, primary_size: u64, now: DateTime<Utc>) -> Self {
        Self {
            size_mismatch: item.size != primary_size,
            item,
            primary_size,
            found_at: now,
        }
    }
}

impl Record for DuplicateItem {
    fn key(&self) -> String {
        format!("{}#{}", self.item.archive_path(), self.item.full_path)
    }
}

// ---- Cache ----

/// One logical file resident in the cache tier, over all nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: String,
    pub full_path: String,
    pub size: u64,
    pub target: TargetClass,
    pub details: Details,
    /// Node -> physical disk holding the copy
    nodes: BTreeMap<NodeName, String>,
    copy_count: u32,
}

impl CacheEntry {
    /// Seed an entry from its archive counterpart
    pub fn from_archive(
        item: &ArchiveItem,
        full_path: impl Into<String>,
        nodes: BTreeMap<NodeName, String>,
    ) -> Self {
        let mut entry = Self {
            path: item.path.clone(),
            full_path: full_path.into(),
            size: item.size,
            target: item.target,
            details: item.details.clone(),
            nodes,
            copy_count: 0,
        };
        entry.sync_copy_count();
        entry
    }

    pub const fn nodes(&self) -> &BTreeMap<NodeName, String> {
        &self.nodes
    }

    pub const fn copy_count(&self) -> u32 {
        self.copy_count
    }

    pub fn holds(&self, node: &NodeName) -> bool {
        self.nodes.contains_key(node)
    }

    /// Merge reporting nodes; later disk assignments win
    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = (NodeName, String)>) {
        self.nodes.extend(nodes);
        self.sync_copy_count();
    }

    /// Returns `false` if the node held no copy
    pub fn remove_node(&mut self, node: &NodeName) -> bool {
        let removed = self.nodes.remove(node).is_some();
        self.sync_copy_count();
        removed
    }

    fn sync_copy_count(&mut self) {
        self.copy_count = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
    }
}

impl Record for CacheEntry {
    fn key(&self) -> String {
        self.path.clone()
    }
}

/// Node-scoped fact emitted by a cache crawl (new, missing, broken link)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheObservation {
    pub node: NodeName,
    pub path: String,
    pub full_path: String,
    pub target: TargetClass,
    /// Unknown for missing files and broken links
    pub size: Option<u64>,
    pub disk: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl Record for CacheObservation {
    fn key(&self) -> String {
        node_file_key(&self.node, &self.path)
    }
}

/// Observation set aside for a human: corrupt copy or no archive counterpart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedFile {
    pub observation: CacheObservation,
    /// Size of the record the observation conflicted with
    pub expected_size: Option<u64>,
    pub quarantined_at: DateTime<Utc>,
}

impl Record for QuarantinedFile {
    fn key(&self) -> String {
        self.observation.key()
    }
}

// ---- Staging ----

/// One archive-side retrieval unit: a standalone file or a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFromArchiveJob {
    /// Absolute archive path of the file or container
    pub path: String,
    pub target: TargetClass,
    pub stage_target: StageTarget,
    pub status: ArchiveStatus,
    /// Position in tape order; `None` sorts last
    pub order_idx: Option<u64>,
    pub group: Option<u32>,
    pub is_container: bool,
    pub member_count: Option<u32>,
    /// Absolute paths this job has to deliver to scratch
    pub wanted: BTreeSet<String>,
    pub status_changed: DateTime<Utc>,
}

impl StageFromArchiveJob {
    /// Move to `next` if the transition is a forward one
    pub fn advance(&mut self, next: ArchiveStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        self.status_changed = now;
        true
    }

    /// Staging-timeout rollback
    pub fn roll_back(&mut self, now: DateTime<Utc>) -> bool {
        let rolled = self.status.rollback();
        if rolled == self.status {
            return false;
        }
        self.status = rolled;
        self.status_changed = now;
        true
    }

    /// Sort key that puts unordered jobs last
    pub fn order_key(&self) -> (u64, String) {
        (self.order_idx.unwrap_or(u64::MAX), self.path.clone())
    }
}

impl Record for StageFromArchiveJob {
    fn key(&self) -> String {
        self.path.clone()
    }
}

/// Failure counters per error class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounters {
    pub already_exists: u32,
    pub no_space: u32,
    pub no_such_path: u32,
    pub timeout: u32,
    pub unknown: u32,
    pub retrieval: u32,
}

impl ErrorCounters {
    pub fn record(&mut self, class: ErrorClass) {
        let slot = match class {
            ErrorClass::AlreadyExists => &mut self.already_exists,
            ErrorClass::NoSpace => &mut self.no_space,
            ErrorClass::NoSuchPath => &mut self.no_such_path,
            ErrorClass::Timeout => &mut self.timeout,
            ErrorClass::Unknown => &mut self.unknown,
            ErrorClass::Retrieval => &mut self.retrieval,
        };
        *slot = slot.saturating_add(1);
    }

    pub const fn get(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::AlreadyExists => self.already_exists,
            ErrorClass::NoSpace => self.no_space,
            ErrorClass::NoSuchPath => self.no_such_path,
            ErrorClass::Timeout => self.timeout,
            ErrorClass::Unknown => self.unknown,
            ErrorClass::Retrieval => self.retrieval,
        }
    }

    /// Failures other than "already exists", which counts as success
    pub const fn failures(&self) -> u32 {
        self.no_space + self.no_such_path + self.timeout + self.unknown + self.retrieval
    }

    /// Every recorded failure was a lack of space
    pub const fn only_no_space(&self) -> bool {
        self.no_space > 0 && self.failures() == self.no_space
    }
}

/// One cache-side delivery unit, keyed by logical path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToCacheJob {
    pub path: String,
    /// Absolute archive path of the payload file
    pub full_path: String,
    pub size: u64,
    pub target: TargetClass,
    pub stage_target: StageTarget,
    /// Node groups that each receive one copy
    pub target_groups: Vec<String>,
    pub hpss_status: ArchiveStatus,
    pub target_status: DeliveryStatus,
    pub errors: ErrorCounters,
    /// Copy attempts made
    pub trials: u32,
    /// Automatic no-space resets
    pub resets: u32,
    pub notes: Vec<String>,
    pub status_changed: DateTime<Utc>,
}

impl StageToCacheJob {
    /// Cache-side copy may only begin once the file is in scratch
    pub fn ready_for_delivery(&self) -> bool {
        self.hpss_status == ArchiveStatus::Staged && self.target_status == DeliveryStatus::Unstaged
    }

    pub fn set_target_status(&mut self, status: DeliveryStatus, now: DateTime<Utc>) {
        self.target_status = status;
        self.status_changed = now;
    }
}

impl Record for StageToCacheJob {
    fn key(&self) -> String {
        self.path.clone()
    }
}

// ---- Cluster ----

/// Space figures of a node's data partitions, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceReport {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Cache node record. Never deleted; only flags and timestamps change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataServer {
    pub node: NodeName,
    pub state_active: bool,
    /// Configured as a cache-serving node
    pub is_data_server: bool,
    pub roles: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    /// When the node was last found unreachable while flagged active
    pub set_inactive: Option<DateTime<Utc>>,
    /// Set by the stager after delivering files; cleared by the next crawl
    pub new_files_staged: bool,
    pub last_crawler_run: Option<DateTime<Utc>>,
    pub space: Option<SpaceReport>,
}

impl DataServer {
    pub const fn new(node: NodeName, now: DateTime<Utc>) -> Self {
        Self {
            node,
            state_active: false,
            is_data_server: false,
            roles: Vec::new(),
            first_seen: now,
            last_seen: None,
            set_inactive: None,
            new_files_staged: false,
            last_crawler_run: None,
            space: None,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl Record for DataServer {
    fn key(&self) -> String {
        self.node.as_str().to_string()
    }
}

/// Advisory process lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLock {
    pub name: String,
    pub holder: Uuid,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProcessLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl Record for ProcessLock {
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, size: u64) -> ArchiveItem {
        ArchiveItem {
            path: path.to_string(),
            full_path: format!("/nersc/projects/starofl/picodsts/{path}"),
            size,
            target: TargetClass::PicoDst,
            details: Details::new(),
            container: None,
            staging: BTreeMap::new(),
            is_backup: false,
        }
    }

    #[test]
    fn test_cache_entry_copy_count_tracks_nodes() {
        let archive = item("Run10/a.picoDst.root", 100);
        let mut entry = CacheEntry::from_archive(
            &archive,
            "/export/data/xrd/ns/star/picodsts/Run10/a.picoDst.root",
            BTreeMap::from([(NodeName::new("n1"), "data1".to_string())]),
        );
        assert_eq!(entry.copy_count(), 1);

        entry.add_nodes([(NodeName::new("n2"), "data2".to_string())]);
        entry.add_nodes([(NodeName::new("n2"), "data3".to_string())]);
        assert_eq!(entry.copy_count(), 2);
        assert_eq!(entry.nodes()[&NodeName::new("n2")], "data3");

        assert!(entry.remove_node(&NodeName::new("n1")));
        assert!(!entry.remove_node(&NodeName::new("n1")));
        assert_eq!(entry.copy_count(), 1);
    }

    #[test]
    fn test_duplicate_flags_size_mismatch() {
        let now = Utc::now();
        assert!(!DuplicateItem::new(item("Run10/a", 100), 100, now).size_mismatch);
        assert!(DuplicateItem::new(item("Run10/a", 101), 100, now).size_mismatch);
    }

    #[test]
    fn test_stage_job_transitions() {
        let now = Utc::now();
        let mut job = StageFromArchiveJob {
            path: "/hpss/148.tar".to_string(),
            target: TargetClass::PicoDst,
            stage_target: StageTarget::Xrd,
            status: ArchiveStatus::Unstaged,
            order_idx: None,
            group: None,
            is_container: true,
            member_count: Some(4),
            wanted: BTreeSet::new(),
            status_changed: now,
        };
        assert!(job.advance(ArchiveStatus::Staging, now));
        assert!(job.roll_back(now));
        assert_eq!(job.status, ArchiveStatus::Unstaged);
        assert!(job.advance(ArchiveStatus::Staged, now));
        assert!(!job.advance(ArchiveStatus::Failed, now));
        assert!(!job.roll_back(now));
        assert_eq!(job.status, ArchiveStatus::Staged);
    }

    #[test]
    fn test_error_counters() {
        let mut errors = ErrorCounters::default();
        assert!(!errors.only_no_space());
        errors.record(ErrorClass::NoSpace);
        errors.record(ErrorClass::AlreadyExists);
        assert!(errors.only_no_space());
        errors.record(ErrorClass::Timeout);
        assert!(!errors.only_no_space());
        assert_eq!(errors.failures(), 2);
        assert_eq!(errors.get(ErrorClass::NoSpace), 1);
    }
}
