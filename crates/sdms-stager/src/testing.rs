//! In-memory collaborators for stager tests

use crate::request::{RequestRules, StagingRequest};
use crate::stager::{GIB, Stager, StagerTools};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sdms_common::{
    ArchiveStatus, AttrValue, Config, DeliveryStatus, Error, Result, StageTarget, TargetClass,
};
use sdms_meta_store::{
    ArchiveItem, ErrorCounters, MetaStore, StageFromArchiveJob, StageToCacheJob,
};
use sdms_tools::{
    ArchiveEntry, ArchiveTool, ContainerMember, CopyOutcome, CopyTool, SpaceProbe, TapeSorter,
    extracted_path,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Default)]
struct ArchiveState {
    containers: BTreeMap<String, Vec<String>>,
    failing: BTreeSet<String>,
    files: Vec<String>,
    whole: Vec<String>,
    members: Vec<(String, String)>,
    on_extract: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Archive whose extractions write small files below the destination
#[derive(Clone, Default)]
pub struct FakeArchive {
    state: Arc<Mutex<ArchiveState>>,
}

impl FakeArchive {
    pub fn add_container(&self, container: &str, members: &[&str]) {
        self.state.lock().containers.insert(
            container.to_string(),
            members.iter().map(ToString::to_string).collect(),
        );
    }

    pub fn fail_on(&self, path: &str) {
        self.state.lock().failing.insert(path.to_string());
    }

    /// Run `hook` after every single-file extraction
    pub fn on_extract(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().on_extract = Some(Arc::new(hook));
    }

    pub fn extracted(&self) -> Vec<String> {
        self.state.lock().files.clone()
    }

    pub fn whole_extractions(&self) -> Vec<String> {
        self.state.lock().whole.clone()
    }

    pub fn member_extractions(&self) -> Vec<(String, String)> {
        self.state.lock().members.clone()
    }

    fn write(&self, dest: &Path, path: &str) -> Result<()> {
        if self.state.lock().failing.contains(path) {
            return Err(Error::tool("htar", format!("ERROR: No such file: {path}")));
        }
        let local = extracted_path(dest, path);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, b"payload")?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveTool for FakeArchive {
    async fn list_subfolders(&self, _folder: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_files(&self, _subfolder: &str) -> Result<Vec<ArchiveEntry>> {
        Ok(Vec::new())
    }

    async fn list_container(&self, container: &str) -> Result<Vec<ContainerMember>> {
        let members = self.state.lock().containers.get(container).cloned().unwrap_or_default();
        Ok(members
            .into_iter()
            .map(|path| ContainerMember { path, size: 7 })
            .collect())
    }

    async fn extract_container(&self, container: &str, dest: &Path) -> Result<()> {
        let members = {
            let mut state = self.state.lock();
            state.whole.push(container.to_string());
            state.containers.get(container).cloned().unwrap_or_default()
        };
        for member in members {
            self.write(dest, &member)?;
        }
        Ok(())
    }

    async fn extract_member(&self, container: &str, member: &str, dest: &Path) -> Result<()> {
        self.state
            .lock()
            .members
            .push((container.to_string(), member.to_string()));
        self.write(dest, member)
    }

    async fn extract_file(&self, path: &str, dest: &Path) -> Result<()> {
        let hook = {
            let mut state = self.state.lock();
            state.files.push(path.to_string());
            state.on_extract.clone()
        };
        self.write(dest, path)?;
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    async fn transfer_in_progress(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Echoes the list file unless an explicit order or a failure is set
#[derive(Clone, Default)]
pub struct FakeSorter {
    output: Arc<Mutex<Option<Vec<String>>>>,
    fails: Arc<Mutex<bool>>,
}

#[async_trait]
impl TapeSorter for FakeSorter {
    async fn sort(&self, list_file: &Path) -> Result<Vec<String>> {
        if *self.fails.lock() {
            return Err(Error::tool("hpss_file_sorter", "exit status 1"));
        }
        if let Some(order) = self.output.lock().clone() {
            return Ok(order);
        }
        let listing = std::fs::read_to_string(list_file)?;
        Ok(listing.lines().map(ToString::to_string).collect())
    }
}

/// Plays back scripted outcomes, then succeeds
#[derive(Clone, Default)]
pub struct FakeCopy {
    script: Arc<Mutex<VecDeque<CopyOutcome>>>,
    destinations: Arc<Mutex<Vec<String>>>,
    pub swept: Arc<Mutex<u32>>,
}

impl FakeCopy {
    pub fn script(&self, outcomes: impl IntoIterator<Item = CopyOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub fn destinations(&self) -> Vec<String> {
        self.destinations.lock().clone()
    }
}

#[async_trait]
impl CopyTool for FakeCopy {
    async fn copy(&self, _source: &Path, destination: &str) -> CopyOutcome {
        self.destinations.lock().push(destination.to_string());
        self.script.lock().pop_front().unwrap_or(CopyOutcome::Copied)
    }

    async fn kill_stale(&self) -> Result<bool> {
        *self.swept.lock() += 1;
        Ok(false)
    }
}

#[derive(Clone)]
pub struct FakeSpace {
    free: Arc<Mutex<u64>>,
}

impl SpaceProbe for FakeSpace {
    fn free_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(*self.free.lock())
    }

    fn total_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(1000 * GIB)
    }
}

pub type TestStager = Stager<FakeArchive, FakeSorter, FakeCopy, FakeSpace>;

/// A stager over a fresh store and scratch area
pub struct Harness {
    pub stager: TestStager,
    pub config: Config,
    pub archive: FakeArchive,
    pub copy: FakeCopy,
    pub sorter_output: Arc<Mutex<Option<Vec<String>>>>,
    pub sorter_fails: Arc<Mutex<bool>>,
    pub free_bytes: Arc<Mutex<u64>>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|_| {})
    }

    pub fn with_max_attempts(attempts: u32) -> Self {
        Self::build(|config| config.staging.copy.max_attempts = Some(attempts))
    }

    fn build(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.path = dir.path().join("catalog.redb");
        config.staging.scratch_dir = dir.path().join("scratch");
        config.staging.request_file = dir.path().join("stagingRequest.json");
        config.staging.scratch_limit_gb = 2;
        config.staging.min_free_gb = 1;
        config.staging.copy.retry_backoff_secs = 0;
        adjust(&mut config);
        std::fs::create_dir_all(&config.staging.scratch_dir).unwrap();

        let store = MetaStore::open(&config.store.path).unwrap();
        let archive = FakeArchive::default();
        let sorter = FakeSorter::default();
        let copy = FakeCopy::default();
        let space = FakeSpace {
            free: Arc::new(Mutex::new(100 * GIB)),
        };
        let harness_space = Arc::clone(&space.free);
        let stager = Stager::new(
            store,
            &config,
            StagerTools {
                archive: archive.clone(),
                sorter: sorter.clone(),
                copy: copy.clone(),
                space,
            },
        );

        Self {
            stager,
            config,
            archive,
            copy,
            sorter_output: sorter.output,
            sorter_fails: sorter.fails,
            free_bytes: harness_space,
            _dir: dir,
        }
    }

    pub fn request(&self, json: &str) -> StagingRequest {
        let rules = RequestRules {
            targets: &self.config.staging.targets,
            stage_targets: &self.config.staging.stage_targets,
            query_items: &self.config.staging.query_items,
        };
        StagingRequest::parse(json, &rules).unwrap()
    }

    pub fn write_request(&self, json: &str) {
        std::fs::write(&self.config.staging.request_file, json).unwrap();
    }

    pub fn touch_scratch(&self, path: &str) {
        let local = extracted_path(&self.config.staging.scratch_dir, path);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(local, b"payload").unwrap();
    }
}

pub fn archive_item(runyear: &str, name: &str, container: Option<&str>, size: u64) -> ArchiveItem {
    let path = format!("{runyear}/AuAu_200_production/2010/148/{name}.picoDst.root");
    ArchiveItem {
        full_path: format!("/nersc/projects/starofl/picodsts/{path}"),
        path,
        size,
        target: TargetClass::PicoDst,
        details: [
            ("runyear".to_string(), AttrValue::Str(runyear.to_string())),
            ("day".to_string(), AttrValue::Int(148)),
        ]
        .into_iter()
        .collect(),
        container: container.map(ToString::to_string),
        staging: BTreeMap::new(),
        is_backup: false,
    }
}

pub fn archive_job(path: &str, status: ArchiveStatus) -> StageFromArchiveJob {
    StageFromArchiveJob {
        path: path.to_string(),
        target: TargetClass::PicoDst,
        stage_target: StageTarget::Xrd,
        status,
        order_idx: None,
        group: None,
        is_container: false,
        member_count: None,
        wanted: BTreeSet::new(),
        status_changed: Utc::now(),
    }
}

/// Cache job for `full_path`, logically named after its file name
pub fn cache_job(full_path: &str, size: u64) -> StageToCacheJob {
    StageToCacheJob {
        path: full_path.rsplit('/').next().unwrap_or(full_path).to_string(),
        full_path: full_path.to_string(),
        size,
        target: TargetClass::PicoDst,
        stage_target: StageTarget::Xrd,
        target_groups: vec!["MENDEL_ALL".to_string()],
        hpss_status: ArchiveStatus::Unstaged,
        target_status: DeliveryStatus::Unstaged,
        errors: ErrorCounters::default(),
        trials: 0,
        resets: 0,
        notes: Vec::new(),
        status_changed: Utc::now(),
    }
}
