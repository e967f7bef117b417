//! Cache Crawler
//!
//! Runs on one cache node and compares the node's namespace against the
//! Cache Entries that claim a copy on it. Differences become new, missing
//! and broken-link observations for the Reconciliation Processor.

use crate::processor::process_lock_name;
use chrono::Utc;
use sdms_common::config::CacheConfig;
use sdms_common::{NodeName, Result, TargetClass};
use sdms_meta_store::{CacheObservation, DataServer, MetaStore, SpaceReport};
use sdms_tools::SpaceProbe;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Counters of one node scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Reconciliation was running for the target; nothing was scanned
    pub postponed: bool,
    /// The node is not an active data server
    pub node_inactive: bool,
    pub expected: usize,
    pub files_seen: usize,
    pub new: usize,
    pub missing: usize,
    pub broken_links: usize,
    /// Observations already pending from an earlier scan
    pub already_reported: usize,
}

/// One file found during the walk
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sighting {
    Present {
        path: String,
        full_path: PathBuf,
        size: u64,
        disk: Option<String>,
    },
    BrokenLink {
        path: String,
        full_path: PathBuf,
    },
}

/// Physical disk of a link target: `/export/<disk>/...` -> `<disk>`
fn disk_of(link_target: &Path) -> Option<String> {
    link_target
        .components()
        .filter(|c| !matches!(c, Component::RootDir))
        .nth(1)
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
}

/// Scans cache nodes for one metadata store
pub struct CacheCrawler<P> {
    store: MetaStore,
    config: CacheConfig,
    probe: P,
}

impl<P: SpaceProbe> CacheCrawler<P> {
    pub fn new(store: MetaStore, config: CacheConfig, probe: P) -> Self {
        Self {
            store,
            config,
            probe,
        }
    }

    /// Namespace folder of `target` on the local node
    pub fn target_root(&self, target: TargetClass) -> PathBuf {
        self.config
            .xrootd_prefix
            .join(self.config.base_folders.get(target))
    }

    /// Scan `node`'s namespace for `target` and record the differences
    pub fn scan(&self, node: &NodeName, target: TargetClass) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        if self.store.locks().is_held(&process_lock_name(target))? {
            info!(node = %node, target = %target, "Reconciliation running, postponing crawl");
            stats.postponed = true;
            return Ok(stats);
        }

        let collections = self.store.cache(target);
        let mut expected: BTreeSet<String> = collections
            .entries
            .find(|entry| entry.holds(node))?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        stats.expected = expected.len();

        let active = self
            .store
            .data_servers()
            .get(node.as_str())?
            .is_some_and(|server| server.state_active && server.is_data_server);

        let root = self.target_root(target);
        let now = Utc::now();
        let observation = |path: &str, full_path: &Path, size: Option<u64>, disk: Option<String>| {
            CacheObservation {
                node: node.clone(),
                path: path.to_string(),
                full_path: full_path.to_string_lossy().into_owned(),
                target,
                size,
                disk,
                observed_at: now,
            }
        };

        let mut new = Vec::new();
        let mut broken = Vec::new();
        if !active {
            warn!(node = %node, "Node is not an active data server, reporting all its files missing");
            stats.node_inactive = true;
        } else if !root.is_dir() {
            warn!(node = %node, "Namespace folder {} missing, reporting all files missing", root.display());
        } else {
            for sighting in self.walk(&root, target) {
                stats.files_seen += 1;
                match sighting {
                    Sighting::BrokenLink { path, full_path } => {
                        broken.push(observation(&path, &full_path, None, None));
                    }
                    Sighting::Present {
                        path,
                        full_path,
                        size,
                        disk,
                    } => {
                        if !expected.remove(&path) {
                            new.push(observation(&path, &full_path, Some(size), disk));
                        }
                    }
                }
            }
        }

        let missing: Vec<_> = expected
            .iter()
            .map(|path| observation(path, &root.join(path), None, None))
            .collect();

        stats.new = new.len();
        stats.missing = missing.len();
        stats.broken_links = broken.len();
        for (coll, batch) in [
            (&collections.new, new),
            (&collections.missing, missing),
            (&collections.broken_link, broken),
        ] {
            let report = coll.insert_many(batch)?;
            stats.already_reported += report.already_exists.len();
        }

        self.report_node(node)?;
        info!(
            node = %node,
            target = %target,
            "Cache crawl done: {} files, {} new, {} missing, {} broken links",
            stats.files_seen,
            stats.new,
            stats.missing,
            stats.broken_links
        );
        Ok(stats)
    }

    /// Payload files below `root`, skipping the folders of other targets
    fn walk(&self, root: &Path, target: TargetClass) -> Vec<Sighting> {
        let siblings: Vec<PathBuf> = TargetClass::ALL
            .into_iter()
            .filter(|&t| t != target)
            .map(|t| self.target_root(t))
            .filter(|p| p.starts_with(root) && p.as_path() != root)
            .collect();
        let suffix = target.payload_suffix();

        WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !siblings.iter().any(|s| s.as_path() == e.path()))
            .filter_map(|res| match res {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Walk error below {}: {}", root.display(), e);
                    None
                }
            })
            .filter(|e| !e.file_type().is_dir())
            .filter(|e| e.file_name().to_string_lossy().ends_with(&suffix))
            .filter_map(|e| {
                let full_path = e.path().to_path_buf();
                let path = full_path.strip_prefix(root).ok()?.to_string_lossy().into_owned();
                Some(Self::inspect(path, full_path, e.path_is_symlink()))
            })
            .collect()
    }

    fn inspect(path: String, full_path: PathBuf, is_link: bool) -> Sighting {
        let disk = if is_link {
            match std::fs::read_link(&full_path) {
                Ok(target) => disk_of(&target),
                Err(_) => return Sighting::BrokenLink { path, full_path },
            }
        } else {
            None
        };
        match std::fs::metadata(&full_path) {
            Ok(meta) => Sighting::Present {
                path,
                full_path,
                size: meta.len(),
                disk,
            },
            Err(e) => {
                debug!("Broken link {}: {}", full_path.display(), e);
                Sighting::BrokenLink { path, full_path }
            }
        }
    }

    /// Record the node's partition space and mark its crawl as done
    fn report_node(&self, node: &NodeName) -> Result<()> {
        let mut space = SpaceReport::default();
        for mount in &self.config.disk_mounts {
            match (self.probe.total_bytes(mount), self.probe.free_bytes(mount)) {
                (Ok(total), Ok(free)) => {
                    space.total_bytes += total;
                    space.free_bytes += free;
                    space.used_bytes += total.saturating_sub(free);
                }
                _ => debug!("No space figures for {}", mount.display()),
            }
        }

        let now = Utc::now();
        self.store.data_servers().upsert(
            node.as_str(),
            || DataServer::new(node.clone(), now),
            |server| {
                server.space = Some(space);
                server.new_files_staged = false;
                server.last_crawler_run = Some(now);
            },
        )?;
        Ok(())
    }
}
