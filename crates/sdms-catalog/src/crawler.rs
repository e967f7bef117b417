//! Archive Crawler
//!
//! Walks the tape namespace and keeps two append-only ledgers current: one
//! Archive File per physical object and one Archive Item per logical
//! payload file. Re-running over an unchanged tree only refreshes
//! `last_seen`.

use crate::schema::ItemBuilder;
use chrono::Utc;
use sdms_common::config::ArchiveConfig;
use sdms_common::{FileKind, Result};
use sdms_meta_store::{ArchiveFile, ArchiveItem, DuplicateItem, MetaStore, UpsertOutcome};
use sdms_tools::{ArchiveEntry, ArchiveTool};
use tracing::{debug, info, warn};

/// Counters of one discovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStats {
    /// Set when an archive transfer was running and nothing was crawled
    pub aborted: bool,
    pub subfolders: usize,
    pub files_seen: usize,
    pub new_files: usize,
    pub containers_inventoried: usize,
    pub inventory_failures: usize,
    pub items_inserted: usize,
    pub duplicates: usize,
    pub parse_errors: usize,
}

/// Archive Crawler over one tape namespace
pub struct ArchiveCrawler<A> {
    store: MetaStore,
    tool: A,
    config: ArchiveConfig,
    builder: ItemBuilder,
}

impl<A: ArchiveTool> ArchiveCrawler<A> {
    pub fn new(store: MetaStore, tool: A, config: ArchiveConfig) -> Self {
        let builder = ItemBuilder::new(config.target, config.logical_root_marker.clone());
        Self {
            store,
            tool,
            config,
            builder,
        }
    }

    /// Crawl every root folder below the configured base folder
    pub async fn discover(&self, root_folders: &[String]) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();

        match self.tool.transfer_in_progress().await {
            Ok(true) => {
                info!("Archive transfer in progress, postponing crawl");
                stats.aborted = true;
                return Ok(stats);
            }
            Ok(false) => {}
            Err(e) => warn!("Could not check for running archive transfers: {}", e),
        }

        for root in root_folders {
            let folder = format!("{}/{}", self.config.base_folder.trim_end_matches('/'), root);
            let subfolders = match self.tool.list_subfolders(&folder).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(folder = %folder, "Failed to list root folder: {}", e);
                    continue;
                }
            };

            for subfolder in subfolders
                .iter()
                .filter(|s| s.contains(&self.config.subfolder_marker))
            {
                stats.subfolders += 1;
                match self.tool.list_files(subfolder).await {
                    Ok(entries) => self.process_entries(&entries, &mut stats).await?,
                    Err(e) => warn!(subfolder = %subfolder, "Failed to list subfolder: {}", e),
                }
            }
        }

        info!(
            "Archive crawl done: {} subfolders, {} files ({} new), {} containers inventoried ({} failed), {} items, {} duplicates, {} unparsable",
            stats.subfolders,
            stats.files_seen,
            stats.new_files,
            stats.containers_inventoried,
            stats.inventory_failures,
            stats.items_inserted,
            stats.duplicates,
            stats.parse_errors
        );
        Ok(stats)
    }

    async fn process_entries(&self, entries: &[ArchiveEntry], stats: &mut CrawlStats) -> Result<()> {
        let mut batch = Vec::new();

        for entry in entries {
            stats.files_seen += 1;
            let file_name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
            let kind = FileKind::classify(file_name, self.builder.suffix());

            let now = Utc::now();
            let (outcome, file) = self.store.archive_files().upsert(
                &entry.path,
                || ArchiveFile::new(&entry.path, entry.size, kind, now),
                |file| file.last_seen = now,
            )?;
            let is_new = outcome == UpsertOutcome::Inserted;
            if is_new {
                stats.new_files += 1;
            }

            match file.kind {
                FileKind::Container if is_new || file.needs_inventory() => {
                    self.inventory(&file, stats).await?;
                }
                FileKind::Payload if is_new => match self.builder.build(&entry.path, entry.size, None) {
                    Ok(item) => batch.push(item),
                    Err(e) => {
                        warn!("Skipping {}: {}", entry.path, e);
                        stats.parse_errors += 1;
                    }
                },
                _ => {}
            }

            if batch.len() >= self.config.insert_batch_size {
                self.insert_items(std::mem::take(&mut batch), stats)?;
            }
        }

        if !batch.is_empty() {
            self.insert_items(batch, stats)?;
        }
        Ok(())
    }

    /// List a container's members and catalogue its payload members. A
    /// listing failure leaves the member count unset for the next crawl.
    async fn inventory(&self, file: &ArchiveFile, stats: &mut CrawlStats) -> Result<()> {
        let members = match self.tool.list_container(&file.path).await {
            Ok(members) => members,
            Err(e) => {
                warn!(container = %file.path, "Container inventory failed: {}", e);
                stats.inventory_failures += 1;
                return Ok(());
            }
        };

        let mut items = Vec::new();
        for member in members.iter().filter(|m| m.path.ends_with(self.builder.suffix())) {
            match self.builder.build(&member.path, member.size, Some(&file.path)) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(container = %file.path, "Skipping member {}: {}", member.path, e);
                    stats.parse_errors += 1;
                }
            }
        }
        let payload_count = u32::try_from(items.len()).unwrap_or(u32::MAX);
        debug!(container = %file.path, "{} payload members", payload_count);

        self.insert_items(items, stats)?;
        self.store
            .archive_files()
            .update_one(&file.path, |f| f.member_count = Some(payload_count))?;
        stats.containers_inventoried += 1;
        Ok(())
    }

    /// Insert a batch; items whose logical path is already catalogued go to
    /// the duplicate table with the primary's size.
    fn insert_items(&self, items: Vec<ArchiveItem>, stats: &mut CrawlStats) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let collections = self.store.archive(self.config.target);
        let report = collections.items.insert_many(items)?;
        stats.items_inserted += report.inserted;

        let now = Utc::now();
        for item in report.already_exists {
            let primary_size = match collections.items.get(&item.path)? {
                Some(primary) => primary.size,
                None => item.size,
            };
            let duplicate = DuplicateItem::new(item, primary_size, now);
            if duplicate.size_mismatch {
                warn!(
                    "Duplicate with different size: {} ({} vs {})",
                    duplicate.item.full_path, duplicate.item.size, primary_size
                );
            }
            collections.duplicates.put(&duplicate)?;
            stats.duplicates += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sdms_common::{AttrValue, Error, TargetClass};
    use sdms_tools::ContainerMember;
    use std::collections::HashMap;
    use std::path::Path;

    const RUN10: &str = "/nersc/projects/starofl/picodsts/Run10";
    const TAR: &str = "/nersc/projects/starofl/picodsts/Run10/AuAu/11GeV/all/P10ih/148.tar";
    const STANDALONE: &str = "/nersc/projects/starofl/picodsts/Run10/AuAu/11GeV/all/P10ih/148/11148001/st_physics_11148001_raw_1.picoDst.root";
    const MEMBER: &str = "/project/starprod/picodsts/Run10/AuAu/11GeV/all/P10ih/148/11148002/st_physics_11148002_raw_1.picoDst.root";

    #[derive(Default)]
    struct FakeArchive {
        subfolders: Vec<String>,
        files: HashMap<String, Vec<ArchiveEntry>>,
        containers: HashMap<String, Vec<ContainerMember>>,
        broken_containers: Mutex<Vec<String>>,
        transfer_running: bool,
        container_listings: Mutex<usize>,
    }

    #[async_trait]
    impl ArchiveTool for FakeArchive {
        async fn list_subfolders(&self, _folder: &str) -> Result<Vec<String>> {
            Ok(self.subfolders.clone())
        }

        async fn list_files(&self, subfolder: &str) -> Result<Vec<ArchiveEntry>> {
            Ok(self.files.get(subfolder).cloned().unwrap_or_default())
        }

        async fn list_container(&self, container: &str) -> Result<Vec<ContainerMember>> {
            *self.container_listings.lock() += 1;
            if self.broken_containers.lock().iter().any(|c| c == container) {
                return Err(Error::tool("htar", "no index"));
            }
            Ok(self.containers.get(container).cloned().unwrap_or_default())
        }

        async fn extract_container(&self, _container: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }

        async fn extract_member(&self, _container: &str, _member: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }

        async fn extract_file(&self, _path: &str, _dest: &Path) -> Result<()> {
            Ok(())
        }

        async fn transfer_in_progress(&self) -> Result<bool> {
            Ok(self.transfer_running)
        }
    }

    fn entry(path: &str, size: u64) -> ArchiveEntry {
        ArchiveEntry {
            path: path.to_string(),
            size,
        }
    }

    fn archive() -> FakeArchive {
        let mut fake = FakeArchive {
            subfolders: vec![RUN10.to_string(), "/nersc/projects/starofl/picodsts/tmp".to_string()],
            ..FakeArchive::default()
        };
        fake.files.insert(
            RUN10.to_string(),
            vec![
                entry(TAR, 52_428_800),
                entry(&format!("{TAR}.idx"), 10_240),
                entry(STANDALONE, 100),
                entry("/nersc/projects/starofl/picodsts/Run10/README", 1),
            ],
        );
        fake.containers.insert(
            TAR.to_string(),
            vec![
                ContainerMember {
                    path: MEMBER.to_string(),
                    size: 200,
                },
                ContainerMember {
                    path: "/project/starprod/picodsts/Run10/AuAu/11GeV/all/P10ih/148/11148002/notes.txt".to_string(),
                    size: 3,
                },
            ],
        );
        fake
    }

    fn crawler(dir: &Path, fake: FakeArchive) -> ArchiveCrawler<FakeArchive> {
        let store = MetaStore::open(dir.join("catalog.redb")).unwrap();
        ArchiveCrawler::new(store, fake, ArchiveConfig::default())
    }

    fn roots() -> Vec<String> {
        vec!["picodsts".to_string()]
    }

    #[tokio::test]
    async fn test_discover_catalogues_files_and_items() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = crawler(dir.path(), archive());

        let stats = crawler.discover(&roots()).await.unwrap();
        assert_eq!(stats.subfolders, 1);
        assert_eq!(stats.files_seen, 4);
        assert_eq!(stats.new_files, 4);
        assert_eq!(stats.items_inserted, 2);
        assert_eq!(stats.containers_inventoried, 1);

        let files = crawler.store.archive_files();
        assert_eq!(files.get(TAR).unwrap().unwrap().member_count, Some(1));
        assert_eq!(
            files.get(&format!("{TAR}.idx")).unwrap().unwrap().kind,
            FileKind::Index
        );

        let items = &crawler.store.archive(TargetClass::PicoDst).items;
        let member = items
            .get("Run10/AuAu/11GeV/all/P10ih/148/11148002/st_physics_11148002_raw_1.picoDst.root")
            .unwrap()
            .unwrap();
        assert_eq!(member.container.as_deref(), Some(TAR));
        assert_eq!(member.archive_path(), TAR);
        assert_eq!(member.detail("day"), Some(&AttrValue::Int(148)));
    }

    #[tokio::test]
    async fn test_discover_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = crawler(dir.path(), archive());

        crawler.discover(&roots()).await.unwrap();
        let first_seen = crawler.store.archive_files().get(STANDALONE).unwrap().unwrap();

        let stats = crawler.discover(&roots()).await.unwrap();
        assert_eq!(stats.new_files, 0);
        assert_eq!(stats.items_inserted, 0);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(*crawler.tool.container_listings.lock(), 1);

        let items = &crawler.store.archive(TargetClass::PicoDst);
        assert_eq!(items.items.count().unwrap(), 2);
        assert_eq!(items.duplicates.count().unwrap(), 0);

        let again = crawler.store.archive_files().get(STANDALONE).unwrap().unwrap();
        assert_eq!(again.first_seen, first_seen.first_seen);
        assert!(again.last_seen >= first_seen.last_seen);
    }

    #[tokio::test]
    async fn test_same_logical_path_goes_to_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = archive();
        let backup = STANDALONE.replace("Run10/", "Run10.bak/");
        let resized = STANDALONE.replace("/nersc/projects/", "/nersc/other/");
        fake.files.get_mut(RUN10).unwrap().extend([entry(&backup, 100), entry(&resized, 999)]);
        let crawler = crawler(dir.path(), fake);

        let stats = crawler.discover(&roots()).await.unwrap();
        assert_eq!(stats.duplicates, 2);

        let collections = crawler.store.archive(TargetClass::PicoDst);
        let logical = "Run10/AuAu/11GeV/all/P10ih/148/11148001/st_physics_11148001_raw_1.picoDst.root";
        let primary = collections.items.get(logical).unwrap().unwrap();
        assert_eq!(primary.full_path, STANDALONE);
        assert_eq!(primary.size, 100);

        let duplicates = collections.duplicates.all().unwrap();
        assert_eq!(duplicates.len(), 2);
        let same = duplicates.iter().find(|d| d.item.full_path == backup).unwrap();
        assert!(same.item.is_backup);
        assert!(!same.size_mismatch);
        let other = duplicates.iter().find(|d| d.item.full_path == resized).unwrap();
        assert!(other.size_mismatch);
        assert_eq!(other.primary_size, 100);
    }

    #[tokio::test]
    async fn test_failed_inventory_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fake = archive();
        fake.broken_containers.lock().push(TAR.to_string());
        let crawler = crawler(dir.path(), fake);

        let stats = crawler.discover(&roots()).await.unwrap();
        assert_eq!(stats.inventory_failures, 1);
        assert_eq!(stats.items_inserted, 1);
        assert!(crawler.store.archive_files().get(TAR).unwrap().unwrap().needs_inventory());

        crawler.tool.broken_containers.lock().clear();
        let stats = crawler.discover(&roots()).await.unwrap();
        assert_eq!(stats.containers_inventoried, 1);
        assert_eq!(stats.items_inserted, 1);
        assert_eq!(
            crawler.store.archive_files().get(TAR).unwrap().unwrap().member_count,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_running_transfer_postpones_crawl() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchive {
            transfer_running: true,
            ..archive()
        };
        let crawler = crawler(dir.path(), fake);

        let stats = crawler.discover(&roots()).await.unwrap();
        assert!(stats.aborted);
        assert_eq!(crawler.store.archive_files().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_small_batches_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("catalog.redb")).unwrap();
        let config = ArchiveConfig {
            insert_batch_size: 1,
            ..ArchiveConfig::default()
        };
        let crawler = ArchiveCrawler::new(store, archive(), config);

        let stats = crawler.discover(&roots()).await.unwrap();
        assert_eq!(stats.items_inserted, 2);
    }
}
