//! Cycle preparation: request marking and job creation

use crate::ordering::OrderStats;
use crate::request::{RequestRules, StagingRequest};
use crate::stager::{CYCLE_LOCK, Stager};
use chrono::Utc;
use sdms_common::{
    ArchiveStatus, DeliveryStatus, NodeName, Result, StageTarget, TargetClass,
};
use sdms_meta_store::{
    CacheEntry, ErrorCounters, InsertOutcome, LockState, StageFromArchiveJob, StageToCacheJob,
    UpsertOutcome,
};
use sdms_tools::TapeSorter;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Items carrying a staging marker after a request was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkCount {
    pub target: TargetClass,
    pub stage_target: StageTarget,
    pub marked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub marked: usize,
    /// Marked and already held by enough cache nodes
    pub resident: usize,
    /// Held by the cache but no longer requested
    pub unrequested: usize,
    pub to_stage: usize,
    pub archive_jobs: usize,
    pub cache_jobs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub sets: usize,
    pub rejected_sets: usize,
    pub n_copies: u32,
    pub marks: Vec<MarkCount>,
    pub jobs: JobStats,
    pub order: OrderStats,
}

impl<A, S: TapeSorter, C, P> Stager<A, S, C, P> {
    /// Open a staging cycle from the configured request file.
    ///
    /// Returns `None` when another cycle is active. The cycle lock stays
    /// held after a successful return; it is released by
    /// [`Stager::check_end_of_cycle`]. An invalid request releases it again.
    pub async fn prepare_staging(&self) -> Result<Option<PrepareReport>> {
        let locks = self.store.locks();
        if locks.is_present(CYCLE_LOCK)? && !locks.is_held(CYCLE_LOCK)? && self.has_cycle_jobs()? {
            warn!("Expired staging cycle still has jobs, end it before preparing a new one");
            return Ok(None);
        }
        if let LockState::Held(lock) = self.store.locks().acquire(CYCLE_LOCK, self.lock_ttl)? {
            info!(host = %lock.host, "Staging cycle already active, nothing to prepare");
            return Ok(None);
        }

        let rules = RequestRules {
            targets: &self.staging.targets,
            stage_targets: &self.staging.stage_targets,
            query_items: &self.staging.query_items,
        };
        let request = match StagingRequest::from_file(&self.staging.request_file, &rules) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting staging request: {}", e);
                self.store.locks().release(CYCLE_LOCK)?;
                return Err(e);
            }
        };

        self.prepare_request(&request).await.map(Some)
    }

    fn has_cycle_jobs(&self) -> Result<bool> {
        if self.store.stage_from_archive().count()? > 0 {
            return Ok(true);
        }
        for stage_target in self.stage_targets() {
            if self.store.stage_to_cache(stage_target).count()? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Mark, create jobs and order them for an already parsed request
    pub async fn prepare_request(&self, request: &StagingRequest) -> Result<PrepareReport> {
        let marks = self.mark_files(request)?;
        let jobs = self.prepare_jobs(request.n_copies)?;
        let order = self.order_jobs().await?;

        info!(
            "Staging prepared: {} marked, {} resident, {} to stage, {} archive jobs, {} cache jobs",
            jobs.marked, jobs.resident, jobs.to_stage, jobs.archive_jobs, jobs.cache_jobs
        );
        Ok(PrepareReport {
            sets: request.sets.len(),
            rejected_sets: request.rejected,
            n_copies: request.n_copies,
            marks,
            jobs,
            order,
        })
    }
}

impl<A, S, C, P> Stager<A, S, C, P> {
    /// Clear every staging marker, then mark the items matched by each set
    pub fn mark_files(&self, request: &StagingRequest) -> Result<Vec<MarkCount>> {
        for target in &self.staging.targets {
            let items = &self.store.archive(*target).items;
            let cleared = items.update_many(
                |item| item.staging.values().any(|marked| *marked),
                |item| item.staging.values_mut().for_each(|marked| *marked = false),
            )?;
            if cleared > 0 {
                info!(target = %target, "Cleared {} staging markers", cleared);
            }
        }

        for set in &request.sets {
            let matched = self.store.archive(set.target).items.update_many(
                |item| set.matches(item),
                |item| {
                    item.staging.insert(set.stage_target, true);
                },
            )?;
            info!(
                target = %set.target,
                stage_target = %set.stage_target,
                "Staging set matched {} items",
                matched
            );
        }

        let mut counts = Vec::new();
        for target in &self.staging.targets {
            for stage_target in self.stage_targets() {
                let marked = self
                    .store
                    .archive(*target)
                    .items
                    .count_where(|item| item.is_marked(stage_target))?;
                info!(
                    target = %target,
                    stage_target = %stage_target,
                    "{} items marked for staging",
                    marked
                );
                counts.push(MarkCount {
                    target: *target,
                    stage_target,
                    marked,
                });
            }
        }
        Ok(counts)
    }

    /// Create archive and cache jobs for every marked item not yet held by
    /// `n_copies` cache nodes
    pub fn prepare_jobs(&self, n_copies: u32) -> Result<JobStats> {
        let mut stats = JobStats::default();
        for &target in &self.staging.targets {
            for stage_target in self.stage_targets() {
                self.prepare_pair(target, stage_target, n_copies, &mut stats)?;
            }
        }
        Ok(stats)
    }

    fn prepare_pair(
        &self,
        target: TargetClass,
        stage_target: StageTarget,
        n_copies: u32,
        stats: &mut JobStats,
    ) -> Result<()> {
        let marked = self
            .store
            .archive(target)
            .items
            .find(|item| item.is_marked(stage_target))?;
        let entries: BTreeMap<String, CacheEntry> = self
            .store
            .cache(target)
            .entries
            .all()?
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();

        let marked_paths: BTreeSet<&str> = marked.iter().map(|item| item.path.as_str()).collect();
        let unrequested = entries
            .keys()
            .filter(|path| !marked_paths.contains(path.as_str()))
            .count();
        stats.marked += marked.len();
        stats.unrequested += unrequested;

        let now = Utc::now();
        let mut to_stage = 0;
        for item in &marked {
            let existing = entries.get(&item.path);
            if existing.is_some_and(|entry| entry.copy_count() >= n_copies) {
                stats.resident += 1;
                continue;
            }
            let target_groups = self.target_groups(n_copies, existing)?;
            if target_groups.is_empty() {
                stats.resident += 1;
                continue;
            }
            to_stage += 1;

            let archive_path = item.archive_path().to_string();
            let member_count = if item.in_container() {
                self.store
                    .archive_files()
                    .get(&archive_path)?
                    .and_then(|file| file.member_count)
            } else {
                None
            };
            let (outcome, _) = self.store.stage_from_archive().upsert(
                &archive_path,
                || StageFromArchiveJob {
                    path: archive_path.clone(),
                    target,
                    stage_target,
                    status: ArchiveStatus::Unstaged,
                    order_idx: None,
                    group: None,
                    is_container: item.in_container(),
                    member_count,
                    wanted: BTreeSet::new(),
                    status_changed: now,
                },
                |job| {
                    job.wanted.insert(item.full_path.clone());
                },
            )?;
            if outcome == UpsertOutcome::Inserted {
                stats.archive_jobs += 1;
            }

            let job = StageToCacheJob {
                path: item.path.clone(),
                full_path: item.full_path.clone(),
                size: item.size,
                target,
                stage_target,
                target_groups,
                hpss_status: ArchiveStatus::Unstaged,
                target_status: DeliveryStatus::Unstaged,
                errors: ErrorCounters::default(),
                trials: 0,
                resets: 0,
                notes: Vec::new(),
                status_changed: now,
            };
            if self.store.stage_to_cache(stage_target).insert(&job)? == InsertOutcome::Inserted {
                stats.cache_jobs += 1;
            }
        }
        stats.to_stage += to_stage;

        info!(
            target = %target,
            stage_target = %stage_target,
            "{} marked, {} to stage, {} resident but not requested",
            marked.len(),
            to_stage,
            unrequested
        );
        Ok(())
    }

    /// Node groups a file is copied to. A single copy goes to the whole
    /// cache; multiple copies go to one replica group each, skipping groups
    /// that already hold the file.
    fn target_groups(&self, n_copies: u32, existing: Option<&CacheEntry>) -> Result<Vec<String>> {
        if n_copies <= 1 {
            return Ok(vec![self.cluster.all_group.name.clone()]);
        }
        let holders: Vec<&NodeName> = existing.map(|e| e.nodes().keys().collect()).unwrap_or_default();
        let mut holder_roles = BTreeSet::new();
        for node in holders {
            if let Some(server) = self.store.data_servers().get(node.as_str())? {
                holder_roles.extend(server.roles);
            }
        }
        Ok(self
            .cluster
            .replica_groups
            .iter()
            .filter(|group| {
                group
                    .data_server_role
                    .as_ref()
                    .is_none_or(|role| !holder_roles.contains(role))
            })
            .map(|group| group.name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, archive_item, archive_job};
    use std::time::Duration;
    use sdms_meta_store::DataServer;

    #[tokio::test]
    async fn test_request_marks_and_clears() {
        let h = Harness::new();
        let items = &h.stager.store().archive(TargetClass::PicoDst).items;
        let mut stale = archive_item("Run11", "a", None, 10);
        stale.staging.insert(StageTarget::Xrd, true);
        items
            .insert_many([
                archive_item("Run10", "a", None, 10),
                archive_item("Run10", "b", None, 20),
                stale,
            ])
            .unwrap();

        let request =
            h.request(r#"{"sets":[{"target":"picoDst","stageTarget":"XRD","runyear":"Run10"}]}"#);
        let counts = h.stager.mark_files(&request).unwrap();

        let marked: Vec<String> = items
            .find(|i| i.is_marked(StageTarget::Xrd))
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert_eq!(marked.len(), 2);
        assert!(marked.iter().all(|p| p.starts_with("Run10/")));
        let run11 = items.find_one(|i| i.path.starts_with("Run11/")).unwrap().unwrap();
        assert_eq!(run11.staging.get(&StageTarget::Xrd), Some(&false));

        let pico = counts.iter().find(|c| c.target == TargetClass::PicoDst).unwrap();
        assert_eq!(pico.marked, 2);
    }

    #[tokio::test]
    async fn test_jobs_skip_resident_files() {
        let h = Harness::new();
        let store = h.stager.store();
        let resident = archive_item("Run10", "a", None, 10);
        let mut in_tar = archive_item("Run10", "b", Some("/nersc/148.tar"), 20);
        let mut sibling = archive_item("Run10", "c", Some("/nersc/148.tar"), 30);
        let mut loose = archive_item("Run10", "d", None, 40);
        for item in [&mut in_tar, &mut sibling, &mut loose] {
            item.staging.insert(StageTarget::Xrd, true);
        }
        let mut marked_resident = resident.clone();
        marked_resident.staging.insert(StageTarget::Xrd, true);
        store
            .archive(TargetClass::PicoDst)
            .items
            .insert_many([marked_resident, in_tar.clone(), sibling.clone(), loose.clone()])
            .unwrap();

        let mut file = sdms_meta_store::ArchiveFile::new(
            "/nersc/148.tar",
            50,
            sdms_common::FileKind::Container,
            Utc::now(),
        );
        file.member_count = Some(12);
        store.archive_files().insert(&file).unwrap();

        let entries = &store.cache(TargetClass::PicoDst).entries;
        entries
            .insert(&CacheEntry::from_archive(
                &resident,
                "/x/a",
                BTreeMap::from([(NodeName::from("n1"), "data".to_string())]),
            ))
            .unwrap();
        let other = archive_item("Run09", "z", None, 1);
        entries
            .insert(&CacheEntry::from_archive(
                &other,
                "/x/z",
                BTreeMap::from([(NodeName::from("n1"), "data".to_string())]),
            ))
            .unwrap();

        let stats = h.stager.prepare_jobs(1).unwrap();
        assert_eq!(stats.marked, 4);
        assert_eq!(stats.resident, 1);
        assert_eq!(stats.unrequested, 1);
        assert_eq!(stats.to_stage, 3);
        assert_eq!(stats.archive_jobs, 2);
        assert_eq!(stats.cache_jobs, 3);

        let tar = store.stage_from_archive().get("/nersc/148.tar").unwrap().unwrap();
        assert!(tar.is_container);
        assert_eq!(tar.member_count, Some(12));
        assert_eq!(tar.wanted.len(), 2);
        assert!(tar.wanted.contains(&in_tar.full_path));
        let single = store.stage_from_archive().get(&loose.full_path).unwrap().unwrap();
        assert!(!single.is_container);

        let job = store
            .stage_to_cache(StageTarget::Xrd)
            .get(&loose.path)
            .unwrap()
            .unwrap();
        assert_eq!(job.target_groups, vec!["MENDEL_ALL".to_string()]);
        assert_eq!(job.hpss_status, ArchiveStatus::Unstaged);

        // Preparing again creates nothing new
        let again = h.stager.prepare_jobs(1).unwrap();
        assert_eq!(again.archive_jobs, 0);
        assert_eq!(again.cache_jobs, 0);
    }

    #[tokio::test]
    async fn test_replicas_skip_groups_holding_a_copy() {
        let h = Harness::new();
        let store = h.stager.store();
        let mut item = archive_item("Run10", "a", None, 10);
        item.staging.insert(StageTarget::Xrd, true);
        store.archive(TargetClass::PicoDst).items.insert(&item).unwrap();
        store
            .cache(TargetClass::PicoDst)
            .entries
            .insert(&CacheEntry::from_archive(
                &item,
                "/x/a",
                BTreeMap::from([(NodeName::from("mc0101"), "data".to_string())]),
            ))
            .unwrap();
        let mut server = DataServer::new(NodeName::from("mc0101"), Utc::now());
        server.roles = vec!["MENDEL_ONE_DATASERVER".to_string()];
        store.data_servers().put(&server).unwrap();

        let stats = h.stager.prepare_jobs(2).unwrap();
        assert_eq!(stats.cache_jobs, 1);
        let job = store
            .stage_to_cache(StageTarget::Xrd)
            .get(&item.path)
            .unwrap()
            .unwrap();
        assert_eq!(job.target_groups, vec!["MENDEL_2".to_string()]);
    }

    #[tokio::test]
    async fn test_prepare_staging_holds_cycle_lock() {
        let h = Harness::new();
        let item = archive_item("Run10", "a", None, 10);
        h.stager.store().archive(TargetClass::PicoDst).items.insert(&item).unwrap();
        h.write_request(r#"{"sets":[{"target":"picoDst","stageTarget":"XRD","runyear":"Run10"}]}"#);

        let report = h.stager.prepare_staging().await.unwrap().unwrap();
        assert_eq!(report.sets, 1);
        assert_eq!(report.jobs.cache_jobs, 1);
        assert_eq!(report.order.groups, 1);
        assert!(h.stager.store().locks().is_held(CYCLE_LOCK).unwrap());

        assert!(h.stager.prepare_staging().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_cycle_blocks_new_cycle_while_jobs_remain() {
        let h = Harness::new();
        let store = h.stager.store();
        store.locks().acquire(CYCLE_LOCK, Duration::from_millis(1)).unwrap();
        let mut marked = archive_item("Run11", "old", None, 10);
        marked.staging.insert(StageTarget::Xrd, true);
        store.archive(TargetClass::PicoDst).items.insert(&marked).unwrap();
        store
            .stage_from_archive()
            .insert(&archive_job(&marked.full_path, ArchiveStatus::Unstaged))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.write_request(r#"{"sets":[{"target":"picoDst","stageTarget":"XRD","runyear":"Run10"}]}"#);

        assert!(h.stager.prepare_staging().await.unwrap().is_none());
        let item = store.archive(TargetClass::PicoDst).items.get(&marked.path).unwrap().unwrap();
        assert_eq!(item.staging.get(&StageTarget::Xrd), Some(&true));

        store.stage_from_archive().delete(&marked.full_path).unwrap();
        let report = h.stager.prepare_staging().await.unwrap().unwrap();
        assert_eq!(report.sets, 1);
        assert!(store.locks().is_held(CYCLE_LOCK).unwrap());
    }

    #[tokio::test]
    async fn test_invalid_request_releases_cycle_lock() {
        let h = Harness::new();
        h.write_request(r#"{"nCopies":1}"#);
        let err = h.stager.prepare_staging().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!h.stager.store().locks().is_held(CYCLE_LOCK).unwrap());
    }
}
