//! End-of-cycle triage and teardown

use crate::stager::{CYCLE_LOCK, GROUP_LOCK_PREFIX, Stager};
use chrono::{DateTime, Utc};
use sdms_common::{ArchiveStatus, DeliveryStatus, Result};
use sdms_meta_store::StageToCacheJob;
use sdms_tools::CopyTool;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Why a cycle is not over yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    UnstagedJobs,
    /// Jobs claimed by a worker that has not reported back yet
    InFlight,
    NodesToCrawl,
    Observations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No cycle is active
    NotActive,
    Continuing(Pending),
    Ended,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownStats {
    pub archive_jobs_purged: usize,
    pub cache_jobs_purged: usize,
    pub reset_for_retry: usize,
    pub escalated: usize,
    pub rolled_back: usize,
    /// Archive jobs dropped when the cycle ended
    pub failed_archive_jobs: usize,
    pub investigate: usize,
    pub scratch_dirs_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub state: CycleState,
    pub stats: TeardownStats,
}

impl<A, S, C: CopyTool, P> Stager<A, S, C, P> {
    /// Advance the cycle towards its end, releasing the cycle when no work
    /// or crawl backlog remains
    pub async fn check_end_of_cycle(&self) -> Result<TeardownReport> {
        let mut stats = TeardownStats::default();
        let locks = self.store.locks();
        if !locks.is_present(CYCLE_LOCK)? {
            info!("No staging cycle active");
            return Ok(TeardownReport {
                state: CycleState::NotActive,
                stats,
            });
        }
        if !locks.is_held(CYCLE_LOCK)? {
            warn!("Staging cycle lock expired, finishing the cycle it belongs to");
        }
        self.keep_cycle_alive()?;

        self.purge_staged(&mut stats)?;
        if self.has_unstaged()? {
            return Ok(continuing(Pending::UnstagedJobs, stats));
        }

        let now = Utc::now();
        self.triage_failed(&mut stats, now)?;
        self.roll_back_stuck(&mut stats, now)?;
        if self.has_unstaged()? {
            return Ok(continuing(Pending::UnstagedJobs, stats));
        }
        if self.has_in_flight()? {
            return Ok(continuing(Pending::InFlight, stats));
        }

        let to_crawl = self
            .store
            .data_servers()
            .count_where(|server| server.new_files_staged)?;
        if to_crawl > 0 {
            info!("{} cache nodes still have to crawl newly staged files", to_crawl);
            return Ok(continuing(Pending::NodesToCrawl, stats));
        }
        for &target in &self.cache.targets {
            let cache = self.store.cache(target);
            if cache.new.count()? > 0 || cache.missing.count()? > 0 {
                info!(target = %target, "Cache observations still waiting for reconciliation");
                return Ok(continuing(Pending::Observations, stats));
            }
        }

        self.end_cycle(&mut stats).await?;
        Ok(TeardownReport {
            state: CycleState::Ended,
            stats,
        })
    }

    fn purge_staged(&self, stats: &mut TeardownStats) -> Result<()> {
        stats.archive_jobs_purged = self
            .store
            .stage_from_archive()
            .delete_many(|job| job.status == ArchiveStatus::Staged)?;
        for stage_target in self.stage_targets() {
            stats.cache_jobs_purged += self
                .store
                .stage_to_cache(stage_target)
                .delete_many(|job| job.target_status == DeliveryStatus::Staged)?;
        }
        debug!(
            "Purged {} archive jobs and {} cache jobs",
            stats.archive_jobs_purged, stats.cache_jobs_purged
        );
        Ok(())
    }

    fn has_unstaged(&self) -> Result<bool> {
        if self
            .store
            .stage_from_archive()
            .count_where(|job| job.status == ArchiveStatus::Unstaged)?
            > 0
        {
            return Ok(true);
        }
        for stage_target in self.stage_targets() {
            let unstaged = self
                .store
                .stage_to_cache(stage_target)
                .count_where(StageToCacheJob::ready_for_delivery)?;
            if unstaged > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn has_in_flight(&self) -> Result<bool> {
        if self
            .store
            .stage_from_archive()
            .count_where(|job| job.status == ArchiveStatus::Staging)?
            > 0
        {
            return Ok(true);
        }
        for stage_target in self.stage_targets() {
            let staging = self
                .store
                .stage_to_cache(stage_target)
                .count_where(|job| job.target_status == DeliveryStatus::Staging)?;
            if staging > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Failed deliveries caused only by full disks go back into the queue a
    /// bounded number of times; everything else needs a human
    fn triage_failed(&self, stats: &mut TeardownStats, now: DateTime<Utc>) -> Result<()> {
        let max_resets = self.staging.copy.max_no_space_resets;
        for stage_target in self.stage_targets() {
            self.store.stage_to_cache(stage_target).update_many(
                |job| job.target_status == DeliveryStatus::Failed,
                |job| {
                    if job.errors.only_no_space() && job.resets < max_resets {
                        job.resets += 1;
                        job.set_target_status(DeliveryStatus::Unstaged, now);
                        stats.reset_for_retry += 1;
                    } else {
                        job.set_target_status(DeliveryStatus::Investigate, now);
                        stats.escalated += 1;
                    }
                },
            )?;
        }
        if stats.escalated > 0 {
            warn!("{} cache jobs need investigation", stats.escalated);
        }
        Ok(())
    }

    fn roll_back_stuck(&self, stats: &mut TeardownStats, now: DateTime<Utc>) -> Result<()> {
        let timeout = chrono::Duration::from_std(self.staging.staging_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let stuck_since = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);

        stats.rolled_back += self.store.stage_from_archive().update_many(
            |job| job.status == ArchiveStatus::Staging && job.status_changed < stuck_since,
            |job| {
                job.roll_back(now);
            },
        )?;
        for stage_target in self.stage_targets() {
            stats.rolled_back += self.store.stage_to_cache(stage_target).update_many(
                |job| job.target_status == DeliveryStatus::Staging && job.status_changed < stuck_since,
                |job| job.set_target_status(DeliveryStatus::Unstaged, now),
            )?;
        }
        if stats.rolled_back > 0 {
            warn!("Rolled back {} jobs stuck in staging", stats.rolled_back);
        }
        Ok(())
    }

    async fn end_cycle(&self, stats: &mut TeardownStats) -> Result<()> {
        for job in self
            .store
            .stage_from_archive()
            .find(|job| job.status == ArchiveStatus::Failed)?
        {
            warn!(path = %job.path, wanted = job.wanted.len(), "Archive retrieval failed this cycle");
        }
        stats.failed_archive_jobs = self
            .store
            .stage_from_archive()
            .delete_many(|job| job.status == ArchiveStatus::Failed)?;
        for stage_target in self.stage_targets() {
            stats.investigate += self
                .store
                .stage_to_cache(stage_target)
                .count_where(|job| job.target_status == DeliveryStatus::Investigate)?;
        }

        self.store.locks().release(CYCLE_LOCK)?;
        let groups = self.store.locks().release_prefix(GROUP_LOCK_PREFIX)?;
        debug!("Released cycle lock and {} group locks", groups);

        stats.scratch_dirs_removed = remove_empty_dirs(&self.staging.scratch_dir);
        match self.copy.kill_stale().await {
            Ok(true) => info!("Terminated lingering copy processes"),
            Ok(false) => {}
            Err(e) => warn!("Could not sweep copy processes: {}", e),
        }

        info!(
            "Staging cycle ended: {} archive jobs failed, {} cache jobs to investigate, {} empty scratch folders removed",
            stats.failed_archive_jobs, stats.investigate, stats.scratch_dirs_removed
        );
        Ok(())
    }
}

fn continuing(pending: Pending, stats: TeardownStats) -> TeardownReport {
    info!(?pending, "Staging cycle continues");
    TeardownReport {
        state: CycleState::Continuing(pending),
        stats,
    }
}

/// Remove every empty directory below `root`, deepest first; `root` stays
fn remove_empty_dirs(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_dir())
    {
        // Non-empty directories fail to remove
        if std::fs::remove_dir(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}
