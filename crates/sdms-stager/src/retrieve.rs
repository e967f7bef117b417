//! Archive retrieval into scratch, one worker per stage group

use crate::stager::{GIB, Stager, group_lock_name};
use chrono::Utc;
use sdms_common::{ArchiveStatus, DeliveryStatus, ErrorClass, Result};
use sdms_meta_store::{LockState, StageFromArchiveJob};
use sdms_tools::{ArchiveTool, SpaceProbe, extracted_path};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrieveStats {
    /// Another worker holds the group
    pub skipped: bool,
    pub claimed: usize,
    pub staged: usize,
    pub failed: usize,
    pub files_delivered: usize,
    pub space_exhausted: bool,
    /// The group lock disappeared or changed hands mid-run
    pub lock_lost: bool,
}

/// Files of one job that reached scratch
#[derive(Debug, Default)]
struct Retrieval {
    delivered: BTreeSet<String>,
    errors: Vec<String>,
}

impl<A: ArchiveTool, S, C, P: SpaceProbe> Stager<A, S, C, P> {
    /// Retrieve the jobs of stage group `group` in tape order until the
    /// group is drained or scratch space runs out
    pub async fn stage_from_archive(&self, group: u32) -> Result<RetrieveStats> {
        let lock = group_lock_name(group);
        if let LockState::Held(held) = self.store.locks().acquire(&lock, self.lock_ttl)? {
            info!(group, host = %held.host, "Stage group already being retrieved");
            return Ok(RetrieveStats {
                skipped: true,
                ..RetrieveStats::default()
            });
        }

        let result = self.retrieve_group(group, &lock).await;
        if !matches!(&result, Ok(stats) if stats.lock_lost) {
            self.store.locks().release(&lock)?;
        }
        result
    }

    async fn retrieve_group(&self, group: u32, lock: &str) -> Result<RetrieveStats> {
        tokio::fs::create_dir_all(&self.staging.scratch_dir).await?;
        let mut stats = RetrieveStats::default();
        loop {
            if !self.store.locks().renew(lock, self.lock_ttl)? {
                warn!(group, "Stage group lock lost, leaving the group to its new holder");
                stats.lock_lost = true;
                break;
            }
            self.keep_cycle_alive()?;
            if !self.scratch_has_room()? {
                stats.space_exhausted = true;
                break;
            }
            let now = Utc::now();
            let claimed = self.store.stage_from_archive().claim_first(
                |job| job.group == Some(group) && job.status == ArchiveStatus::Unstaged,
                StageFromArchiveJob::order_key,
                |job| {
                    job.advance(ArchiveStatus::Staging, now);
                },
            )?;
            let Some(job) = claimed else {
                break;
            };
            stats.claimed += 1;

            let retrieval = self.retrieve(&job).await;
            stats.files_delivered += retrieval.delivered.len();
            if self.finish(&job, &retrieval)? == ArchiveStatus::Staged {
                stats.staged += 1;
            } else {
                stats.failed += 1;
            }
        }

        info!(
            group,
            "Archive retrieval done: {} claimed, {} staged, {} failed{}",
            stats.claimed,
            stats.staged,
            stats.failed,
            if stats.space_exhausted { ", scratch space exhausted" } else { "" }
        );
        Ok(stats)
    }

    /// Free space on the scratch file system and the cycle's scratch budget
    fn scratch_has_room(&self) -> Result<bool> {
        let min_free = self.staging.min_free_gb.saturating_mul(GIB);
        match self.space.free_bytes(&self.staging.scratch_dir) {
            Ok(free) if free < min_free => {
                info!(
                    "Scratch has {} GiB free, below the {} GiB floor",
                    free / GIB,
                    self.staging.min_free_gb
                );
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Cannot determine free scratch space: {}", e);
                return Ok(false);
            }
        }

        let mut held = 0;
        for stage_target in self.stage_targets() {
            held += self.store.stage_to_cache(stage_target).sum(
                |job| {
                    job.hpss_status == ArchiveStatus::Staged
                        && job.target_status != DeliveryStatus::Staged
                },
                |job| job.size,
            )?;
        }
        let limit = self.staging.scratch_limit_gb.saturating_mul(GIB);
        if held > limit {
            info!(
                "{} GiB waiting in scratch, above the {} GiB budget",
                held / GIB,
                self.staging.scratch_limit_gb
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn retrieve(&self, job: &StageFromArchiveJob) -> Retrieval {
        let scratch = &self.staging.scratch_dir;
        let mut retrieval = Retrieval::default();

        if !job.is_container {
            match self.archive.extract_file(&job.path, scratch).await {
                Ok(()) => retrieval.delivered.extend(job.wanted.iter().cloned()),
                Err(e) => retrieval.errors.push(e.to_string()),
            }
            return retrieval;
        }

        let whole = job
            .member_count
            .and_then(|members| usize::try_from(members).ok())
            .is_some_and(|members| job.wanted.len() * 4 > members);
        if whole {
            debug!(container = %job.path, "Extracting whole container");
            if let Err(e) = self.archive.extract_container(&job.path, scratch).await {
                retrieval.errors.push(e.to_string());
            }
            for member in &job.wanted {
                if tokio::fs::try_exists(extracted_path(scratch, member)).await.unwrap_or(false) {
                    retrieval.delivered.insert(member.clone());
                }
            }
            self.remove_unwanted(job).await;
        } else {
            for member in &job.wanted {
                match self.archive.extract_member(&job.path, member, scratch).await {
                    Ok(()) => {
                        retrieval.delivered.insert(member.clone());
                    }
                    Err(e) => retrieval.errors.push(format!("{member}: {e}")),
                }
            }
        }
        retrieval
    }

    /// Drop members a whole-container extraction brought along
    async fn remove_unwanted(&self, job: &StageFromArchiveJob) {
        let members = match self.store.archive(job.target).items.find(|item| {
            item.container.as_deref() == Some(job.path.as_str()) && !job.wanted.contains(&item.full_path)
        }) {
            Ok(members) => members,
            Err(e) => {
                warn!(container = %job.path, "Cannot list container members: {}", e);
                return;
            }
        };
        let mut removed = 0;
        for member in members {
            let local = extracted_path(&self.staging.scratch_dir, &member.full_path);
            if tokio::fs::remove_file(&local).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(container = %job.path, "Removed {} unrequested members from scratch", removed);
        }
    }

    /// Record the outcome on the archive job and its cache jobs
    fn finish(&self, job: &StageFromArchiveJob, retrieval: &Retrieval) -> Result<ArchiveStatus> {
        let now = Utc::now();
        let status = if retrieval.delivered.len() == job.wanted.len() {
            ArchiveStatus::Staged
        } else {
            warn!(
                path = %job.path,
                "Retrieved {} of {} files: {}",
                retrieval.delivered.len(),
                job.wanted.len(),
                retrieval.errors.join("; ")
            );
            ArchiveStatus::Failed
        };
        self.store.stage_from_archive().update_one(&job.path, |stored| {
            stored.advance(status, now);
        })?;

        let note = format!(
            "archive retrieval of {} failed: {}",
            job.path,
            retrieval.errors.join("; ")
        );
        self.store.stage_to_cache(job.stage_target).update_many(
            |cache_job| job.wanted.contains(&cache_job.full_path),
            |cache_job| {
                if retrieval.delivered.contains(&cache_job.full_path) {
                    cache_job.hpss_status = ArchiveStatus::Staged;
                } else {
                    cache_job.hpss_status = ArchiveStatus::Failed;
                    cache_job.errors.record(ErrorClass::Retrieval);
                    cache_job.notes.push(note.clone());
                    cache_job.set_target_status(DeliveryStatus::Failed, now);
                }
            },
        )?;
        Ok(status)
    }
}
