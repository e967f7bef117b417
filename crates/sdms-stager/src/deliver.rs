//! Delivery of retrieved files to the cache tier

use crate::stager::Stager;
use chrono::Utc;
use sdms_common::config::NodeGroupConfig;
use sdms_common::{DeliveryStatus, ErrorClass, Result, StageTarget};
use sdms_meta_store::StageToCacheJob;
use sdms_tools::{CopyOutcome, CopyTool, extracted_path};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Longest error excerpt kept in a job note
const NOTE_LIMIT: usize = 300;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub claimed: usize,
    pub staged: usize,
    pub failed: usize,
    pub attempts: u32,
}

impl<A, S, C: CopyTool, P> Stager<A, S, C, P> {
    /// Copy every retrieved file of `stage_target` to its node groups
    pub async fn stage_to_cache(&self, stage_target: StageTarget) -> Result<DeliveryStats> {
        let jobs = self.store.stage_to_cache(stage_target);
        let max_attempts = self.max_attempts()?;
        let hosts = self.group_hosts()?;

        let mut stats = DeliveryStats::default();
        loop {
            self.keep_cycle_alive()?;
            let now = Utc::now();
            let claimed = jobs.claim_first(
                StageToCacheJob::ready_for_delivery,
                |job| job.path.clone(),
                |job| job.set_target_status(DeliveryStatus::Staging, now),
            )?;
            let Some(mut job) = claimed else {
                break;
            };
            stats.claimed += 1;

            let delivered = self.deliver(&mut job, &hosts, max_attempts, &mut stats).await;
            let now = Utc::now();
            if delivered {
                let local = extracted_path(&self.staging.scratch_dir, &job.full_path);
                if let Err(e) = tokio::fs::remove_file(&local).await {
                    debug!("Could not remove {}: {}", local.display(), e);
                }
                job.set_target_status(DeliveryStatus::Staged, now);
                stats.staged += 1;
            } else {
                job.set_target_status(DeliveryStatus::Failed, now);
                stats.failed += 1;
            }
            jobs.put(&job)?;
            if delivered {
                self.flag_new_files()?;
            }
        }

        info!(
            stage_target = %stage_target,
            "Delivery done: {} claimed, {} staged, {} failed, {} copy attempts",
            stats.claimed,
            stats.staged,
            stats.failed,
            stats.attempts
        );
        Ok(stats)
    }

    /// Attempts per group copy; ten per known node unless configured
    fn max_attempts(&self) -> Result<u32> {
        if let Some(max) = self.staging.copy.max_attempts {
            return Ok(max.max(1));
        }
        let nodes = self.store.data_servers().count()?;
        Ok(u32::try_from(nodes.saturating_mul(10)).unwrap_or(u32::MAX).max(1))
    }

    /// Copy host of every configured group, `None` when no manager is known
    fn group_hosts(&self) -> Result<BTreeMap<String, Option<String>>> {
        let servers = self.store.data_servers().all()?;
        let resolve = |group: &NodeGroupConfig| {
            servers
                .iter()
                .find(|server| server.has_role(&group.manager_role))
                .map(|server| server.node.as_str().to_string())
                .or_else(|| group.fallback_manager.clone())
                .map(|manager| format!("{manager}{}", group.host_suffix))
        };
        Ok(std::iter::once(&self.cluster.all_group)
            .chain(&self.cluster.replica_groups)
            .map(|group| (group.name.clone(), resolve(group)))
            .collect())
    }

    fn destination(&self, host: &str, job: &StageToCacheJob) -> String {
        format!(
            "root://{host}/{}/{}/{}",
            self.staging.remote_namespace.trim_end_matches('/'),
            self.cache.base_folders.get(job.target).trim_matches('/'),
            job.path.trim_start_matches('/')
        )
    }

    async fn deliver(
        &self,
        job: &mut StageToCacheJob,
        hosts: &BTreeMap<String, Option<String>>,
        max_attempts: u32,
        stats: &mut DeliveryStats,
    ) -> bool {
        let source = extracted_path(&self.staging.scratch_dir, &job.full_path);
        let mut all_delivered = true;
        for group in job.target_groups.clone() {
            let Some(Some(host)) = hosts.get(&group) else {
                warn!(path = %job.path, group = %group, "No copy host for node group");
                job.errors.record(ErrorClass::Unknown);
                job.notes.push(format!("no copy host for node group {group}"));
                all_delivered = false;
                continue;
            };
            let destination = self.destination(host, job);
            if !self.copy_with_retries(job, &source, &destination, max_attempts, stats).await {
                all_delivered = false;
            }
        }
        all_delivered
    }

    async fn copy_with_retries(
        &self,
        job: &mut StageToCacheJob,
        source: &std::path::Path,
        destination: &str,
        max_attempts: u32,
        stats: &mut DeliveryStats,
    ) -> bool {
        for attempt in 1..=max_attempts {
            job.trials += 1;
            stats.attempts += 1;
            match self.copy.copy(source, destination).await {
                CopyOutcome::Copied => return true,
                CopyOutcome::Failed {
                    class: ErrorClass::AlreadyExists,
                    ..
                } => {
                    job.errors.record(ErrorClass::AlreadyExists);
                    debug!(destination, "Already present in the cache");
                    return true;
                }
                CopyOutcome::Failed { class, message } => {
                    warn!(
                        destination,
                        attempt,
                        class = %class,
                        "Copy failed: {}",
                        message.lines().next().unwrap_or_default()
                    );
                    job.errors.record(class);
                    job.notes.push(note(attempt, class, &message));
                    if attempt < max_attempts {
                        tokio::time::sleep(self.staging.copy.backoff(attempt)).await;
                    }
                }
            }
        }
        false
    }

    /// Prompt the next crawl on every active cache node
    fn flag_new_files(&self) -> Result<()> {
        self.store.data_servers().update_many(
            |server| server.state_active && server.is_data_server && !server.new_files_staged,
            |server| server.new_files_staged = true,
        )?;
        Ok(())
    }
}

fn note(attempt: u32, class: ErrorClass, message: &str) -> String {
    let excerpt: String = message.chars().take(NOTE_LIMIT).collect();
    format!("attempt {attempt}: {class}: {}", excerpt.trim())
}
