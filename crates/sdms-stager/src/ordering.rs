//! Tape-locality ordering and stage-group partitioning

use crate::stager::Stager;
use sdms_common::{ArchiveStatus, Result};
use sdms_meta_store::{Change, StageFromArchiveJob};
use sdms_tools::TapeSorter;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderStats {
    pub jobs: usize,
    /// Jobs that received an order index from the sorter
    pub ordered: usize,
    pub groups: usize,
}

impl<A, S: TapeSorter, C, P> Stager<A, S, C, P> {
    /// Order every unstaged archive job by tape locality and assign it to a
    /// stage group.
    ///
    /// A failing sorter leaves every job unordered; unordered jobs sort last
    /// and are still grouped.
    pub async fn order_jobs(&self) -> Result<OrderStats> {
        self.keep_cycle_alive()?;
        let jobs = self
            .store
            .stage_from_archive()
            .find(|job| job.status == ArchiveStatus::Unstaged)?;
        if jobs.is_empty() {
            info!("No unstaged archive jobs to order");
            return Ok(OrderStats::default());
        }

        tokio::fs::create_dir_all(&self.staging.scratch_dir).await?;
        let list_file = self.staging.scratch_dir.join(&self.staging.order_file_name);
        let listing: String = jobs.iter().map(|job| format!("{}\n", job.path)).collect();
        tokio::fs::write(&list_file, listing).await?;

        let sorted = match self.sorter.sort(&list_file).await {
            Ok(sorted) => sorted,
            Err(e) => {
                warn!("Tape ordering failed, staging in catalog order: {}", e);
                Vec::new()
            }
        };
        if let Err(e) = tokio::fs::remove_file(&list_file).await {
            debug!("Could not remove {}: {}", list_file.display(), e);
        }

        let mut ordered = 0;
        for (idx, path) in (0u64..).zip(&sorted) {
            let assigned = self.store.stage_from_archive().modify(path, |current| match current {
                Some(mut job) if job.status == ArchiveStatus::Unstaged => {
                    job.order_idx = Some(idx);
                    (Change::Put(job), true)
                }
                _ => (Change::Keep, false),
            })?;
            if assigned {
                ordered += 1;
            }
        }

        let mut jobs = self
            .store
            .stage_from_archive()
            .find(|job| job.status == ArchiveStatus::Unstaged)?;
        jobs.sort_by_key(StageFromArchiveJob::order_key);
        let groups = split_into_groups(jobs.len(), self.staging.max_stage_groups);
        for (job, group) in jobs.iter().zip(&groups) {
            self.store
                .stage_from_archive()
                .update_one(&job.path, |job| job.group = Some(*group))?;
        }

        let stats = OrderStats {
            jobs: jobs.len(),
            ordered,
            groups: groups.last().map_or(0, |last| *last as usize + 1),
        };
        info!(
            "Ordered {} of {} archive jobs into {} stage groups",
            stats.ordered, stats.jobs, stats.groups
        );
        Ok(stats)
    }
}

/// Group index of each of `len` ordered jobs: at most `cap` contiguous
/// groups whose sizes differ by at most one
pub fn split_into_groups(len: usize, cap: u32) -> Vec<u32> {
    if len == 0 {
        return Vec::new();
    }
    let groups = (cap.max(1) as usize).min(len);
    (0..len)
        .map(|i| u32::try_from(i * groups / len).unwrap_or(u32::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, archive_job};

    #[test]
    fn test_split_into_groups() {
        assert!(split_into_groups(0, 4).is_empty());
        assert_eq!(split_into_groups(3, 4), vec![0, 1, 2]);
        assert_eq!(split_into_groups(5, 1), vec![0; 5]);
        assert_eq!(split_into_groups(10, 4), vec![0, 0, 0, 1, 1, 2, 2, 2, 3, 3]);
        assert_eq!(split_into_groups(2, 0), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_order_follows_sorter() {
        let h = Harness::new();
        let jobs = h.stager.store().stage_from_archive();
        for path in ["/a", "/b", "/c", "/d", "/e"] {
            jobs.insert(&archive_job(path, ArchiveStatus::Unstaged)).unwrap();
        }
        jobs.insert(&archive_job("/done", ArchiveStatus::Staged)).unwrap();
        // "/e" is unknown to the sorter, "/done" is not unstaged
        *h.sorter_output.lock() = Some(vec![
            "/c".to_string(),
            "/done".to_string(),
            "/a".to_string(),
            "/d".to_string(),
            "/b".to_string(),
        ]);

        let stats = h.stager.order_jobs().await.unwrap();
        assert_eq!(stats.jobs, 5);
        assert_eq!(stats.ordered, 4);
        assert_eq!(stats.groups, 4);

        let get = |p: &str| jobs.get(p).unwrap().unwrap();
        assert_eq!(get("/c").order_idx, Some(0));
        assert_eq!(get("/a").order_idx, Some(2));
        assert_eq!(get("/e").order_idx, None);
        assert_eq!(get("/done").order_idx, None);
        assert_eq!(get("/done").group, None);

        assert_eq!(get("/c").group, Some(0));
        assert_eq!(get("/a").group, Some(0));
        assert_eq!(get("/d").group, Some(1));
        assert_eq!(get("/b").group, Some(2));
        assert_eq!(get("/e").group, Some(3));

        let list_file = h.config.staging.scratch_dir.join(&h.config.staging.order_file_name);
        assert!(!list_file.exists());
    }

    #[tokio::test]
    async fn test_failed_sorter_keeps_catalog_order() {
        let h = Harness::new();
        let jobs = h.stager.store().stage_from_archive();
        for path in ["/b", "/a"] {
            jobs.insert(&archive_job(path, ArchiveStatus::Unstaged)).unwrap();
        }
        *h.sorter_fails.lock() = true;

        let stats = h.stager.order_jobs().await.unwrap();
        assert_eq!(stats.ordered, 0);
        assert_eq!(stats.groups, 2);
        assert_eq!(jobs.get("/a").unwrap().unwrap().group, Some(0));
        assert_eq!(jobs.get("/b").unwrap().unwrap().group, Some(1));
    }
}
