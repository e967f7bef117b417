//! Staging orchestrator state shared by every cycle phase

use sdms_common::config::{CacheConfig, ClusterConfig, StagingConfig};
use sdms_common::{Result, StageTarget};
use sdms_meta_store::MetaStore;
use std::time::Duration;
use tracing::debug;

/// Lock held from preparation until the cycle is torn down
pub const CYCLE_LOCK: &str = "staging_cycle_active";

/// Prefix of the per-group archive retrieval locks
pub const GROUP_LOCK_PREFIX: &str = "stage_group_";

pub const GIB: u64 = 1 << 30;

pub fn group_lock_name(group: u32) -> String {
    format!("{GROUP_LOCK_PREFIX}{group}")
}

/// Runs the staging cycle phases against one metadata store.
///
/// Every phase is a separate entry point, normally invoked by a separate
/// process: [`Stager::prepare_staging`], [`Stager::order_jobs`],
/// [`Stager::stage_from_archive`], [`Stager::stage_to_cache`] and
/// [`Stager::check_end_of_cycle`]. All coordination goes through the store.
pub struct Stager<A, S, C, P> {
    pub(crate) store: MetaStore,
    pub(crate) staging: StagingConfig,
    pub(crate) cache: CacheConfig,
    pub(crate) cluster: ClusterConfig,
    pub(crate) lock_ttl: Duration,
    pub(crate) archive: A,
    pub(crate) sorter: S,
    pub(crate) copy: C,
    pub(crate) space: P,
}

/// External collaborators of a [`Stager`]
pub struct StagerTools<A, S, C, P> {
    pub archive: A,
    pub sorter: S,
    pub copy: C,
    pub space: P,
}

impl<A, S, C, P> Stager<A, S, C, P> {
    pub fn new(
        store: MetaStore,
        config: &sdms_common::Config,
        tools: StagerTools<A, S, C, P>,
    ) -> Self {
        Self {
            store,
            staging: config.staging.clone(),
            cache: config.cache.clone(),
            cluster: config.cluster.clone(),
            lock_ttl: config.store.lock_ttl(),
            archive: tools.archive,
            sorter: tools.sorter,
            copy: tools.copy,
            space: tools.space,
        }
    }

    pub const fn store(&self) -> &MetaStore {
        &self.store
    }

    /// Push the cycle lock's expiry forward while a phase makes progress
    pub(crate) fn keep_cycle_alive(&self) -> Result<()> {
        if !self.store.locks().extend(CYCLE_LOCK, self.lock_ttl)? {
            debug!("No staging cycle lock to extend");
        }
        Ok(())
    }

    pub(crate) fn stage_targets(&self) -> impl Iterator<Item = StageTarget> + '_ {
        self.staging.stage_targets.iter().copied()
    }
}
