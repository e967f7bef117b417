//! SDMS staging orchestrator
//!
//! A staging cycle moves requested files from the tape archive into the
//! disk cache in five phases:
//!
//! 1. [`Stager::prepare_staging`] marks the catalog items matched by the
//!    operator request and creates one archive job per archive file and
//!    one cache job per requested item
//! 2. [`Stager::order_jobs`] orders archive jobs by tape locality and
//!    splits them into stage groups
//! 3. [`Stager::stage_from_archive`] retrieves one stage group into scratch
//! 4. [`Stager::stage_to_cache`] copies retrieved files to the cache nodes
//! 5. [`Stager::check_end_of_cycle`] purges finished jobs, triages failures
//!    and releases the cycle once nothing is left to do

pub mod cycle;
pub mod deliver;
pub mod ordering;
pub mod prepare;
pub mod request;
pub mod retrieve;
pub mod stager;

#[cfg(test)]
pub(crate) mod testing;

pub use cycle::{CycleState, Pending, TeardownReport, TeardownStats};
pub use deliver::DeliveryStats;
pub use ordering::{OrderStats, split_into_groups};
pub use prepare::{JobStats, MarkCount, PrepareReport};
pub use request::{RequestRules, StageSet, StagingRequest};
pub use retrieve::RetrieveStats;
pub use stager::{CYCLE_LOCK, Stager, StagerTools, group_lock_name};
