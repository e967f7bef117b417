//! Collection (redb table) names.
//!
//! Per-target collections are derived from the target's collection base
//! name, e.g. `HPSS_PicoDsts`, `XRD_PicoDsts_missing`, `Stage_To_XRD`.

use sdms_common::{StageTarget, TargetClass};

// Archive
pub const ARCHIVE_FILES: &str = "HPSS_Files";

// Staging
pub const STAGE_FROM_ARCHIVE: &str = "Stage_From_HPSS";

// Cluster
pub const DATA_SERVERS: &str = "XRD_DataServers";
pub const PROCESS_LOCKS: &str = "Process_Locks";

pub fn archive_items(target: TargetClass) -> String {
    format!("HPSS_{}", target.collection_base())
}

pub fn archive_duplicates(target: TargetClass) -> String {
    format!("HPSS_{}_duplicates", target.collection_base())
}

pub fn cache_entries(target: TargetClass) -> String {
    format!("XRD_{}", target.collection_base())
}

/// Side collection of the cache tier: `new`, `missing`, `brokenLink`,
/// `corrupt`, `noHpss`
pub fn cache_side(target: TargetClass, suffix: &str) -> String {
    format!("XRD_{}_{suffix}", target.collection_base())
}

pub fn stage_to_cache(stage_target: StageTarget) -> String {
    format!("Stage_To_{}", stage_target.as_str())
}
