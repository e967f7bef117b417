//! Configuration types for SDMS
//!
//! Defaults carry the site constants of the production deployment; every
//! field can be overridden from the config file or environment.

use crate::types::{StageTarget, TargetClass, TargetMap};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for SDMS
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata store
    pub store: StoreConfig,
    /// Tape archive namespace and tools
    pub archive: ArchiveConfig,
    /// Disk cache layout on the data server nodes
    pub cache: CacheConfig,
    /// Staging cycle parameters
    pub staging: StagingConfig,
    /// Node topology and health checking
    pub cluster: ClusterConfig,
}

impl Config {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.archive.root_folders.is_empty() {
            return Err(Error::configuration("archive.root_folders is empty"));
        }
        if self.staging.max_stage_groups == 0 {
            return Err(Error::configuration(
                "staging.max_stage_groups must be at least 1",
            ));
        }
        if self.staging.scratch_dir.as_os_str().is_empty() {
            return Err(Error::configuration("staging.scratch_dir is empty"));
        }
        if self.staging.targets.is_empty() || self.staging.stage_targets.is_empty() {
            return Err(Error::configuration(
                "staging.targets and staging.stage_targets must not be empty",
            ));
        }
        if self.cluster.replica_groups.is_empty() {
            return Err(Error::configuration("cluster.replica_groups is empty"));
        }
        if self.staging.copy.attempt_timeout_secs == 0 {
            return Err(Error::configuration(
                "staging.copy.attempt_timeout_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file
    pub path: PathBuf,
    /// Lifetime of an advisory process lock before it counts as abandoned
    pub lock_ttl_secs: u64,
}

impl StoreConfig {
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/sdms/catalog.redb"),
            lock_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// External program invocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Program name or absolute path
    pub program: String,
    /// Extra arguments placed before the per-call arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Wall-clock bound for one invocation
    pub timeout_secs: u64,
}

impl ToolConfig {
    pub fn new(program: &str, args: &[&str], timeout_secs: u64) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            timeout_secs,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tape archive configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Base folder of the archive namespace
    pub base_folder: String,
    /// Folders under the base folder to crawl
    pub root_folders: Vec<String>,
    /// Only subfolders whose name contains this marker are crawled
    pub subfolder_marker: String,
    /// Marker that starts the logical part of a path (`/Run`)
    pub logical_root_marker: String,
    /// Target class produced by the archive crawler
    pub target: TargetClass,
    /// Number of standalone items buffered before a batch insert
    pub insert_batch_size: usize,
    /// Namespace listing and single-file retrieval tool (hsi)
    pub listing: ToolConfig,
    /// Container tool (htar)
    pub container: ToolConfig,
    /// Batch-queue query used to detect transfers into the archive
    pub transfer_check: Option<ToolConfig>,
    /// Job name that marks an archive transfer in the batch queue
    pub transfer_marker: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_folder: "/nersc/projects/starofl".to_string(),
            root_folders: vec!["picodsts".to_string()],
            subfolder_marker: "Run".to_string(),
            logical_root_marker: "/Run".to_string(),
            target: TargetClass::PicoDst,
            insert_batch_size: 10_000,
            listing: ToolConfig::new("hsi", &["-q"], 3600),
            container: ToolConfig::new("htar", &[], 4 * 3600),
            transfer_check: Some(ToolConfig::new("qstat", &["-u", "starofl"], 60)),
            transfer_marker: "tarToHPSS".to_string(),
        }
    }
}

/// Disk cache layout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Local namespace root on every data server
    pub xrootd_prefix: PathBuf,
    /// Folder of each target class below the namespace root
    pub base_folders: TargetMap<String>,
    /// Data partitions summed up for the node space report
    pub disk_mounts: Vec<PathBuf>,
    /// Target classes crawled on every node
    pub targets: Vec<TargetClass>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            xrootd_prefix: PathBuf::from("/export/data/xrd/ns/star"),
            base_folders: TargetMap {
                pico_dst: "picodsts".to_string(),
                pico_dst_jet: "picodsts/JetPicoDsts".to_string(),
                aschmah: "picodsts/aschmah".to_string(),
            },
            disk_mounts: ["data", "data1", "data2", "data3", "data4"]
                .iter()
                .map(|d| PathBuf::from("/export").join(d))
                .collect(),
            targets: vec![TargetClass::PicoDst],
        }
    }
}

/// Remote copy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Copy tool (xrdcp)
    pub program: String,
    /// Options passed before source and destination
    pub options: Vec<String>,
    /// Wall-clock bound for one attempt
    pub attempt_timeout_secs: u64,
    /// Attempts per job; `None` means ten per known node
    pub max_attempts: Option<u32>,
    /// Linear backoff step between attempts
    pub retry_backoff_secs: u64,
    /// Automatic resets of a job that failed only for lack of space
    pub max_no_space_resets: u32,
}

impl CopyConfig {
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    #[must_use]
    pub const fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.retry_backoff_secs.saturating_mul(attempt as u64))
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            program: "xrdcp".to_string(),
            options: ["-v", "-np", "-S", "4"].iter().map(ToString::to_string).collect(),
            attempt_timeout_secs: 1800,
            max_attempts: None,
            retry_backoff_secs: 5,
            max_no_space_resets: 5,
        }
    }
}

/// Staging cycle configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Scratch area files are retrieved into
    pub scratch_dir: PathBuf,
    /// Upper bound of bytes held in scratch by the cycle, in GiB
    pub scratch_limit_gb: u64,
    /// Minimum free space on the scratch file system, in GiB
    pub min_free_gb: u64,
    /// Tape-locality sorter
    pub tape_sorter: ToolConfig,
    /// Name of the path list handed to the sorter
    pub order_file_name: String,
    /// Cap on parallel archive-retrieval groups
    pub max_stage_groups: u32,
    /// A job in `staging` longer than this is rolled back
    pub staging_timeout_secs: u64,
    /// Namespace of the cache tier on the remote side of the copy
    pub remote_namespace: String,
    /// Target classes considered by the stager
    pub targets: Vec<TargetClass>,
    /// Stage targets considered by the stager
    pub stage_targets: Vec<StageTarget>,
    /// Query items accepted in staging requests
    pub query_items: Vec<String>,
    /// Staging request document
    pub request_file: PathBuf,
    /// Remote copy parameters
    pub copy: CopyConfig,
    /// Process name swept at the end of a cycle
    pub copy_process_name: String,
}

impl StagingConfig {
    #[must_use]
    pub const fn staging_timeout(&self) -> Duration {
        Duration::from_secs(self.staging_timeout_secs)
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("/global/projecta/projectdirs/starprod/stageArea"),
            scratch_limit_gb: 10 * 1024,
            min_free_gb: 1024,
            tape_sorter: ToolConfig::new("/usr/common/usg/bin/hpss_file_sorter.script", &[], 1800),
            order_file_name: "orderMe.txt".to_string(),
            max_stage_groups: 4,
            staging_timeout_secs: 12 * 3600,
            remote_namespace: "/star".to_string(),
            targets: vec![TargetClass::PicoDst, TargetClass::PicoDstJet],
            stage_targets: vec![StageTarget::Xrd],
            query_items: [
                "runyear",
                "system",
                "energy",
                "trigger",
                "production",
                "day",
                "runnumber",
                "stream",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            request_file: PathBuf::from("stagingRequest.json"),
            copy: CopyConfig::default(),
            copy_process_name: "xrdcp".to_string(),
        }
    }
}

/// A group of cache nodes reachable through one manager host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupConfig {
    /// Name recorded in the fan-out list of Stage-To-Cache Jobs
    pub name: String,
    /// Role of the node that manages the group
    pub manager_role: String,
    /// Role of the data servers belonging to the group
    pub data_server_role: Option<String>,
    /// Manager host used when no node carries the manager role
    pub fallback_manager: Option<String>,
    /// Appended to the manager's node name to form the copy host
    pub host_suffix: String,
}

/// Cluster topology and health checking
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Nodes expected to serve cache data
    pub data_servers: Vec<String>,
    /// Role name -> member nodes
    pub roles: BTreeMap<String, Vec<String>>,
    /// Port probed by the health check
    pub admin_port: u16,
    /// Connect timeout of the health check
    pub connect_timeout_secs: u64,
    /// Group covering the whole cache (single-copy staging)
    pub all_group: NodeGroupConfig,
    /// Groups receiving one copy each (multi-copy staging)
    pub replica_groups: Vec<NodeGroupConfig>,
}

impl ClusterConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Look up a group by name
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&NodeGroupConfig> {
        std::iter::once(&self.all_group)
            .chain(&self.replica_groups)
            .find(|g| g.name == name)
    }

    /// Roles configured for `node`
    #[must_use]
    pub fn roles_of(&self, node: &str) -> Vec<String> {
        self.roles
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == node))
            .map(|(role, _)| role.clone())
            .collect()
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            data_servers: Vec::new(),
            roles: BTreeMap::new(),
            admin_port: 22,
            connect_timeout_secs: 5,
            all_group: NodeGroupConfig {
                name: "MENDEL_ALL".to_string(),
                manager_role: "META_MANAGER".to_string(),
                data_server_role: None,
                fallback_manager: Some("pstarxrdr1".to_string()),
                host_suffix: ".nersc.gov".to_string(),
            },
            replica_groups: vec![
                NodeGroupConfig {
                    name: "MENDEL_1".to_string(),
                    manager_role: "MENDEL_ONE_MANAGER".to_string(),
                    data_server_role: Some("MENDEL_ONE_DATASERVER".to_string()),
                    fallback_manager: None,
                    host_suffix: "-ib.nersc.gov".to_string(),
                },
                NodeGroupConfig {
                    name: "MENDEL_2".to_string(),
                    manager_role: "MENDEL_TWO_MANAGER".to_string(),
                    data_server_role: Some("MENDEL_TWO_DATASERVER".to_string()),
                    fallback_manager: None,
                    host_suffix: "-ib.nersc.gov".to_string(),
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.archive.root_folders, vec!["picodsts"]);
        assert_eq!(config.staging.copy.program, "xrdcp");
        assert_eq!(
            config.cache.base_folders.get(TargetClass::PicoDstJet),
            "picodsts/JetPicoDsts"
        );
    }

    #[test]
    fn test_validate_rejects_zero_groups() {
        let mut config = Config::default();
        config.staging.max_stage_groups = 0;
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_roles_and_groups() {
        let mut config = ClusterConfig::default();
        config
            .roles
            .insert("META_MANAGER".into(), vec!["pstarxrdr1".into()]);
        config
            .roles
            .insert("MENDEL_ONE_DATASERVER".into(), vec!["mc01".into(), "mc02".into()]);

        assert_eq!(config.roles_of("mc02"), vec!["MENDEL_ONE_DATASERVER"]);
        assert!(config.roles_of("mc99").is_empty());
        assert_eq!(config.group("MENDEL_2").unwrap().manager_role, "MENDEL_TWO_MANAGER");
        assert!(config.group("MENDEL_3").is_none());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{"staging": {"max_stage_groups": 2}}"#).unwrap();
        assert_eq!(config.staging.max_stage_groups, 2);
        assert_eq!(config.staging.min_free_gb, 1024);
    }
}
