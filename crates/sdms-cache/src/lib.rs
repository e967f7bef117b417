//! SDMS disk cache tier
//!
//! - [`crawler`]: per-node scan producing new, missing and broken-link
//!   observations
//! - [`processor`]: folds observations into the canonical Cache Entries
//! - [`nodes`]: reachability and role tracking of cache nodes
//! - [`cleanup`]: removal of dangling namespace links

pub mod cleanup;
pub mod crawler;
pub mod nodes;
pub mod processor;

pub use cleanup::{PurgeStats, purge_broken_links};
pub use crawler::{CacheCrawler, ScanStats};
pub use nodes::{NodeChanges, NodeMonitor, NodeProbe, TcpProbe};
pub use processor::{MissingFileStats, NewFileStats, ReconciliationProcessor, process_lock_name};
