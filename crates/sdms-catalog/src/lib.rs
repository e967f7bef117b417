//! SDMS archive catalog
//!
//! The Archive Crawler lists the tape namespace, records every physical
//! object it sees and builds one catalog item per logical payload file,
//! whether standalone or inside a container.

pub mod crawler;
pub mod schema;

pub use crawler::{ArchiveCrawler, CrawlStats};
pub use schema::{ItemBuilder, PathSchema};
