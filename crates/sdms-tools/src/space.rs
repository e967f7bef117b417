//! Free-space queries

use sdms_common::Result;
use std::path::Path;

/// Reports free and total bytes of the file system holding a path
pub trait SpaceProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> Result<u64>;

    fn total_bytes(&self, path: &Path) -> Result<u64>;
}

/// `statvfs(3)` based probe
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    #[allow(clippy::useless_conversion)]
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
        Ok(u64::from(stat.blocks_available()) * u64::from(stat.fragment_size()))
    }

    #[allow(clippy::useless_conversion)]
    fn total_bytes(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
        Ok(u64::from(stat.blocks()) * u64::from(stat.fragment_size()))
    }
}
