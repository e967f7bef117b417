//! Removal of dangling namespace links reported by cache crawls

use sdms_common::{NodeName, Result, TargetClass};
use sdms_meta_store::{CacheObservation, MetaStore, Record};
use sdms_tools::RemoteShell;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub nodes: usize,
    pub removed: usize,
    pub failed_nodes: usize,
}

/// Remove every archived broken link of `target` from its node, one remote
/// invocation per node. Records are dropped only after a successful removal.
pub async fn purge_broken_links<S: RemoteShell>(
    store: &MetaStore,
    shell: &S,
    target: TargetClass,
) -> Result<PurgeStats> {
    let archive = &store.cache(target).broken_link_archive;
    let mut by_node: BTreeMap<NodeName, Vec<CacheObservation>> = BTreeMap::new();
    for link in archive.all()? {
        by_node.entry(link.node.clone()).or_default().push(link);
    }

    let mut stats = PurgeStats {
        nodes: by_node.len(),
        ..PurgeStats::default()
    };
    for (node, links) in by_node {
        let paths: Vec<String> = links.iter().map(|l| l.full_path.clone()).collect();
        if let Err(e) = shell.remove_files(&node, &paths).await {
            warn!(node = %node, "Failed to remove {} broken links: {}", paths.len(), e);
            stats.failed_nodes += 1;
            continue;
        }
        for link in &links {
            archive.delete(&link.key())?;
        }
        stats.removed += links.len();
    }

    info!(
        target = %target,
        "Removed {} broken links on {} nodes ({} failed)",
        stats.removed,
        stats.nodes,
        stats.failed_nodes
    );
    Ok(stats)
}
