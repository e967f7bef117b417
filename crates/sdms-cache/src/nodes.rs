//! Node Health Monitor

use async_trait::async_trait;
use chrono::Utc;
use sdms_common::config::ClusterConfig;
use sdms_common::{NodeName, Result};
use sdms_meta_store::{DataServer, MetaStore, UpsertOutcome};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Reachability check of a single node
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn is_reachable(&self, node: &NodeName) -> bool;
}

/// TCP connect to the node's administrative port
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub const fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }

    pub const fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.admin_port, config.connect_timeout())
    }
}

#[async_trait]
impl NodeProbe for TcpProbe {
    async fn is_reachable(&self, node: &NodeName) -> bool {
        let addr = format!("{}:{}", node.as_str(), self.port);
        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Node {} unreachable: {}", node, e);
                false
            }
            Err(_) => {
                debug!("Connecting to {} timed out", addr);
                false
            }
        }
    }
}

/// State transitions seen by one refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeChanges {
    /// Nodes without a record before this refresh
    pub new: Vec<NodeName>,
    pub now_active: Vec<NodeName>,
    pub now_inactive: Vec<NodeName>,
    /// Every node found unreachable
    pub inactive: Vec<NodeName>,
}

pub struct NodeMonitor<P> {
    store: MetaStore,
    cluster: ClusterConfig,
    probe: P,
}

impl<P: NodeProbe> NodeMonitor<P> {
    pub const fn new(store: MetaStore, cluster: ClusterConfig, probe: P) -> Self {
        Self {
            store,
            cluster,
            probe,
        }
    }

    /// Probe `nodes` plus every configured and previously recorded node
    pub async fn refresh(&self, nodes: &[NodeName]) -> Result<NodeChanges> {
        let mut all: BTreeSet<NodeName> = nodes.iter().cloned().collect();
        all.extend(self.cluster.data_servers.iter().map(|n| NodeName::from(n.as_str())));
        all.extend(
            self.cluster
                .roles
                .values()
                .flatten()
                .map(|n| NodeName::from(n.as_str())),
        );
        all.extend(self.store.data_servers().all()?.into_iter().map(|s| s.node));

        let mut changes = NodeChanges::default();
        for node in all {
            let reachable = self.probe.is_reachable(&node).await;
            let roles = self.cluster.roles_of(node.as_str());
            let is_data_server = self.cluster.data_servers.iter().any(|n| n == node.as_str());

            let now = Utc::now();
            let mut was_active = false;
            let (outcome, _) = self.store.data_servers().upsert(
                node.as_str(),
                || DataServer::new(node.clone(), now),
                |server| {
                    was_active = server.state_active;
                    server.state_active = reachable;
                    server.roles = roles;
                    server.is_data_server = is_data_server;
                    if reachable {
                        server.last_seen = Some(now);
                    } else if was_active {
                        server.set_inactive = Some(now);
                    }
                },
            )?;

            if outcome == UpsertOutcome::Inserted {
                changes.new.push(node.clone());
            }
            match (was_active, reachable) {
                (false, true) => changes.now_active.push(node.clone()),
                (true, false) => {
                    warn!(node = %node, "Node became unreachable");
                    changes.now_inactive.push(node.clone());
                }
                _ => {}
            }
            if !reachable {
                changes.inactive.push(node);
            }
        }

        if !changes.inactive.is_empty() {
            let names: Vec<&str> = changes.inactive.iter().map(NodeName::as_str).collect();
            warn!("Inactive nodes: {}", names.join(", "));
        }
        info!(
            "Node check done: {} new, {} became active, {} became inactive",
            changes.new.len(),
            changes.now_active.len(),
            changes.now_inactive.len()
        );
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet};
    use tokio::net::TcpListener;

    struct FakeProbe {
        up: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl NodeProbe for FakeProbe {
        async fn is_reachable(&self, node: &NodeName) -> bool {
            self.up.lock().contains(node.as_str())
        }
    }

    fn cluster() -> ClusterConfig {
        ClusterConfig {
            data_servers: vec!["mc0101".to_string(), "mc0102".to_string()],
            roles: BTreeMap::from([
                ("META_MANAGER".to_string(), vec!["mc0100".to_string()]),
                ("MENDEL_ONE_DATASERVER".to_string(), vec!["mc0101".to_string()]),
            ]),
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_tracks_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("catalog.redb")).unwrap();
        let probe = FakeProbe {
            up: Mutex::new(["mc0100", "mc0101", "mc0102"].iter().map(ToString::to_string).collect()),
        };
        let monitor = NodeMonitor::new(store.clone(), cluster(), probe);

        let changes = monitor.refresh(&[]).await.unwrap();
        assert_eq!(changes.new.len(), 3);
        assert_eq!(changes.now_active.len(), 3);
        assert!(changes.inactive.is_empty());

        let server = store.data_servers().get("mc0101").unwrap().unwrap();
        assert!(server.state_active);
        assert!(server.is_data_server);
        assert!(server.has_role("MENDEL_ONE_DATASERVER"));
        let manager = store.data_servers().get("mc0100").unwrap().unwrap();
        assert!(!manager.is_data_server);

        monitor.probe.up.lock().remove("mc0102");
        let changes = monitor.refresh(&[NodeName::from("mc0200")]).await.unwrap();
        assert_eq!(changes.new, vec![NodeName::from("mc0200")]);
        assert_eq!(changes.now_inactive, vec![NodeName::from("mc0102")]);
        assert!(changes.now_active.is_empty());
        assert_eq!(changes.inactive.len(), 2);

        let down = store.data_servers().get("mc0102").unwrap().unwrap();
        assert!(!down.state_active);
        assert!(down.set_inactive.is_some());
        assert!(down.last_seen.is_some());
        assert_eq!(store.data_servers().count().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(port, Duration::from_secs(2));
        assert!(probe.is_reachable(&NodeName::from("127.0.0.1")).await);

        drop(listener);
        assert!(!probe.is_reachable(&NodeName::from("127.0.0.1")).await);
    }
}
