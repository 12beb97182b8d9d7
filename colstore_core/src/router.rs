//! Replica selection over the configured cluster topology
//!
//! Every node is a symmetric replica, so data operations go to a node chosen
//! uniformly at random. Repair triggers always go to the coordinator at
//! index 0 so that one trigger never fans out into several concurrent
//! anti-entropy passes.

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::TopologyError;
use crate::protocol::OperationKind;

/// A `host:port` address of one cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeEndpoint(String);

impl NodeEndpoint {
    /// Parse `host:port`, tolerating a leading `http://` and trailing slash
    pub fn parse(raw: &str) -> Result<Self, TopologyError> {
        let trimmed = raw.trim();
        let address = trimmed
            .strip_prefix("http://")
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::InvalidEndpoint(raw.to_string()))?;
        if host.is_empty() || port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
            return Err(TopologyError::InvalidEndpoint(raw.to_string()));
        }

        Ok(Self(address.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full URL for a protocol path on this node
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.0, path)
    }
}

impl std::fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, non-empty, duplicate-free list of nodes. Index 0 coordinates repairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    nodes: Vec<NodeEndpoint>,
}

impl ClusterTopology {
    pub fn new(nodes: Vec<NodeEndpoint>) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].contains(node) {
                return Err(TopologyError::DuplicateNode(node.to_string()));
            }
        }
        Ok(Self { nodes })
    }

    /// Build from raw `host:port` strings
    pub fn parse<S: AsRef<str>>(nodes: &[S]) -> Result<Self, TopologyError> {
        let endpoints = nodes
            .iter()
            .map(|n| NodeEndpoint::parse(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(endpoints)
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn coordinator(&self) -> &NodeEndpoint {
        &self.nodes[0]
    }

    /// Pick the target for one operation using the supplied RNG
    pub fn select_with<R: Rng + ?Sized>(&self, kind: OperationKind, rng: &mut R) -> &NodeEndpoint {
        if kind.is_repair() {
            return self.coordinator();
        }
        self.nodes.choose(rng).unwrap_or_else(|| self.coordinator())
    }
}

/// Shared, runtime-reconfigurable router.
///
/// The topology is held as an immutable snapshot and replaced wholesale, so
/// a concurrent selection sees either the old list or the new one.
#[derive(Debug, Clone)]
pub struct ReplicaRouter {
    topology: Arc<RwLock<Arc<ClusterTopology>>>,
}

impl ReplicaRouter {
    pub fn new(topology: ClusterTopology) -> Self {
        Self {
            topology: Arc::new(RwLock::new(Arc::new(topology))),
        }
    }

    /// Choose the node that receives an operation of `kind`
    pub async fn select(&self, kind: OperationKind) -> NodeEndpoint {
        let snapshot = self.snapshot().await;
        let mut rng = rand::thread_rng();
        snapshot.select_with(kind, &mut rng).clone()
    }

    /// Current topology
    pub async fn snapshot(&self) -> Arc<ClusterTopology> {
        self.topology.read().await.clone()
    }

    /// Swap in a whole new topology
    pub async fn replace(&self, topology: ClusterTopology) {
        let mut guard = self.topology.write().await;
        *guard = Arc::new(topology);
        tracing::info!(nodes = guard.len(), "Cluster topology replaced");
    }

    /// Append a node; it never becomes the coordinator unless the list was rebuilt
    pub async fn add_node(&self, node: NodeEndpoint) -> Result<(), TopologyError> {
        let mut guard = self.topology.write().await;
        let mut nodes = guard.nodes().to_vec();
        nodes.push(node.clone());
        *guard = Arc::new(ClusterTopology::new(nodes)?);
        tracing::info!(node = %node, nodes = guard.len(), "Node added to topology");
        Ok(())
    }

    /// Remove a node; the last node cannot be removed
    pub async fn remove_node(&self, node: &NodeEndpoint) -> Result<(), TopologyError> {
        let mut guard = self.topology.write().await;
        if !guard.nodes().contains(node) {
            return Err(TopologyError::UnknownNode(node.to_string()));
        }
        let nodes: Vec<NodeEndpoint> = guard.nodes().iter().filter(|n| *n != node).cloned().collect();
        *guard = Arc::new(ClusterTopology::new(nodes)?);
        tracing::info!(node = %node, nodes = guard.len(), "Node removed from topology");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn four_nodes() -> ClusterTopology {
        ClusterTopology::parse(&[
            "127.0.0.1:8000",
            "127.0.0.1:8001",
            "127.0.0.1:8002",
            "127.0.0.1:8003",
        ])
        .unwrap()
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(NodeEndpoint::parse("127.0.0.1:8000").unwrap().as_str(), "127.0.0.1:8000");
        assert_eq!(NodeEndpoint::parse("http://node-a:9000/").unwrap().as_str(), "node-a:9000");
        assert_eq!(
            NodeEndpoint::parse("node-a:9000").unwrap().url("/read"),
            "http://node-a:9000/read"
        );
        assert!(NodeEndpoint::parse("localhost").is_err());
        assert!(NodeEndpoint::parse(":8000").is_err());
        assert!(NodeEndpoint::parse("host:0").is_err());
        assert!(NodeEndpoint::parse("host:http").is_err());
    }

    #[test]
    fn test_topology_invariants() {
        let empty: [&str; 0] = [];
        assert_eq!(ClusterTopology::parse(&empty), Err(TopologyError::Empty));
        assert!(matches!(
            ClusterTopology::parse(&["a:1", "a:1"]),
            Err(TopologyError::DuplicateNode(_))
        ));
        assert_eq!(four_nodes().coordinator().as_str(), "127.0.0.1:8000");
    }

    #[test]
    fn test_uniform_selection() {
        let topology = four_nodes();
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<NodeEndpoint, usize> = HashMap::new();

        let rounds = 10_000;
        for _ in 0..rounds {
            let node = topology.select_with(OperationKind::Read, &mut rng);
            *counts.entry(node.clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        for node in topology.nodes() {
            let share = counts[node] as f64 / rounds as f64;
            assert!((share - 0.25).abs() < 0.03, "node {} got share {}", node, share);
        }
    }

    #[test]
    fn test_repairs_pinned_to_coordinator() {
        let topology = four_nodes();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1_000 {
            assert_eq!(topology.select_with(OperationKind::Repair, &mut rng), topology.coordinator());
            assert_eq!(topology.select_with(OperationKind::FullRepair, &mut rng), topology.coordinator());
        }
    }

    #[tokio::test]
    async fn test_router_reconfiguration() {
        let router = ReplicaRouter::new(four_nodes());

        let extra = NodeEndpoint::parse("127.0.0.1:8004").unwrap();
        router.add_node(extra.clone()).await.unwrap();
        assert_eq!(router.snapshot().await.len(), 5);
        assert!(matches!(
            router.add_node(extra.clone()).await,
            Err(TopologyError::DuplicateNode(_))
        ));

        let first = NodeEndpoint::parse("127.0.0.1:8000").unwrap();
        router.remove_node(&first).await.unwrap();
        assert_eq!(router.select(OperationKind::Repair).await.as_str(), "127.0.0.1:8001");
        assert!(matches!(
            router.remove_node(&first).await,
            Err(TopologyError::UnknownNode(_))
        ));

        router.replace(ClusterTopology::parse(&["10.0.0.1:8000"]).unwrap()).await;
        let only = NodeEndpoint::parse("10.0.0.1:8000").unwrap();
        assert_eq!(router.select(OperationKind::Insert).await, only);
        assert_eq!(router.remove_node(&only).await, Err(TopologyError::Empty));
        assert_eq!(router.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_selection_during_reconfiguration() {
        let router = ReplicaRouter::new(four_nodes());
        let mut handles = Vec::new();
        for i in 0..8 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let node = router.select(OperationKind::Read).await;
                    assert!(router.snapshot().await.len() >= 1);
                    assert!(!node.as_str().is_empty());
                }
                i
            }));
        }
        for port in 9000..9010 {
            router
                .add_node(NodeEndpoint::parse(&format!("127.0.0.1:{}", port)).unwrap())
                .await
                .unwrap();
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(router.snapshot().await.len(), 14);
    }
}
