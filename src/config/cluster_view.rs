use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::info;

use crate::messaging::node_addr::NodeId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NodeInfo {
    pub address: SocketAddr,
    pub generation: u64,
}

/// One immutable view of the cluster roster. Swapped wholesale; never
///  mutated in place.
#[derive(Debug)]
pub struct ClusterSnapshot {
    pub cluster_name: String,
    pub version: u64,
    pub nodes: FxHashMap<u64, NodeInfo>,
}

impl ClusterSnapshot {
    pub fn new(cluster_name: impl Into<String>, version: u64) -> ClusterSnapshot {
        ClusterSnapshot {
            cluster_name: cluster_name.into(),
            version,
            nodes: FxHashMap::default(),
        }
    }

    pub fn with_node(mut self, index: u64, address: SocketAddr, generation: u64) -> ClusterSnapshot {
        self.nodes.insert(
            index,
            NodeInfo {
                address,
                generation,
            },
        );
        self
    }

    pub fn lookup(&self, node_index: u64) -> Option<NodeInfo> {
        self.nodes.get(&node_index).copied()
    }

    /// true iff `node` refers to a configured slot with a matching
    ///  generation (zero is a wildcard)
    pub fn contains(&self, node: NodeId) -> bool {
        match self.lookup(node.index) {
            Some(info) => node.matches(NodeId::new(node.index, info.generation)),
            None => false,
        }
    }
}

/// Shared handle on the current cluster snapshot. Readers resolve against
///  whatever snapshot is current at the time of the call; the sender observes
///  swaps lazily, and the worker's periodic sweep closes connections to
///  departed nodes.
#[derive(Clone)]
pub struct ClusterView {
    current: Arc<RwLock<Arc<ClusterSnapshot>>>,
}

impl ClusterView {
    pub fn new(initial: ClusterSnapshot) -> ClusterView {
        ClusterView {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn current(&self) -> Arc<ClusterSnapshot> {
        self.current
            .read()
            .expect("cluster view lock poisoned")
            .clone()
    }

    pub fn swap(&self, next: ClusterSnapshot) {
        info!(version = next.version, "swapping cluster snapshot");
        *self.current.write().expect("cluster view lock poisoned") = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from_str(&format!("127.0.0.1:{}", port)).unwrap()
    }

    fn snapshot() -> ClusterSnapshot {
        ClusterSnapshot::new("test_cluster", 1)
            .with_node(0, addr(4440), 3)
            .with_node(1, addr(4441), 3)
    }

    #[rstest]
    #[case::present(NodeId::new(0, 3), true)]
    #[case::wildcard_generation(NodeId::new(0, 0), true)]
    #[case::wrong_generation(NodeId::new(0, 4), false)]
    #[case::absent(NodeId::new(332, 3), false)]
    fn test_contains(#[case] node: NodeId, #[case] expected: bool) {
        assert_eq!(snapshot().contains(node), expected);
    }

    #[test]
    fn test_lookup() {
        let s = snapshot();
        assert_eq!(
            s.lookup(1),
            Some(NodeInfo {
                address: addr(4441),
                generation: 3
            })
        );
        assert_eq!(s.lookup(2), None);
    }

    #[test]
    fn test_swap_is_visible_to_clones() {
        let view = ClusterView::new(snapshot());
        let other = view.clone();

        view.swap(ClusterSnapshot::new("test_cluster", 2).with_node(7, addr(5000), 1));

        let seen = other.current();
        assert_eq!(seen.version, 2);
        assert!(seen.lookup(0).is_none());
        assert!(seen.lookup(7).is_some());
    }

    #[test]
    fn test_old_snapshot_remains_readable_after_swap() {
        let view = ClusterView::new(snapshot());
        let before = view.current();
        view.swap(ClusterSnapshot::new("test_cluster", 2));
        assert!(before.lookup(0).is_some());
        assert_eq!(view.current().version, 2);
    }
}
