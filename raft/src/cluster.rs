//! Cluster membership and quorum arithmetic.

use std::collections::BTreeSet;

use crate::message::NodeId;

/// The fixed membership of a Raft group.
///
/// `old_nodes` is reserved for a future joint-consensus transition; when
/// present, agreement requires a majority of both sets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterConfig {
    pub nodes: BTreeSet<NodeId>,
    pub old_nodes: Option<BTreeSet<NodeId>>,
}

impl ClusterConfig {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        ClusterConfig {
            nodes: nodes.into_iter().collect(),
            old_nodes: None,
        }
    }

    /// Number of votes required for leadership in the current configuration.
    pub fn quorum(&self) -> usize {
        match &self.old_nodes {
            None => majority(self.nodes.len()),
            Some(old) => majority(self.nodes.len()).max(majority(old.len())),
        }
    }

    /// Whether `granted` constitutes agreement: a majority of `nodes`, and
    /// of `old_nodes` too while one is configured.
    pub fn has_quorum(&self, granted: &BTreeSet<NodeId>) -> bool {
        let agree = |members: &BTreeSet<NodeId>| {
            members.intersection(granted).count() >= majority(members.len())
        };
        agree(&self.nodes) && self.old_nodes.as_ref().map_or(true, agree)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
            || self
                .old_nodes
                .as_ref()
                .map_or(false, |old| old.contains(&node_id))
    }

    /// Every member other than `node_id`.
    pub fn peers_of(&self, node_id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let old = self.old_nodes.iter().flatten();
        self.nodes
            .iter()
            .chain(old)
            .cloned()
            .filter(move |id| *id != node_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
    }
}

/// Minimum size of a strict majority of `members` nodes.
pub fn majority(members: usize) -> usize {
    members / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_sizes() {
        for (members, expected) in [(1, 1), (3, 2), (5, 3), (7, 4)].iter() {
            let config = ClusterConfig::new(1..=*members as u64);
            assert_eq!(config.quorum(), *expected);
        }
    }

    #[test]
    fn joint_quorum_takes_the_larger_majority() {
        let mut config = ClusterConfig::new(vec![1, 2, 3]);
        config.old_nodes = Some((1..=5).collect());
        assert_eq!(config.quorum(), 3);

        let granted: BTreeSet<NodeId> = vec![1, 2].into_iter().collect();
        assert!(!config.has_quorum(&granted));
        let granted: BTreeSet<NodeId> = vec![1, 2, 4, 5].into_iter().collect();
        assert!(config.has_quorum(&granted));
    }

    #[test]
    fn peers_excludes_self() {
        let config = ClusterConfig::new(vec![1, 2, 3]);
        let peers: Vec<NodeId> = config.peers_of(2).collect();
        assert_eq!(peers, vec![1, 3]);
    }
}
