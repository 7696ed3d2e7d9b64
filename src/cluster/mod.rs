//! Module that contains the cluster membership view consumed by the placement algorithms.
//!
//! The placement core doesn't decide when nodes join or leave. It receives a read-only
//! snapshot through the [`ClusterMembership`] trait describing which nodes are members,
//! which ones were added/removed since the last committed table, which ones are failed, and
//! how much data each node should hold relative to the others (its weight).
use std::collections::BTreeSet;

use crate::dlt::NodeId;

pub mod state;

pub use state::{ClusterMap, Node, NodeStatus};

/// Snapshot of the cluster membership handed to [`crate::placement::DataPlacement::compute_dlt`]
pub trait ClusterMembership {
    /// Members once the pending changes are applied (ie: including added nodes, excluding
    /// removed ones)
    fn all_nodes(&self) -> BTreeSet<NodeId>;

    /// Nodes that joined since the last committed table
    fn added_nodes(&self) -> BTreeSet<NodeId>;

    /// Nodes that are leaving the cluster
    fn removed_nodes(&self) -> BTreeSet<NodeId>;

    /// Members that are currently failed. Only used when placement bounds the number of
    /// primaries per token.
    fn failed_nodes(&self) -> BTreeSet<NodeId>;

    /// Relative weight of a member. `None` if the node is unknown.
    fn weight(&self, node: NodeId) -> Option<f64>;
}
