//! This file contains the [`ClusterMap`] - the default [`ClusterMembership`] implementation.
//!
//! The map tracks every member with its weight and [`NodeStatus`], plus the set of nodes added
//! and removed since the last time the pending changes were cleared (usually right after a
//! new table is committed).
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ClusterMembership;
use crate::{
    dlt::NodeId,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    // Node is up and serving data
    #[default]
    Active,
    // Node is a member but is currently failed. It may come back
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    // Relative capacity of the node. The share of tokens a node gets is proportional to it
    pub weight: f64,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMap {
    #[serde(with = "serde_node_list")]
    nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    added: BTreeSet<NodeId>,
    #[serde(default)]
    removed: BTreeSet<NodeId>,
}

fn validate_weight(node: NodeId, weight: f64) -> Result<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(Error::InvalidArgument {
            reason: format!("node {} has an invalid weight {}", node, weight),
        });
    }

    Ok(())
}

impl ClusterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from a set of `(node, weight)` pairs. Every node is marked as added.
    pub fn with_nodes<I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (NodeId, f64)>,
    {
        let mut map = Self::new();
        for (node, weight) in nodes {
            map.add_node(node, weight)?;
        }

        Ok(map)
    }

    /// Parses a JSON representation of a [`ClusterMap`] and validates it
    pub fn from_json(json: &str) -> Result<Self> {
        let map: ClusterMap = serde_json::from_str(json).map_err(|e| Error::InvalidArgument {
            reason: format!("unable to parse cluster map: {}", e),
        })?;
        map.validate()?;
        Ok(map)
    }

    /// Checks that ids and weights are valid and that pending changes reference known nodes
    pub fn validate(&self) -> Result<()> {
        for (id, node) in self.nodes.iter() {
            if !id.is_valid() {
                return Err(Error::InvalidArgument {
                    reason: "node id 0 is reserved".to_string(),
                });
            }
            validate_weight(*id, node.weight)?;
        }

        for id in self.added.iter().chain(self.removed.iter()) {
            if !self.nodes.contains_key(id) {
                return Err(Error::InvalidArgument {
                    reason: format!("pending change references unknown node {}", id),
                });
            }
        }

        if let Some(id) = self.added.intersection(&self.removed).next() {
            return Err(Error::InvalidArgument {
                reason: format!("node {} is both added and removed", id),
            });
        }

        Ok(())
    }

    /// Adds a new member. It shows up in [`ClusterMembership::added_nodes`] until
    /// [`ClusterMap::clear_pending`] is called.
    pub fn add_node(&mut self, id: NodeId, weight: f64) -> Result<()> {
        if !id.is_valid() {
            return Err(Error::InvalidArgument {
                reason: "node id 0 is reserved".to_string(),
            });
        }
        validate_weight(id, weight)?;
        if self.nodes.contains_key(&id) {
            return Err(Error::InvalidArgument {
                reason: format!("node {} is already a member", id),
            });
        }

        self.nodes.insert(
            id,
            Node {
                id,
                weight,
                status: NodeStatus::Active,
            },
        );
        self.added.insert(id);
        Ok(())
    }

    /// Marks a member as leaving. A node that was added and never committed is simply dropped.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&id) {
            return Err(Error::NotFound {
                reason: format!("node {} is not a member", id),
            });
        }

        if self.added.remove(&id) {
            self.nodes.remove(&id);
        } else {
            self.removed.insert(id);
        }

        Ok(())
    }

    pub fn mark_failed(&mut self, id: NodeId) -> Result<()> {
        self.set_status(id, NodeStatus::Failed)
    }

    pub fn mark_active(&mut self, id: NodeId) -> Result<()> {
        self.set_status(id, NodeStatus::Active)
    }

    fn set_status(&mut self, id: NodeId, status: NodeStatus) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NotFound {
            reason: format!("node {} is not a member", id),
        })?;
        node.status = status;
        Ok(())
    }

    pub fn set_weight(&mut self, id: NodeId, weight: f64) -> Result<()> {
        validate_weight(id, weight)?;
        let node = self.nodes.get_mut(&id).ok_or(Error::NotFound {
            reason: format!("node {} is not a member", id),
        })?;
        node.weight = weight;
        Ok(())
    }

    /// Applies the pending changes: removed nodes are dropped and nothing is pending anymore
    pub fn clear_pending(&mut self) {
        for id in std::mem::take(&mut self.removed) {
            self.nodes.remove(&id);
        }
        self.added.clear();
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClusterMembership for ClusterMap {
    fn all_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .keys()
            .filter(|id| !self.removed.contains(id))
            .copied()
            .collect()
    }

    fn added_nodes(&self) -> BTreeSet<NodeId> {
        self.added.clone()
    }

    fn removed_nodes(&self) -> BTreeSet<NodeId> {
        self.removed.clone()
    }

    fn failed_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.status == NodeStatus::Failed && !self.removed.contains(&node.id))
            .map(|node| node.id)
            .collect()
    }

    fn weight(&self, node: NodeId) -> Option<f64> {
        self.nodes.get(&node).map(|node| node.weight)
    }
}

/// Enable serde to represent the node map as a plain list of [`Node`]s
mod serde_node_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Node;
    use crate::dlt::NodeId;

    pub fn serialize<S: Serializer>(v: &BTreeMap<NodeId, Node>, s: S) -> Result<S::Ok, S::Error> {
        let nodes: Vec<&Node> = v.values().collect();
        nodes.serialize(s)
    }

    /// # Errors
    /// Fails if the same node id shows up twice
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<NodeId, Node>, D::Error> {
        let nodes = Vec::<Node>::deserialize(d)?;
        let mut map = BTreeMap::new();
        for node in nodes {
            let id = node.id;
            if map.insert(id, node).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "node {} is listed more than once",
                    id
                )));
            }
        }
        Ok(map)
    }
}
