//! Legacy placement: token `t` is replicated on `nodes[t % n], nodes[(t + 1) % n], ..`.
//!
//! Weights and failures are ignored and every membership change reshuffles most rows. Kept for
//! compatibility with deployments that never switched to consistent hashing.
use tracing::{event, Level};

use super::{PlacementAlgorithm, PlacementParams};
use crate::{
    cluster::ClusterMembership,
    config::Algorithm,
    dlt::{Dlt, DltDiff, NodeId, ReplicaRows, Token},
    error::{Error, Result},
};

#[derive(Debug, Default)]
pub struct RoundRobin;

impl RoundRobin {
    fn sorted_nodes(cluster: &dyn ClusterMembership, depth: usize) -> Result<Vec<NodeId>> {
        let nodes: Vec<NodeId> = cluster.all_nodes().into_iter().collect();
        if nodes.len() < depth {
            return Err(Error::InsufficientCapacity {
                required: depth,
                available: nodes.len(),
            });
        }

        Ok(nodes)
    }

    fn fill<R: ReplicaRows + ?Sized>(rows: &mut R, nodes: &[NodeId]) -> Result<()> {
        let n = nodes.len();
        for token in 0..rows.num_tokens() {
            for rank in 0..rows.depth() {
                rows.set_node(token as Token, rank, nodes[(token + rank) % n])?;
            }
        }

        Ok(())
    }
}

impl PlacementAlgorithm for RoundRobin {
    fn algorithm(&self) -> Algorithm {
        Algorithm::RoundRobin
    }

    fn compute_initial(
        &self,
        cluster: &dyn ClusterMembership,
        params: &PlacementParams,
        version: u64,
    ) -> Result<Dlt> {
        let nodes = Self::sorted_nodes(cluster, params.depth)?;
        let mut dlt = Dlt::new(params.width, params.depth, version);
        Self::fill(&mut dlt, &nodes)?;
        event!(Level::DEBUG, "round robin table over {} nodes", nodes.len());
        Ok(dlt)
    }

    fn compute_update(
        &self,
        cluster: &dyn ClusterMembership,
        params: &PlacementParams,
        diff: &mut DltDiff,
    ) -> Result<()> {
        let nodes = Self::sorted_nodes(cluster, params.depth)?;
        // rows that end up identical to the base don't show up in the diff
        Self::fill(diff, &nodes)
    }
}
