//! Weighted placement that keeps data movement low across membership changes.
//!
//! The first table is filled rank by rank: primaries first, then secondaries and so on. Every
//! slot goes to the node with budget left at that rank whose group (the row's prefix plus the
//! candidate) is the furthest below its optimal count, see [`PlacementMetrics`].
//!
//! Updates only touch what membership changes require:
//!  1. surviving replicas of a row move up to fill the holes left by departed nodes
//!  2. in bounded-primary mode, failed primaries swap rank with the first healthy replica
//!     outside of the primary ranks
//!  3. rank by rank, empty slots are filled and added nodes take over slots from the nodes that
//!     are above their budget
use std::collections::BTreeSet;

use tracing::{event, instrument, Level};

use super::{
    diff::PlacementDiff, metrics::PlacementMetrics, PlacementAlgorithm, PlacementParams,
};
use crate::{
    cluster::ClusterMembership,
    config::Algorithm,
    dlt::{Dlt, DltDiff, NodeId, ReplicaRows, Token},
    error::{Error, Result},
};

#[derive(Debug, Default)]
pub struct ConsistentHashing;

impl PlacementAlgorithm for ConsistentHashing {
    fn algorithm(&self) -> Algorithm {
        Algorithm::ConsistentHashing
    }

    #[instrument(level = "debug", skip_all, fields(version = version))]
    fn compute_initial(
        &self,
        cluster: &dyn ClusterMembership,
        params: &PlacementParams,
        version: u64,
    ) -> Result<Dlt> {
        let members = cluster.all_nodes();
        let eligible = eligible_nodes(cluster, params, &members);
        if eligible.len() < params.depth {
            return Err(Error::InsufficientCapacity {
                required: params.depth,
                available: eligible.len(),
            });
        }

        let mut metrics = PlacementMetrics::new(
            &weights_of(cluster, &members)?,
            params.num_tokens(),
            params.depth,
        )?;
        let mut dlt = Dlt::new(params.width, params.depth, version);
        for rank in 0..params.depth {
            fill_rank(&mut dlt, &mut metrics, rank, &eligible, &BTreeSet::new())?;
        }

        event!(
            Level::INFO,
            "initial table over {} nodes ({} tokens, depth {})",
            members.len(),
            params.num_tokens(),
            params.depth
        );
        Ok(dlt)
    }

    #[instrument(level = "debug", skip_all, fields(base = diff.base_version()))]
    fn compute_update(
        &self,
        cluster: &dyn ClusterMembership,
        params: &PlacementParams,
        diff: &mut DltDiff,
    ) -> Result<()> {
        let members = cluster.all_nodes();
        if members.len() < params.depth {
            return Err(Error::InsufficientCapacity {
                required: params.depth,
                available: members.len(),
            });
        }

        let departed: BTreeSet<NodeId> = diff
            .base()
            .nodes()
            .difference(&members)
            .copied()
            .collect();
        let compacted = compact_survivors(diff, &departed)?;

        let demoted = if params.bounded_primaries() {
            demote_failed_primaries(diff, &cluster.failed_nodes(), params.primary_span())?
        } else {
            0
        };

        let eligible = eligible_nodes(cluster, params, &members);
        let gainers: BTreeSet<NodeId> = cluster
            .added_nodes()
            .intersection(&eligible)
            .copied()
            .collect();
        let mut metrics = PlacementMetrics::new(
            &weights_of(cluster, &members)?,
            params.num_tokens(),
            params.depth,
        )?;
        metrics.observe(&*diff);

        let mut filled = 0;
        let mut moved = 0;
        for rank in 0..params.depth {
            let (f, m) = fill_rank(diff, &mut metrics, rank, &eligible, &gainers)?;
            filled += f;
            moved += m;
        }

        event!(
            Level::INFO,
            "departed: {}, compacted rows: {}, demoted primaries: {}, filled slots: {}, moved slots: {}",
            departed.len(),
            compacted,
            demoted,
            filled,
            moved
        );
        Ok(())
    }
}

/// Nodes that can receive new slots. Failed nodes only matter in bounded-primary mode.
fn eligible_nodes(
    cluster: &dyn ClusterMembership,
    params: &PlacementParams,
    members: &BTreeSet<NodeId>,
) -> BTreeSet<NodeId> {
    if params.bounded_primaries() {
        members
            .difference(&cluster.failed_nodes())
            .copied()
            .collect()
    } else {
        members.clone()
    }
}

fn weights_of(
    cluster: &dyn ClusterMembership,
    members: &BTreeSet<NodeId>,
) -> Result<Vec<(NodeId, f64)>> {
    members
        .iter()
        .map(|node| {
            cluster
                .weight(*node)
                .map(|weight| (*node, weight))
                .ok_or(Error::InvalidArgument {
                    reason: format!("node {} has no weight", node),
                })
        })
        .collect()
}

/// Removes `departed` nodes from every row, moving the remaining replicas up. Returns how many
/// rows changed.
fn compact_survivors<R: ReplicaRows + ?Sized>(
    rows: &mut R,
    departed: &BTreeSet<NodeId>,
) -> Result<usize> {
    if departed.is_empty() {
        return Ok(0);
    }

    let depth = rows.depth();
    let mut compacted = 0;
    for token in 0..rows.num_tokens() as Token {
        let row = rows.nodes_for(token);
        if !row.iter().any(|node| departed.contains(node)) {
            continue;
        }

        let mut survivors: Vec<NodeId> = row
            .iter()
            .filter(|node| node.is_valid() && !departed.contains(node))
            .copied()
            .collect();
        survivors.resize(depth, NodeId::INVALID);
        for (rank, node) in survivors.into_iter().enumerate() {
            rows.set_node(token, rank, node)?;
        }
        compacted += 1;
    }

    Ok(compacted)
}

/// Swaps every failed node found in ranks `0..span` with the first healthy node of ranks
/// `span..depth`. Returns how many swaps happened.
fn demote_failed_primaries<R: ReplicaRows + ?Sized>(
    rows: &mut R,
    failed: &BTreeSet<NodeId>,
    span: usize,
) -> Result<usize> {
    if failed.is_empty() {
        return Ok(0);
    }

    let depth = rows.depth();
    let mut demoted = 0;
    for token in 0..rows.num_tokens() as Token {
        let mut row = rows.nodes_for(token).to_vec();
        let mut swapped = false;
        for rank in 0..span.min(depth) {
            if !failed.contains(&row[rank]) {
                continue;
            }
            let healthy = (span..depth).find(|r| row[*r].is_valid() && !failed.contains(&row[*r]));
            if let Some(healthy) = healthy {
                row.swap(rank, healthy);
                swapped = true;
                demoted += 1;
            }
        }

        if swapped {
            for (rank, node) in row.into_iter().enumerate() {
                rows.set_node(token, rank, node)?;
            }
        }
    }

    Ok(demoted)
}

/// Fills the empty slots of `rank`, then lets `gainers` take over slots at that rank until they
/// reach their budget. Returns `(filled, moved)` slot counts.
fn fill_rank<R: ReplicaRows + ?Sized>(
    rows: &mut R,
    metrics: &mut PlacementMetrics,
    rank: usize,
    eligible: &BTreeSet<NodeId>,
    gainers: &BTreeSet<NodeId>,
) -> Result<(usize, usize)> {
    let mut diff = PlacementDiff::for_rank(metrics, &*rows, rank, eligible);

    let mut filled = 0;
    for token in 0..rows.num_tokens() as Token {
        let row = rows.nodes_for(token).to_vec();
        if row[rank].is_valid() {
            continue;
        }

        let candidate = pick_candidate(&diff, metrics, &row, rank)
            .or_else(|| diff.any_candidate(&row))
            .ok_or(Error::InsufficientCapacity {
                required: rows.depth(),
                available: eligible.len(),
            })?;
        assign(rows, metrics, &mut diff, token, rank, candidate)?;
        filled += 1;
    }

    let mut moved = 0;
    for gainer in gainers.iter().copied() {
        for token in diff.donor_rows(metrics, &*rows, gainer) {
            if diff.remaining_deficit(gainer) <= 0 {
                break;
            }

            let row = rows.nodes_for(token);
            if row.contains(&gainer) || diff.remaining_deficit(row[rank]) >= 0 {
                continue;
            }
            assign(rows, metrics, &mut diff, token, rank, gainer)?;
            moved += 1;
        }
    }

    Ok((filled, moved))
}

fn pick_candidate(
    diff: &PlacementDiff,
    metrics: &PlacementMetrics,
    row: &[NodeId],
    rank: usize,
) -> Option<NodeId> {
    match rank {
        0 => match row.get(1).copied().filter(NodeId::is_valid) {
            Some(l2) => diff.pick_replacement_for_primary(metrics, row[0], l2, row),
            None => diff.transfer(metrics, &[], row),
        },
        1 => diff.transfer_secondary(metrics, row[0], row),
        2 => diff.transfer_tertiary(metrics, row[0], row[1], row),
        3 => diff.transfer_quaternary(metrics, row[0], row[1], row[2], row),
        _ => diff.transfer(metrics, &row[..rank], row),
    }
}

fn assign<R: ReplicaRows + ?Sized>(
    rows: &mut R,
    metrics: &mut PlacementMetrics,
    diff: &mut PlacementDiff,
    token: Token,
    rank: usize,
    node: NodeId,
) -> Result<()> {
    let old = rows.nodes_for(token).to_vec();
    rows.set_node(token, rank, node)?;
    metrics.update_row(&old, rows.nodes_for(token));
    diff.record(old[rank], node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::Arc,
    };

    use quickcheck::{Arbitrary, Gen};

    use super::ConsistentHashing;
    use crate::{
        cluster::{ClusterMap, ClusterMembership},
        dlt::{Dlt, DltDiff, NodeId},
        placement::{metrics::PlacementMetrics, PlacementAlgorithm, PlacementParams},
    };

    fn n(id: u64) -> NodeId {
        NodeId(id)
    }

    fn params(width: u32, depth: usize, num_primaries: usize) -> PlacementParams {
        PlacementParams {
            width,
            depth,
            num_primaries,
        }
    }

    fn primary_counts(dlt: &Dlt) -> BTreeMap<NodeId, u32> {
        let mut counts = BTreeMap::new();
        for (_, row) in dlt.rows() {
            *counts.entry(row[0]).or_default() += 1;
        }
        counts
    }

    fn update(cluster: &ClusterMap, params: &PlacementParams, base: &Arc<Dlt>) -> DltDiff {
        let mut diff = DltDiff::new(base.clone(), base.version() + 1);
        ConsistentHashing
            .compute_update(cluster, params, &mut diff)
            .unwrap();
        diff.prune_unchanged();
        diff
    }

    #[test]
    fn test_initial_equal_weights() {
        let cluster = ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)]).unwrap();
        let dlt = ConsistentHashing
            .compute_initial(&cluster, &params(4, 2, 0), 1)
            .unwrap();

        dlt.verify(&cluster.all_nodes()).unwrap();
        let counts = primary_counts(&dlt);
        assert_eq!(counts.values().sum::<u32>(), 16);
        for count in counts.values() {
            assert!(*count == 5 || *count == 6, "{:?}", counts);
        }
        // and 5 or 6 times as a secondary
        let mut secondaries: BTreeMap<NodeId, u32> = BTreeMap::new();
        for (_, row) in dlt.rows() {
            *secondaries.entry(row[1]).or_default() += 1;
        }
        for count in secondaries.values() {
            assert!((5..=6).contains(count), "{:?}", secondaries);
        }
    }

    #[test]
    fn test_initial_follows_weights() {
        let cluster = ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 2.0)]).unwrap();
        let dlt = ConsistentHashing
            .compute_initial(&cluster, &params(6, 3, 0), 1)
            .unwrap();

        dlt.verify(&cluster.all_nodes()).unwrap();
        let counts = primary_counts(&dlt);
        assert_eq!(counts[&n(1)], 16);
        assert_eq!(counts[&n(2)], 16);
        assert_eq!(counts[&n(3)], 32);
    }

    #[test]
    fn test_initial_not_enough_nodes() {
        let cluster = ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0)]).unwrap();
        let err = ConsistentHashing
            .compute_initial(&cluster, &params(4, 3, 0), 1)
            .err()
            .unwrap();
        assert!(err.is_insufficient_capacity());

        // failed nodes don't count in bounded-primary mode
        let mut cluster = ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)]).unwrap();
        cluster.mark_failed(n(3)).unwrap();
        let err = ConsistentHashing
            .compute_initial(&cluster, &params(4, 3, 1), 1)
            .err()
            .unwrap();
        assert!(err.is_insufficient_capacity());
    }

    #[test]
    fn test_no_change() {
        let mut cluster =
            ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)]).unwrap();
        let params = params(4, 2, 0);
        let base = Arc::new(ConsistentHashing.compute_initial(&cluster, &params, 1).unwrap());
        cluster.clear_pending();

        let diff = update(&cluster, &params, &base);
        assert!(diff.delta().is_empty());
    }

    #[test]
    fn test_remove_node() {
        let mut cluster =
            ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)]).unwrap();
        let params = params(4, 2, 0);
        let base = Arc::new(ConsistentHashing.compute_initial(&cluster, &params, 1).unwrap());
        cluster.clear_pending();
        cluster.remove_node(n(3)).unwrap();

        let diff = update(&cluster, &params, &base);
        let dlt = diff.flatten();
        dlt.verify(&cluster.all_nodes()).unwrap();
        assert!(dlt.tokens_owned_by(n(3)).is_empty());

        for (token, row) in base.rows() {
            if row[0] == n(3) {
                // the secondary took over
                assert_eq!(dlt.primary_for(token), row[1]);
            } else if !row.contains(&n(3)) {
                assert_eq!(dlt.nodes_for(token), row);
            } else {
                assert_eq!(dlt.primary_for(token), row[0]);
            }
        }
    }

    #[test]
    fn test_add_node() {
        let mut cluster =
            ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)]).unwrap();
        let params = params(4, 3, 0);
        let base = Arc::new(ConsistentHashing.compute_initial(&cluster, &params, 1).unwrap());
        cluster.clear_pending();
        cluster.add_node(n(4), 1.0).unwrap();

        let diff = update(&cluster, &params, &base);
        let dlt = diff.flatten();
        dlt.verify(&cluster.all_nodes()).unwrap();

        let counts = primary_counts(&dlt);
        assert_eq!(counts.values().sum::<u32>(), 16);
        for count in counts.values() {
            assert_eq!(*count, 4, "{:?}", counts);
        }
        // rows that didn't receive the new node are untouched
        for token in diff.changed_tokens() {
            assert!(dlt.nodes_for(token).contains(&n(4)));
        }
        for (token, row) in dlt.rows() {
            if !row.contains(&n(4)) {
                assert_eq!(base.nodes_for(token), row);
            }
        }
    }

    #[test]
    fn test_no_surviving_replica_left_to_fill() {
        let mut cluster = ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0)]).unwrap();
        let params = params(2, 2, 0);
        let base = Arc::new(ConsistentHashing.compute_initial(&cluster, &params, 1).unwrap());
        cluster.clear_pending();
        cluster.remove_node(n(2)).unwrap();

        let mut diff = DltDiff::new(base, 2);
        let err = ConsistentHashing
            .compute_update(&cluster, &params, &mut diff)
            .err()
            .unwrap();
        assert!(err.is_insufficient_capacity());
    }

    #[test]
    fn test_failed_primaries_are_demoted() {
        let mut cluster =
            ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 1.0), (n(4), 1.0)]).unwrap();
        let params = params(3, 3, 1);
        let base = Arc::new(ConsistentHashing.compute_initial(&cluster, &params, 1).unwrap());
        cluster.clear_pending();
        cluster.mark_failed(n(1)).unwrap();

        let diff = update(&cluster, &params, &base);
        let dlt = diff.flatten();
        dlt.verify(&cluster.all_nodes()).unwrap();

        for (token, row) in base.rows() {
            let new_row = dlt.nodes_for(token);
            assert_ne!(new_row[0], n(1));
            if row[0] == n(1) {
                // swapped with the secondary, the failed node keeps its data
                assert_eq!(new_row[0], row[1]);
                assert_eq!(new_row[1], n(1));
            } else {
                assert_eq!(new_row, row);
            }
        }
    }

    #[test]
    fn test_failed_nodes_are_ignored_without_bounded_primaries() {
        let mut cluster =
            ClusterMap::with_nodes([(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)]).unwrap();
        let params = params(3, 2, 0);
        let base = Arc::new(ConsistentHashing.compute_initial(&cluster, &params, 1).unwrap());
        cluster.clear_pending();
        cluster.mark_failed(n(1)).unwrap();

        let diff = update(&cluster, &params, &base);
        assert!(diff.delta().is_empty());
    }

    #[derive(Clone, Debug)]
    struct ArbitraryCluster {
        weights: Vec<(NodeId, f64)>,
        width: u32,
        depth: usize,
    }

    impl Arbitrary for ArbitraryCluster {
        fn arbitrary(g: &mut Gen) -> Self {
            let num_nodes = u8::arbitrary(g) as usize % 7 + 2;
            let weights = (1..=num_nodes as u64)
                .map(|id| (n(id), (u8::arbitrary(g) % 4 + 1) as f64))
                .collect();
            let width = u32::arbitrary(g) % 6 + 1;
            let depth = usize::arbitrary(g) % num_nodes.min(4) + 1;

            Self {
                weights,
                width,
                depth,
            }
        }
    }

    #[quickcheck]
    fn prop_initial_rows_are_complete_and_follow_targets(cluster: ArbitraryCluster) -> bool {
        let map = ClusterMap::with_nodes(cluster.weights.clone()).unwrap();
        let params = params(cluster.width, cluster.depth, 0);
        let dlt = ConsistentHashing.compute_initial(&map, &params, 1).unwrap();
        if dlt.verify(&map.all_nodes()).is_err() {
            return false;
        }

        let metrics =
            PlacementMetrics::new(&cluster.weights, params.num_tokens(), params.depth).unwrap();
        let targets = metrics.target_primary_tokens(&map.all_nodes());
        let counts = primary_counts(&dlt);
        targets
            .iter()
            .all(|(node, target)| counts.get(node).copied().unwrap_or_default() == *target)
    }

    #[quickcheck]
    fn prop_updates_keep_rows_valid(cluster: ArbitraryCluster, remove: u8, add: bool) -> bool {
        let mut map = ClusterMap::with_nodes(cluster.weights.clone()).unwrap();
        let params = params(cluster.width, cluster.depth, 0);
        let base = Arc::new(ConsistentHashing.compute_initial(&map, &params, 1).unwrap());
        map.clear_pending();

        let removed = n(remove as u64 % cluster.weights.len() as u64 + 1);
        if map.len() > params.depth {
            map.remove_node(removed).unwrap();
        }
        if add {
            map.add_node(n(100), 2.0).unwrap();
        }

        let diff = update(&map, &params, &base);
        let dlt = diff.flatten();
        dlt.verify(&map.all_nodes()).is_ok()
            && map
                .removed_nodes()
                .iter()
                .all(|node| dlt.tokens_owned_by(*node).is_empty())
            && base
                .rows()
                .filter(|(_, row)| !row.iter().any(|node| map.removed_nodes().contains(node)))
                .filter(|(token, _)| !dlt.nodes_for(*token).contains(&n(100)))
                .all(|(token, row)| dlt.nodes_for(token) == row)
    }

    #[test]
    fn test_rows_are_independent_of_insertion_order() {
        let params = params(4, 2, 0);
        let lhs = ClusterMap::with_nodes([(n(1), 1.0), (n(2), 2.0), (n(3), 1.0)]).unwrap();
        let rhs = ClusterMap::with_nodes([(n(3), 1.0), (n(2), 2.0), (n(1), 1.0)]).unwrap();
        let lhs = ConsistentHashing.compute_initial(&lhs, &params, 1).unwrap();
        let rhs = ConsistentHashing.compute_initial(&rhs, &params, 1).unwrap();
        assert_eq!(lhs, rhs);
        assert_eq!(lhs.nodes(), BTreeSet::from([n(1), n(2), n(3)]));
    }
}
