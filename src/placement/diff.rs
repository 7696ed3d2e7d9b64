//! Per-rank deviation between actual and optimal placement.
//!
//! A [`PlacementDiff`] is built for one rank of a table. It holds the integer budget of every
//! eligible node at that rank, how many slots each node currently occupies there, and picks
//! the candidate that best brings the table back toward the optimal group counts of
//! [`PlacementMetrics`] whenever a slot needs a (new) owner.
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use super::metrics::{round_to_total, PlacementMetrics};
use crate::dlt::{NodeId, ReplicaRows, Token};

#[derive(Debug, Clone)]
pub struct PlacementDiff {
    rank: usize,
    eligible: BTreeSet<NodeId>,
    targets: BTreeMap<NodeId, u32>,
    actual: BTreeMap<NodeId, u32>,
}

impl PlacementDiff {
    /// Computes the budgets of `eligible` nodes at `rank` given what `rows` currently hold in
    /// ranks `0..=rank`. Ranks above `rank` must already be complete.
    pub fn for_rank<R: ReplicaRows + ?Sized>(
        metrics: &PlacementMetrics,
        rows: &R,
        rank: usize,
        eligible: &BTreeSet<NodeId>,
    ) -> Self {
        let expected = metrics.expected_at_rank(rows, rank, eligible);
        let total = expected.values().sum::<f64>().round() as usize;
        let targets = if rank == 0 {
            metrics.target_primary_tokens(eligible)
        } else {
            round_to_total(&expected, total)
        };

        let mut actual: BTreeMap<NodeId, u32> = BTreeMap::new();
        for token in 0..rows.num_tokens() {
            let node = rows.nodes_for(token as Token)[rank];
            if node.is_valid() {
                *actual.entry(node).or_default() += 1;
            }
        }

        Self {
            rank,
            eligible: eligible.clone(),
            targets,
            actual,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn target(&self, node: NodeId) -> u32 {
        self.targets.get(&node).copied().unwrap_or_default()
    }

    pub fn actual(&self, node: NodeId) -> u32 {
        self.actual.get(&node).copied().unwrap_or_default()
    }

    /// How many more slots `node` should take at this rank. Negative when it holds too many.
    pub fn remaining_deficit(&self, node: NodeId) -> i32 {
        self.target(node) as i32 - self.actual(node) as i32
    }

    /// Signed `actual - optimal` of a group of nodes (a single node, a pair, a triple or a quad)
    pub fn deviation(metrics: &PlacementMetrics, group: &[NodeId]) -> f64 {
        -metrics.group_deficit(group)
    }

    /// Must be called every time the slot at this rank changes from `old` to `new`
    pub fn record(&mut self, old: NodeId, new: NodeId) {
        if old.is_valid() {
            if let Some(count) = self.actual.get_mut(&old) {
                *count = count.saturating_sub(1);
            }
        }
        if new.is_valid() {
            *self.actual.entry(new).or_default() += 1;
        }
    }

    /// Picks a new primary for a row whose primary `l1` is replaced and whose secondary is `l2`.
    ///
    /// The candidate must still have primary budget. Among those, the one whose `(candidate, l2)`
    /// pairing is the most under-represented wins.
    pub fn pick_replacement_for_primary(
        &self,
        metrics: &PlacementMetrics,
        l1: NodeId,
        l2: NodeId,
        row: &[NodeId],
    ) -> Option<NodeId> {
        assert_eq!(self.rank, 0, "primary replacement requested at rank {}", self.rank);
        self.best_candidate(row, true, |candidate| {
            if candidate == l1 {
                f64::NEG_INFINITY
            } else {
                metrics.group_deficit(&[candidate, l2])
            }
        })
    }

    pub fn transfer_secondary(
        &self,
        metrics: &PlacementMetrics,
        l1: NodeId,
        row: &[NodeId],
    ) -> Option<NodeId> {
        self.transfer(metrics, &[l1], row)
    }

    pub fn transfer_tertiary(
        &self,
        metrics: &PlacementMetrics,
        l1: NodeId,
        l2: NodeId,
        row: &[NodeId],
    ) -> Option<NodeId> {
        self.transfer(metrics, &[l1, l2], row)
    }

    pub fn transfer_quaternary(
        &self,
        metrics: &PlacementMetrics,
        l1: NodeId,
        l2: NodeId,
        l3: NodeId,
        row: &[NodeId],
    ) -> Option<NodeId> {
        self.transfer(metrics, &[l1, l2, l3], row)
    }

    /// Picks the owner of the slot right after `prefix`: a node with budget left at this rank
    /// whose group `prefix + candidate` is the most under-represented.
    pub fn transfer(
        &self,
        metrics: &PlacementMetrics,
        prefix: &[NodeId],
        row: &[NodeId],
    ) -> Option<NodeId> {
        let mut group = prefix.to_vec();
        group.push(NodeId::INVALID);
        self.best_candidate(row, true, |candidate| {
            if let Some(last) = group.last_mut() {
                *last = candidate;
            }
            metrics.group_deficit(&group)
        })
    }

    /// Any eligible node not already on `row`, preferring the one furthest below its budget.
    /// Used when no node has budget left.
    pub fn any_candidate(&self, row: &[NodeId]) -> Option<NodeId> {
        self.best_candidate(row, false, |_| 0.0)
    }

    /// Rows where `gainer` could take over the slot at this rank, best first.
    ///
    /// The current owner of the slot must be above its budget and `gainer` must not already be
    /// on the row. Rows are ranked by how much the move improves the group counts.
    pub fn donor_rows<R: ReplicaRows + ?Sized>(
        &self,
        metrics: &PlacementMetrics,
        rows: &R,
        gainer: NodeId,
    ) -> Vec<Token> {
        let mut donors: Vec<(Token, f64)> = Vec::new();
        for token in 0..rows.num_tokens() as Token {
            let row = rows.nodes_for(token);
            let loser = row[self.rank];
            if !loser.is_valid() || row.contains(&gainer) || self.remaining_deficit(loser) >= 0 {
                continue;
            }

            let gain = metrics.group_deficit(&self.slot_group(row, gainer));
            let loss = metrics.group_deficit(&self.slot_group(row, loser));
            donors.push((token, gain - loss));
        }

        donors.sort_by(|(lhs_token, lhs), (rhs_token, rhs)| {
            rhs.total_cmp(lhs).then(lhs_token.cmp(rhs_token))
        });
        donors.into_iter().map(|(token, _)| token).collect()
    }

    /// The group a node takes part of when placed at this rank of `row`. For primaries that's
    /// the pairing with the secondary, for deeper ranks the prefix of the row.
    fn slot_group(&self, row: &[NodeId], node: NodeId) -> Vec<NodeId> {
        if self.rank == 0 {
            match row.get(1).filter(|n| n.is_valid()) {
                Some(l2) => vec![node, *l2],
                None => vec![node],
            }
        } else {
            let mut group = row[..self.rank].to_vec();
            group.push(node);
            group
        }
    }

    fn best_candidate<F>(&self, row: &[NodeId], with_budget: bool, mut score: F) -> Option<NodeId>
    where
        F: FnMut(NodeId) -> f64,
    {
        let mut best: Option<(NodeId, f64, i32)> = None;
        for candidate in self.eligible.iter().copied() {
            if row.contains(&candidate) {
                continue;
            }
            let deficit = self.remaining_deficit(candidate);
            if with_budget && deficit <= 0 {
                continue;
            }
            let candidate_score = score(candidate);
            if candidate_score == f64::NEG_INFINITY {
                continue;
            }

            // eligible is sorted, so on a complete tie the smallest id stays
            let better = match best {
                None => true,
                Some((_, best_score, best_deficit)) => {
                    match candidate_score.total_cmp(&best_score) {
                        Ordering::Greater => true,
                        Ordering::Less => false,
                        Ordering::Equal => deficit > best_deficit,
                    }
                }
            };
            if better {
                best = Some((candidate, candidate_score, deficit));
            }
        }

        best.map(|(candidate, _, _)| candidate)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::PlacementDiff;
    use crate::{
        dlt::{Dlt, NodeId},
        placement::metrics::PlacementMetrics,
    };

    fn n(id: u64) -> NodeId {
        NodeId(id)
    }

    fn equal_metrics(nodes: &[u64], num_tokens: usize, depth: usize) -> PlacementMetrics {
        let weights: Vec<(NodeId, f64)> = nodes.iter().map(|id| (n(*id), 1.0)).collect();
        PlacementMetrics::new(&weights, num_tokens, depth).unwrap()
    }

    #[test]
    fn test_budgets_of_an_empty_table() {
        let metrics = equal_metrics(&[1, 2, 3], 16, 2);
        let dlt = Dlt::new(4, 2, 1);
        let eligible = BTreeSet::from([n(1), n(2), n(3)]);
        let diff = PlacementDiff::for_rank(&metrics, &dlt, 0, &eligible);

        assert_eq!(diff.target(n(1)), 6);
        assert_eq!(diff.target(n(2)), 5);
        assert_eq!(diff.remaining_deficit(n(3)), 5);
        assert_eq!(diff.actual(n(1)), 0);
        assert_eq!(diff.remaining_deficit(n(9)), 0);
    }

    #[test]
    fn test_record() {
        let metrics = equal_metrics(&[1, 2], 4, 1);
        let dlt = Dlt::new(2, 1, 1);
        let mut diff = PlacementDiff::for_rank(&metrics, &dlt, 0, &BTreeSet::from([n(1), n(2)]));
        diff.record(NodeId::INVALID, n(1));
        diff.record(NodeId::INVALID, n(1));
        diff.record(NodeId::INVALID, n(1));
        assert_eq!(diff.remaining_deficit(n(1)), -1);
        diff.record(n(1), n(2));
        assert_eq!(diff.remaining_deficit(n(1)), 0);
        assert_eq!(diff.remaining_deficit(n(2)), 1);
    }

    #[test]
    fn test_transfer_prefers_under_represented_groups() {
        let mut metrics = equal_metrics(&[1, 2, 3], 4, 2);
        let dlt = Dlt::from_rows(
            2,
            2,
            1,
            &[
                vec![n(1), n(2)],
                vec![n(1), NodeId::INVALID],
                vec![n(2), n(1)],
                vec![n(3), n(1)],
            ],
        )
        .unwrap();
        metrics.observe(&dlt);
        let eligible = BTreeSet::from([n(1), n(2), n(3)]);
        let diff = PlacementDiff::for_rank(&metrics, &dlt, 1, &eligible);
        assert_eq!(diff.remaining_deficit(n(1)), -1);
        assert_eq!(diff.remaining_deficit(n(2)), 1);
        assert_eq!(diff.remaining_deficit(n(3)), 1);

        // (1, 2) already shows up once, (1, 3) never does
        assert_eq!(
            diff.transfer_secondary(&metrics, n(1), &[n(1), NodeId::INVALID]),
            Some(n(3))
        );
        assert!(PlacementDiff::deviation(&metrics, &[n(1), n(2)]) > 0.0);
        assert!(PlacementDiff::deviation(&metrics, &[n(1), n(3)]) < 0.0);
    }

    #[test]
    fn test_no_candidate_with_budget() {
        let metrics = equal_metrics(&[1, 2], 2, 2);
        let dlt = Dlt::from_rows(1, 2, 1, &[vec![n(1), n(2)], vec![n(2), n(1)]]).unwrap();
        let eligible = BTreeSet::from([n(1), n(2)]);
        let diff = PlacementDiff::for_rank(&metrics, &dlt, 0, &eligible);

        // every node sits exactly on its budget
        assert_eq!(
            diff.transfer(&metrics, &[], &[NodeId::INVALID, NodeId::INVALID]),
            None
        );
        assert_eq!(diff.any_candidate(&[NodeId::INVALID, n(2)]), Some(n(1)));
        assert_eq!(diff.any_candidate(&[n(1), n(2)]), None);
    }

    #[test]
    fn test_pick_replacement_for_primary() {
        let mut metrics = equal_metrics(&[1, 2, 3, 4], 4, 2);
        let dlt = Dlt::from_rows(
            2,
            2,
            1,
            &[
                vec![n(2), n(1)],
                vec![n(3), n(4)],
                vec![n(4), n(3)],
                vec![n(1), n(2)],
            ],
        )
        .unwrap();
        metrics.observe(&dlt);
        // node 1 leaves, the remaining nodes share its primary token
        let eligible = BTreeSet::from([n(2), n(3), n(4)]);
        let diff = PlacementDiff::for_rank(&metrics, &dlt, 0, &eligible);
        assert_eq!(diff.target(n(2)), 2);
        assert_eq!(diff.target(n(3)), 1);
        assert_eq!(diff.target(n(4)), 1);

        // 2 is the only node with budget left
        assert_eq!(
            diff.pick_replacement_for_primary(&metrics, n(1), n(3), &[n(1), n(3)]),
            Some(n(2))
        );
        // and it can't be the primary of a row it already replicates
        assert_eq!(
            diff.pick_replacement_for_primary(&metrics, n(1), n(2), &[n(1), n(2)]),
            None
        );
    }

    #[test]
    fn test_donor_rows() {
        let mut metrics = equal_metrics(&[1, 2, 3], 4, 1);
        let dlt =
            Dlt::from_rows(2, 1, 1, &[vec![n(1)], vec![n(1)], vec![n(1)], vec![n(2)]]).unwrap();
        metrics.observe(&dlt);
        let eligible = BTreeSet::from([n(1), n(2), n(3)]);
        let diff = PlacementDiff::for_rank(&metrics, &dlt, 0, &eligible);
        // targets are 2/1/1, the extra token goes to the smallest id
        assert_eq!(diff.remaining_deficit(n(1)), -1);
        assert_eq!(diff.remaining_deficit(n(2)), 0);

        let donors = diff.donor_rows(&metrics, &dlt, n(3));
        assert_eq!(donors, vec![0, 1, 2]);
        assert!(diff.donor_rows(&metrics, &dlt, n(1)).is_empty());
    }
}
