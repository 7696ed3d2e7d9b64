//! Optimal and actual token counts used by the consistent-hashing placement.
//!
//! The optimal number of primary tokens of a node is its share of the total weight times the
//! number of tokens. Deeper ranks are modeled as sampling without replacement: once `l1` is the
//! primary of a token, the secondary is picked among the remaining nodes proportionally to their
//! weight. This gives, for a group `(l1, .., lk)`:
//!
//! ```text
//! optimal(l1)          = weight(l1) / total_weight * N
//! optimal(l1, l2)      = optimal(l1) * optimal(l2) / (N - optimal(l1))
//! optimal(l1, .., lk)  = optimal(l1, .., lk-1) * optimal(lk) / (N - sum(optimal(l1..lk-1)))
//! ```
//!
//! Groups with a repeated node have an optimal of 0 (a node can't replicate itself).
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    dlt::{NodeId, ReplicaRows},
    error::{Error, Result},
};

#[derive(Debug, Clone)]
pub struct PlacementMetrics {
    num_tokens: usize,
    depth: usize,
    nodes: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
    weights: Vec<f64>,
    optimal_primary: Vec<f64>,
    /// optimal(l1, l2) for every pair, row-major on the node index
    optimal_pairs: Vec<f64>,
    actual_primary: Vec<u32>,
    /// actual count of every fully assigned `row[..k]` prefix, `2 <= k <= depth`
    actual_groups: HashMap<Vec<NodeId>, u32>,
}

impl PlacementMetrics {
    /// Computes the optimal counts of `weights` for a table of `num_tokens` rows and `depth`
    /// replicas. Actual counts start at 0, see [`PlacementMetrics::observe`].
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if there are no nodes, a weight is not a positive number or
    /// the weights are so skewed that a group of `depth - 1` nodes takes every token
    pub fn new(weights: &[(NodeId, f64)], num_tokens: usize, depth: usize) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "can't compute placement metrics without nodes".to_string(),
            });
        }

        let mut sorted = weights.to_vec();
        sorted.sort_by_key(|(node, _)| *node);
        sorted.dedup_by_key(|(node, _)| *node);

        let mut total_weight = 0.0;
        for (node, weight) in sorted.iter() {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(Error::InvalidArgument {
                    reason: format!("node {} has an invalid weight {}", node, weight),
                });
            }
            total_weight += weight;
        }

        let nodes: Vec<NodeId> = sorted.iter().map(|(node, _)| *node).collect();
        let weights: Vec<f64> = sorted.iter().map(|(_, weight)| *weight).collect();
        let index = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let n_tokens = num_tokens as f64;
        let optimal_primary: Vec<f64> = weights
            .iter()
            .map(|weight| weight / total_weight * n_tokens)
            .collect();

        let n = nodes.len();
        // every recursion step divides by what the heaviest `k` nodes leave to the others
        let k = depth.saturating_sub(1).max(1).min(n - 1);
        let mut heaviest = optimal_primary.clone();
        heaviest.sort_by(|a, b| b.total_cmp(a));
        let remainder = n_tokens - heaviest[..k].iter().sum::<f64>();
        if remainder <= k as f64 * f64::EPSILON * n_tokens {
            return Err(Error::InvalidArgument {
                reason: format!(
                    "weights are too skewed: the {} heaviest nodes leave {} of {} tokens",
                    k, remainder, num_tokens
                ),
            });
        }

        let mut optimal_pairs = vec![0.0; n * n];
        for l1 in 0..n {
            for l2 in 0..n {
                if l1 == l2 || optimal_primary[l1] == 0.0 || optimal_primary[l2] == 0.0 {
                    continue;
                }
                let remainder = n_tokens - optimal_primary[l1];
                assert!(
                    remainder > 0.0,
                    "non positive remainder {} for pair ({}, {})",
                    remainder,
                    nodes[l1],
                    nodes[l2]
                );
                optimal_pairs[l1 * n + l2] = optimal_primary[l1] * optimal_primary[l2] / remainder;
            }
        }

        Ok(Self {
            num_tokens,
            depth,
            nodes,
            index,
            weights,
            optimal_primary,
            optimal_pairs,
            actual_primary: vec![0; n],
            actual_groups: HashMap::new(),
        })
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn weight(&self, node: NodeId) -> f64 {
        self.index
            .get(&node)
            .map(|i| self.weights[*i])
            .unwrap_or_default()
    }

    pub fn optimal_primary_tokens(&self, node: NodeId) -> f64 {
        self.index
            .get(&node)
            .map(|i| self.optimal_primary[*i])
            .unwrap_or_default()
    }

    /// Optimal number of tokens whose first `group.len()` ranks are exactly `group`
    pub fn optimal_tokens(&self, group: &[NodeId]) -> f64 {
        let indexes: Option<Vec<usize>> =
            group.iter().map(|n| self.index.get(n).copied()).collect();
        let indexes = match indexes {
            Some(indexes) => indexes,
            None => return 0.0,
        };

        for (i, node) in indexes.iter().enumerate() {
            if indexes[..i].contains(node) {
                return 0.0;
            }
        }

        match indexes.len() {
            0 => self.num_tokens as f64,
            1 => self.optimal_primary[indexes[0]],
            2 => self.optimal_pairs[indexes[0] * self.nodes.len() + indexes[1]],
            k => {
                let upper = self.optimal_tokens(&group[..k - 1]);
                let last = self.optimal_primary[indexes[k - 1]];
                if upper == 0.0 || last == 0.0 {
                    return 0.0;
                }

                let assigned: f64 = indexes[..k - 1]
                    .iter()
                    .map(|i| self.optimal_primary[*i])
                    .sum();
                let remainder = self.num_tokens as f64 - assigned;
                assert!(
                    remainder > 0.0,
                    "non positive remainder {} for group {:?}",
                    remainder,
                    group
                );
                upper * last / remainder
            }
        }
    }

    /// Number of tokens whose first `group.len()` ranks are currently exactly `group`
    pub fn actual_tokens(&self, group: &[NodeId]) -> u32 {
        match group.len() {
            0 => self.num_tokens as u32,
            1 => self
                .index
                .get(&group[0])
                .map(|i| self.actual_primary[*i])
                .unwrap_or_default(),
            _ => self.actual_groups.get(group).copied().unwrap_or_default(),
        }
    }

    /// `optimal - actual` for the given group. Positive means the group is under-represented.
    pub fn group_deficit(&self, group: &[NodeId]) -> f64 {
        self.optimal_tokens(group) - self.actual_tokens(group) as f64
    }

    /// Resets the actual counts to the content of `rows`
    pub fn observe<R: ReplicaRows + ?Sized>(&mut self, rows: &R) {
        self.actual_primary.iter_mut().for_each(|count| *count = 0);
        self.actual_groups.clear();
        for token in 0..rows.num_tokens() {
            let row = rows.nodes_for(token as u32).to_vec();
            self.count_row(&row, 1);
        }
    }

    /// Updates the actual counts after a row went from `old` to `new`
    pub fn update_row(&mut self, old: &[NodeId], new: &[NodeId]) {
        self.count_row(old, -1);
        self.count_row(new, 1);
    }

    fn count_row(&mut self, row: &[NodeId], delta: i64) {
        let apply = |count: &mut u32| {
            *count = (*count as i64 + delta).max(0) as u32;
        };

        let assigned = row
            .iter()
            .take(self.depth)
            .take_while(|n| n.is_valid())
            .count();
        if assigned == 0 {
            return;
        }

        if let Some(i) = self.index.get(&row[0]) {
            apply(&mut self.actual_primary[*i]);
        }

        for k in 2..=assigned {
            let entry = self.actual_groups.entry(row[..k].to_vec()).or_default();
            apply(entry);
            if *entry == 0 {
                self.actual_groups.remove(&row[..k]);
            }
        }
    }

    /// Integer primary token targets: the optimal fractional counts of `eligible` nodes,
    /// rescaled to cover every token and rounded so that they sum to the number of tokens.
    pub fn target_primary_tokens(&self, eligible: &BTreeSet<NodeId>) -> BTreeMap<NodeId, u32> {
        let expected = self.expected_primaries(eligible);
        round_to_total(&expected, self.num_tokens)
    }

    fn expected_primaries(&self, eligible: &BTreeSet<NodeId>) -> BTreeMap<NodeId, f64> {
        let total: f64 = eligible
            .iter()
            .map(|n| self.optimal_primary_tokens(*n))
            .sum();
        if total <= 0.0 {
            return BTreeMap::new();
        }

        eligible
            .iter()
            .filter(|n| self.index.contains_key(n))
            .map(|n| {
                (
                    *n,
                    self.optimal_primary_tokens(*n) / total * self.num_tokens as f64,
                )
            })
            .collect()
    }

    /// Expected number of times every `eligible` node should show up at `rank`, given the
    /// nodes currently assigned to ranks `0..rank` of every row.
    ///
    /// Within a row, the chance of a candidate is its optimal primary count over the sum of the
    /// optimal primary counts of every candidate not already on the row.
    pub fn expected_at_rank<R: ReplicaRows + ?Sized>(
        &self,
        rows: &R,
        rank: usize,
        eligible: &BTreeSet<NodeId>,
    ) -> BTreeMap<NodeId, f64> {
        if rank == 0 {
            return self.expected_primaries(eligible);
        }

        let candidates: Vec<(NodeId, f64)> = eligible
            .iter()
            .map(|n| (*n, self.optimal_primary_tokens(*n)))
            .filter(|(_, optimal)| *optimal > 0.0)
            .collect();

        let mut expected: BTreeMap<NodeId, f64> = BTreeMap::new();
        for token in 0..rows.num_tokens() {
            let prefix = &rows.nodes_for(token as u32)[..rank];
            if prefix.iter().any(|n| !n.is_valid()) {
                continue;
            }

            let remaining: f64 = candidates
                .iter()
                .filter(|(n, _)| !prefix.contains(n))
                .map(|(_, optimal)| optimal)
                .sum();
            if remaining <= 0.0 {
                continue;
            }

            for (node, optimal) in candidates.iter().filter(|(n, _)| !prefix.contains(n)) {
                *expected.entry(*node).or_default() += optimal / remaining;
            }
        }

        expected
    }
}

/// Rounds `values` to integers summing to `total` with the largest remainder method.
/// Ties go to the smallest [`NodeId`].
pub fn round_to_total(values: &BTreeMap<NodeId, f64>, total: usize) -> BTreeMap<NodeId, u32> {
    let mut rounded: BTreeMap<NodeId, u32> = values
        .iter()
        .map(|(node, value)| (*node, value.max(0.0).floor() as u32))
        .collect();
    if values.is_empty() {
        return rounded;
    }

    let assigned: usize = rounded.values().map(|v| *v as usize).sum();
    let mut leftover = total.saturating_sub(assigned);

    let mut by_fraction: Vec<(NodeId, f64)> = values
        .iter()
        .map(|(node, value)| (*node, value.max(0.0) - value.max(0.0).floor()))
        .collect();
    by_fraction.sort_by(|(lhs_node, lhs), (rhs_node, rhs)| {
        rhs.total_cmp(lhs).then(lhs_node.cmp(rhs_node))
    });

    // more than one round only happens if the values sum below `total`
    while leftover > 0 {
        for (node, _) in by_fraction.iter() {
            if leftover == 0 {
                break;
            }
            if let Some(count) = rounded.get_mut(node) {
                *count += 1;
                leftover -= 1;
            }
        }
    }

    rounded
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{round_to_total, PlacementMetrics};
    use crate::dlt::{Dlt, NodeId};

    fn n(id: u64) -> NodeId {
        NodeId(id)
    }

    fn approx(lhs: f64, rhs: f64) -> bool {
        (lhs - rhs).abs() < 1e-9
    }

    #[test]
    fn test_optimal_primaries_follow_weights() {
        let metrics =
            PlacementMetrics::new(&[(n(1), 1.0), (n(2), 1.0), (n(3), 2.0)], 16, 2).unwrap();
        assert!(approx(metrics.optimal_primary_tokens(n(1)), 4.0));
        assert!(approx(metrics.optimal_primary_tokens(n(3)), 8.0));
        assert!(approx(metrics.optimal_primary_tokens(n(9)), 0.0));
        assert!(approx(metrics.weight(n(3)), 2.0));
    }

    #[test]
    fn test_optimal_pairs() {
        let metrics =
            PlacementMetrics::new(&[(n(1), 1.0), (n(2), 1.0), (n(3), 2.0)], 16, 3).unwrap();
        // optimal(1, 3) = 4 * 8 / (16 - 4)
        assert!(approx(metrics.optimal_tokens(&[n(1), n(3)]), 32.0 / 12.0));
        // optimal(3, 1) = 8 * 4 / (16 - 8)
        assert!(approx(metrics.optimal_tokens(&[n(3), n(1)]), 4.0));
        assert!(approx(metrics.optimal_tokens(&[n(2), n(2)]), 0.0));

        // every primary's secondaries add up to the primary's optimal count
        for l1 in [n(1), n(2), n(3)] {
            let sum: f64 = [n(1), n(2), n(3)]
                .iter()
                .map(|l2| metrics.optimal_tokens(&[l1, *l2]))
                .sum();
            assert!(approx(sum, metrics.optimal_primary_tokens(l1)));
        }
    }

    #[test]
    fn test_optimal_deeper_levels() {
        let nodes = [(n(1), 1.0), (n(2), 1.0), (n(3), 1.0), (n(4), 1.0)];
        let metrics = PlacementMetrics::new(&nodes, 16, 4).unwrap();
        // 4 * 4/12 * 4/8
        assert!(approx(metrics.optimal_tokens(&[n(1), n(2), n(3)]), 2.0 / 3.0));
        assert!(approx(
            metrics.optimal_tokens(&[n(1), n(2), n(3), n(4)]),
            metrics.optimal_tokens(&[n(1), n(2), n(3)])
        ));
        assert!(approx(metrics.optimal_tokens(&[n(1), n(2), n(1)]), 0.0));
        assert!(approx(metrics.optimal_tokens(&[n(1), n(2), n(7)]), 0.0));

        // triples under a pair add up to the pair
        let sum: f64 = nodes
            .iter()
            .map(|(l3, _)| metrics.optimal_tokens(&[n(1), n(2), *l3]))
            .sum();
        assert!(approx(sum, metrics.optimal_tokens(&[n(1), n(2)])));
    }

    #[test]
    fn test_single_node() {
        let metrics = PlacementMetrics::new(&[(n(1), 3.0)], 8, 1).unwrap();
        assert!(approx(metrics.optimal_primary_tokens(n(1)), 8.0));
        assert!(approx(metrics.optimal_tokens(&[n(1), n(1)]), 0.0));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(PlacementMetrics::new(&[], 8, 1).is_err());
        assert!(PlacementMetrics::new(&[(n(1), 0.0)], 8, 1).is_err());
        assert!(PlacementMetrics::new(&[(n(1), f64::NAN)], 8, 1).is_err());
    }

    #[test]
    fn test_skewed_weights() {
        let err = PlacementMetrics::new(&[(n(1), 1e20), (n(2), 1.0), (n(3), 1.0)], 16, 2)
            .err()
            .unwrap();
        assert!(err.is_invalid_argument());

        // two heavy nodes only matter once a row holds both of them above a third rank
        let nodes = [(n(1), 1e20), (n(2), 1e20), (n(3), 1.0)];
        PlacementMetrics::new(&nodes, 16, 2).unwrap();
        assert!(PlacementMetrics::new(&nodes, 16, 3).is_err());

        // skewed but still leaving room to the others
        let nodes = [(n(1), 1e3), (n(2), 1.0), (n(3), 1.0)];
        let metrics = PlacementMetrics::new(&nodes, 16, 3).unwrap();
        assert!(metrics.optimal_tokens(&[n(1), n(2), n(3)]) > 0.0);
    }

    #[test]
    fn test_actual_counts() {
        let mut metrics =
            PlacementMetrics::new(&[(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)], 4, 3).unwrap();
        let dlt = Dlt::from_rows(
            2,
            3,
            1,
            &[
                vec![n(1), n(2), n(3)],
                vec![n(1), n(2), n(3)],
                vec![n(2), n(3), n(1)],
                vec![n(3), NodeId::INVALID, NodeId::INVALID],
            ],
        )
        .unwrap();
        metrics.observe(&dlt);

        assert_eq!(metrics.actual_tokens(&[n(1)]), 2);
        assert_eq!(metrics.actual_tokens(&[n(3)]), 1);
        assert_eq!(metrics.actual_tokens(&[n(1), n(2)]), 2);
        assert_eq!(metrics.actual_tokens(&[n(1), n(2), n(3)]), 2);
        assert_eq!(metrics.actual_tokens(&[n(3), n(1)]), 0);

        metrics.update_row(&[n(1), n(2), n(3)], &[n(1), n(3), n(2)]);
        assert_eq!(metrics.actual_tokens(&[n(1)]), 2);
        assert_eq!(metrics.actual_tokens(&[n(1), n(2)]), 1);
        assert_eq!(metrics.actual_tokens(&[n(1), n(3)]), 1);
        assert_eq!(metrics.actual_tokens(&[n(1), n(3), n(2)]), 1);
        assert!(metrics.group_deficit(&[n(3), n(1)]) > 0.0);
        assert!(metrics.group_deficit(&[n(1), n(2)]) < 0.0);
    }

    #[test]
    fn test_target_primary_tokens() {
        let metrics =
            PlacementMetrics::new(&[(n(1), 1.0), (n(2), 1.0), (n(3), 1.0)], 16, 2).unwrap();
        let all = BTreeSet::from([n(1), n(2), n(3)]);
        let targets = metrics.target_primary_tokens(&all);
        assert_eq!(targets, BTreeMap::from([(n(1), 6), (n(2), 5), (n(3), 5)]));

        // without node 3, its share is spread over the others
        let targets = metrics.target_primary_tokens(&BTreeSet::from([n(1), n(2)]));
        assert_eq!(targets, BTreeMap::from([(n(1), 8), (n(2), 8)]));
    }

    #[test]
    fn test_expected_at_rank() {
        let metrics =
            PlacementMetrics::new(&[(n(1), 1.0), (n(2), 1.0), (n(3), 2.0)], 4, 2).unwrap();
        let dlt = Dlt::from_rows(
            2,
            2,
            1,
            &[
                vec![n(3), NodeId::INVALID],
                vec![n(3), NodeId::INVALID],
                vec![n(1), NodeId::INVALID],
                vec![n(2), NodeId::INVALID],
            ],
        )
        .unwrap();
        let all = BTreeSet::from([n(1), n(2), n(3)]);
        let expected = metrics.expected_at_rank(&dlt, 1, &all);
        // rows led by 3 split evenly between 1 and 2, rows led by 1 or 2 favor 3 (2:1)
        assert!(approx(expected[&n(1)], 0.5 + 0.5 + 1.0 / 3.0));
        assert!(approx(expected[&n(2)], 0.5 + 0.5 + 1.0 / 3.0));
        assert!(approx(expected[&n(3)], 4.0 / 3.0));
    }

    #[test]
    fn test_round_to_total() {
        let values = BTreeMap::from([(n(1), 5.5), (n(2), 5.5), (n(3), 5.0)]);
        assert_eq!(
            round_to_total(&values, 16),
            BTreeMap::from([(n(1), 6), (n(2), 5), (n(3), 5)])
        );

        let values = BTreeMap::from([(n(1), 0.2), (n(2), 0.7), (n(3), 0.1)]);
        assert_eq!(
            round_to_total(&values, 1),
            BTreeMap::from([(n(1), 0), (n(2), 1), (n(3), 0)])
        );

        assert!(round_to_total(&BTreeMap::new(), 4).is_empty());
    }
}
