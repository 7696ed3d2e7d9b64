//! Module that computes new DLT versions from cluster membership changes.
//!
//! [`DataPlacement`] drives one table lineage through the following states:
//!
//! ```text
//!   NoTarget --compute_dlt--> ComputingTarget --commit--> TargetCommitted --persist--> NoTarget
//!                                   |                            |
//!                                   +--------clear_target--------+-------> NoTarget
//! ```
//!
//! The actual row assignment is delegated to a [`PlacementAlgorithm`]: [`ConsistentHashing`]
//! (weighted, minimal data movement) or the legacy [`RoundRobin`].
use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use tracing::{event, instrument, Level};

use crate::{
    cluster::ClusterMembership,
    config::{Algorithm, Config},
    dlt::{Commit, Dlt, DltDiff, DltLease, DltManager, NodeId, Serializable},
    error::{Error, Result},
};

pub mod consistent_hashing;
pub mod diff;
pub mod metrics;
pub mod round_robin;

pub use consistent_hashing::ConsistentHashing;
pub use diff::PlacementDiff;
pub use metrics::PlacementMetrics;
pub use round_robin::RoundRobin;

/// Shape of the tables of a lineage plus the bounded-primary knob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementParams {
    pub width: u32,
    pub depth: usize,
    pub num_primaries: usize,
}

impl PlacementParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.token_bits,
            depth: config.depth,
            num_primaries: config.num_primaries,
        }
    }

    pub fn num_tokens(&self) -> usize {
        1 << self.width
    }

    pub fn bounded_primaries(&self) -> bool {
        self.num_primaries > 0
    }

    /// Number of leading ranks of a row that act as primaries. Without bounded primaries every
    /// replica counts.
    pub fn primary_span(&self) -> usize {
        if self.bounded_primaries() {
            self.num_primaries.min(self.depth)
        } else {
            self.depth
        }
    }
}

pub trait PlacementAlgorithm: Send + Sync + std::fmt::Debug {
    fn algorithm(&self) -> Algorithm;

    /// Builds the first table of a lineage
    fn compute_initial(
        &self,
        cluster: &dyn ClusterMembership,
        params: &PlacementParams,
        version: u64,
    ) -> Result<Dlt>;

    /// Records in `diff` the changes the membership requires on top of `diff`'s base
    fn compute_update(
        &self,
        cluster: &dyn ClusterMembership,
        params: &PlacementParams,
        diff: &mut DltDiff,
    ) -> Result<()>;
}

impl From<Algorithm> for Box<dyn PlacementAlgorithm> {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::RoundRobin => Box::new(RoundRobin),
            Algorithm::ConsistentHashing => Box::new(ConsistentHashing),
        }
    }
}

/// Checks that every row of `dlt` keeps at least one primary that is still a member after the
/// membership change. In bounded-primary mode, failed primaries are demoted by the update, so
/// a row only needs one healthy replica at any rank.
///
/// # Errors
/// [`Error::InvalidArgument`] naming the first orphaned token
pub fn check_update_valid(
    dlt: &Dlt,
    cluster: &dyn ClusterMembership,
    params: &PlacementParams,
) -> Result<()> {
    let members = cluster.all_nodes();
    let failed = if params.bounded_primaries() {
        cluster.failed_nodes()
    } else {
        BTreeSet::new()
    };
    let span = params.primary_span().min(dlt.depth());

    for (token, row) in dlt.rows() {
        if !row[..span].iter().any(|node| members.contains(node)) {
            return Err(Error::InvalidArgument {
                reason: format!(
                    "token {} has no surviving primary among {:?}",
                    token,
                    &row[..span]
                ),
            });
        }

        let healthy = row
            .iter()
            .any(|node| members.contains(node) && !failed.contains(node));
        if !healthy {
            return Err(Error::InvalidArgument {
                reason: format!("token {} has no healthy replica among {:?}", token, row),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A new target table was computed
    Changed,
    /// The membership doesn't require a new table
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementState {
    NoTarget,
    ComputingTarget,
    TargetCommitted,
}

#[derive(Debug)]
struct Target {
    dlt: Arc<Dlt>,
    // None for the first table of a lineage
    diff: Option<DltDiff>,
}

/// Computes, commits and persists new tables of a lineage kept by a [`DltManager`]
#[derive(Debug)]
pub struct DataPlacement {
    manager: DltManager,
    algorithm: Box<dyn PlacementAlgorithm>,
    params: PlacementParams,
    target: Option<Target>,
    state: PlacementState,
}

impl DataPlacement {
    pub fn new(
        manager: DltManager,
        algorithm: Box<dyn PlacementAlgorithm>,
        params: PlacementParams,
    ) -> Self {
        Self {
            manager,
            algorithm,
            params,
            target: None,
            state: PlacementState::NoTarget,
        }
    }

    /// Builds a [`DataPlacement`] (and the [`DltManager`] it feeds) from a validated config
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            DltManager::new(config.max_tables),
            config.algorithm.into(),
            PlacementParams::from_config(config),
        ))
    }

    pub fn manager(&self) -> &DltManager {
        &self.manager
    }

    pub fn params(&self) -> &PlacementParams {
        &self.params
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm.algorithm()
    }

    pub fn num_primaries(&self) -> usize {
        self.params.num_primaries
    }

    pub fn state(&self) -> PlacementState {
        self.state
    }

    /// Computes the next table for the given membership.
    ///
    /// The first table of a lineage gets version 1, the following ones the committed version
    /// plus one. A previously computed (and not committed) target is replaced.
    ///
    /// # Errors
    ///  1. [`Error::Logic`] if a committed target wasn't persisted or cleared yet
    ///  2. [`Error::InvalidArgument`] if a token would lose all of its primaries
    ///  3. [`Error::InsufficientCapacity`] if there are fewer usable nodes than replicas
    ///
    /// # Panics
    /// If the computed table doesn't hold `depth` distinct members on every row
    #[instrument(level = "info", skip_all, fields(algorithm = %self.algorithm.algorithm()))]
    pub fn compute_dlt(&mut self, cluster: &dyn ClusterMembership) -> Result<Outcome> {
        if self.state == PlacementState::TargetCommitted {
            return Err(Error::Logic {
                reason: "the committed target must be persisted or cleared first".to_string(),
            });
        }
        self.clear_target();

        let current = match self.manager.lease_current() {
            Ok(lease) => Some(lease),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        let target = match current {
            None => {
                let dlt = self.algorithm.compute_initial(cluster, &self.params, 1)?;
                Target {
                    dlt: Arc::new(dlt),
                    diff: None,
                }
            }
            Some(current) => {
                assert!(
                    current.width() == self.params.width && current.depth() == self.params.depth,
                    "committed table (width={}, depth={}) doesn't match the lineage {:?}",
                    current.width(),
                    current.depth(),
                    self.params
                );
                check_update_valid(&current, cluster, &self.params)?;

                let mut diff = DltDiff::new(current.dlt().clone(), current.version() + 1);
                self.algorithm
                    .compute_update(cluster, &self.params, &mut diff)?;
                diff.prune_unchanged();
                if diff.delta().is_empty() {
                    event!(
                        Level::INFO,
                        "version {} already matches the membership",
                        current.version()
                    );
                    return Ok(Outcome::Unchanged);
                }

                Target {
                    dlt: Arc::new(diff.flatten()),
                    diff: Some(diff),
                }
            }
        };

        let members = cluster.all_nodes();
        if let Err(err) = target.dlt.verify(&members) {
            panic!(
                "placement produced an invalid version {}: {}",
                target.dlt.version(),
                err
            );
        }

        event!(
            Level::INFO,
            "computed version {} ({} changed rows)",
            target.dlt.version(),
            target
                .diff
                .as_ref()
                .map(|diff| diff.delta().len())
                .unwrap_or(target.dlt.num_tokens())
        );
        self.target = Some(target);
        self.state = PlacementState::ComputingTarget;
        Ok(Outcome::Changed)
    }

    /// Makes the computed target the current version of the manager, see [`DltManager::add`]
    ///
    /// # Errors
    /// [`Error::NotFound`] if there is no computed target waiting to be committed
    pub fn commit<F>(&mut self, on_retired: F) -> Result<Commit>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let target = match (&self.state, self.target.as_mut()) {
            (PlacementState::ComputingTarget, Some(target)) => target,
            _ => {
                return Err(Error::NotFound {
                    reason: "there is no computed target to commit".to_string(),
                })
            }
        };

        let version = target.dlt.version();
        let commit = self.manager.add(Dlt::clone(&target.dlt), on_retired)?;
        // share the manager's instance from now on
        if let Some(committed) = self.manager.get_version(version) {
            target.dlt = committed;
        }

        self.state = PlacementState::TargetCommitted;
        event!(Level::INFO, "committed version {}: {:?}", version, commit);
        Ok(commit)
    }

    /// Leases the current version of the manager
    pub fn get_committed(&self) -> Result<DltLease> {
        self.manager.lease_current()
    }

    /// The table computed by the last [`DataPlacement::compute_dlt`], until it is persisted or
    /// cleared
    pub fn get_target(&self) -> Option<Arc<Dlt>> {
        self.target.as_ref().map(|target| target.dlt.clone())
    }

    /// The rows that changed between the committed version and the target. `None` when there is
    /// no target or when the target is the first table of the lineage.
    pub fn get_target_diff(&self) -> Option<&DltDiff> {
        self.target.as_ref().and_then(|target| target.diff.as_ref())
    }

    /// Drops the target. A committed target stays current in the manager.
    pub fn clear_target(&mut self) {
        if let Some(target) = self.target.take() {
            event!(Level::DEBUG, "cleared target version {}", target.dlt.version());
        }
        self.state = PlacementState::NoTarget;
    }

    /// Closes the committed target (every node acknowledged it) and returns its serialized
    /// form, ready to be written to stable storage.
    ///
    /// # Errors
    /// [`Error::Logic`] if the target wasn't committed
    pub fn persist(&mut self) -> Result<Bytes> {
        if self.state != PlacementState::TargetCommitted {
            return Err(Error::Logic {
                reason: format!("can't persist from state {:?}", self.state),
            });
        }

        self.manager.set_current_closed()?;
        let current = self.manager.lease_current()?;
        let serialized = current.serialize();
        event!(
            Level::INFO,
            "persisting version {} ({} bytes)",
            current.version(),
            serialized.len()
        );
        self.clear_target();
        Ok(serialized)
    }

    /// Nodes of the target that didn't show up in the committed version
    pub fn target_new_nodes(&self) -> BTreeSet<NodeId> {
        let target = match self.target.as_ref() {
            Some(target) => target,
            None => return BTreeSet::new(),
        };
        match target.diff.as_ref() {
            Some(diff) => target
                .dlt
                .nodes()
                .difference(&diff.base().nodes())
                .copied()
                .collect(),
            None => target.dlt.nodes(),
        }
    }
}
