//! Module that contains the data lookup table (DLT) and everything needed to manage its versions.
//!
//! A DLT splits the object id space into `2^width` tokens and maps every token to an ordered
//! list of `depth` storage nodes. The first node of the list is the token's primary.
//!
//!  - [`token`]: object id to token arithmetic
//!  - [`table`]: the immutable-once-published [`Dlt`]
//!  - [`diff`]: a sparse overlay ([`DltDiff`]) used to build the next version cheaply
//!  - [`manager`]: the bounded version history ([`DltManager`]) readers lease tables from
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod diff;
pub mod manager;
pub mod table;
pub mod token;

pub use diff::{DltDelta, DltDiff};
pub use manager::{Commit, DltLease, DltManager};
pub use table::Dlt;
pub use token::{token_of, token_of_key, token_range, ObjectId, Token};

/// Identifier of a storage node.
///
/// `NodeId(0)` is reserved and marks an empty slot while a table is being built.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const INVALID: NodeId = NodeId(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Capability implemented by everything that is persisted or shipped to other nodes.
///
/// Implementations must round-trip byte for byte: `T::deserialize(t.serialize())` is
/// content equal to `t`.
pub trait Serializable: Sized {
    /// Serializes self into [`Bytes`]
    fn serialize(&self) -> Bytes;

    /// Deserializes [`Bytes`] produced by [`Serializable::serialize`]
    fn deserialize(serialized: Bytes) -> Result<Self>;

    /// Cheap upper bound of `self.serialize().len()`, used to pre-allocate buffers
    fn estimated_size(&self) -> usize;
}

/// Read/write access to the rows of a table under construction.
///
/// Implemented by [`Dlt`] (a table built from scratch) and [`DltDiff`] (an overlay on top of
/// the committed table) so placement algorithms can fill either one.
pub trait ReplicaRows {
    fn depth(&self) -> usize;

    fn num_tokens(&self) -> usize;

    fn nodes_for(&self, token: Token) -> &[NodeId];

    fn set_node(&mut self, token: Token, rank: usize, node: NodeId) -> Result<()>;
}
