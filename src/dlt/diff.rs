//! Sparse overlays over a [`Dlt`].
//!
//! Recomputing placement after a membership change usually touches a small fraction of the
//! tokens. Instead of copying the whole table up front, the placement algorithm writes into a
//! [`DltDiff`] which only stores the rows that changed and falls back to its base table for
//! everything else. The overlay is only materialized by [`DltDiff::flatten`].
//!
//! The changed rows (plus the base version) are also what gets shipped to other nodes: see
//! [`DltDelta`], the detached and serializable part of a diff.
use std::{collections::BTreeMap, mem::size_of, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    table::{now_millis, verify_checksum, MAX_DEPTH},
    token::MAX_TOKEN_BITS,
    Dlt, NodeId, ReplicaRows, Serializable, Token,
};
use crate::error::{Error, Result};

/// Magic number at the start of a serialized [`DltDelta`] ("DLD" + format version 1)
const DELTA_MAGIC: u32 = 0x444c_4401;

/// magic | base_version | new_version | timestamp | width | depth | n_changed
const HEADER_SIZE: usize = size_of::<u32>()
    + 3 * size_of::<u64>()
    + 2 * size_of::<u8>()
    + size_of::<u32>();

/// The changed rows of a new table version relative to its base version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DltDelta {
    base_version: u64,
    new_version: u64,
    timestamp: u64,
    width: u32,
    depth: usize,
    changed: BTreeMap<Token, Vec<NodeId>>,
}

impl DltDelta {
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn new_version(&self) -> u64 {
        self.new_version
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Changed rows, ordered by token
    pub fn changed_rows(&self) -> impl Iterator<Item = (Token, &[NodeId])> + '_ {
        self.changed
            .iter()
            .map(|(token, row)| (*token, row.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.changed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

impl Serializable for DltDelta {
    /// Format:
    /// | u32 | u64          | u64         | u64       | u8    | u8    | u32       | (u32, u64 * D) * n_changed | u32    |
    /// |magic| base_version | new_version | timestamp | width | depth | n_changed | (token, node ids)          | crc32c |
    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.estimated_size());
        buf.put_u32(DELTA_MAGIC);
        buf.put_u64(self.base_version);
        buf.put_u64(self.new_version);
        buf.put_u64(self.timestamp);
        buf.put_u8(self.width as u8);
        buf.put_u8(self.depth as u8);
        buf.put_u32(self.changed.len() as u32);
        for (token, row) in self.changed.iter() {
            buf.put_u32(*token);
            for node in row {
                buf.put_u64(node.0);
            }
        }
        let checksum = crc32c::crc32c(&buf);
        buf.put_u32(checksum);

        buf.freeze()
    }

    fn deserialize(mut serialized: Bytes) -> Result<Self> {
        verify_checksum(&serialized, HEADER_SIZE)?;

        let magic = serialized.get_u32();
        if magic != DELTA_MAGIC {
            return Err(Error::Serialization {
                reason: format!("unexpected magic {:#x} for a serialized DLT delta", magic),
            });
        }

        let base_version = serialized.get_u64();
        let new_version = serialized.get_u64();
        let timestamp = serialized.get_u64();
        let width = serialized.get_u8() as u32;
        let depth = serialized.get_u8() as usize;
        let n_changed = serialized.get_u32() as usize;
        if width > MAX_TOKEN_BITS || !(1..=MAX_DEPTH).contains(&depth) {
            return Err(Error::Serialization {
                reason: format!("unsupported table shape width={} depth={}", width, depth),
            });
        }

        let row_size = size_of::<u32>() + depth * size_of::<u64>();
        let expected_size = n_changed * row_size + size_of::<u32>();
        if serialized.len() != expected_size {
            return Err(Error::Serialization {
                reason: format!(
                    "buffer provided to deserialize into DltDelta has the wrong size. Expected {}, got {}",
                    expected_size,
                    serialized.len()
                ),
            });
        }

        let mut changed = BTreeMap::new();
        for _ in 0..n_changed {
            let token = serialized.get_u32();
            if token as usize >= 1usize << width {
                return Err(Error::Serialization {
                    reason: format!("token {} is out of range for width {}", token, width),
                });
            }
            let row = (0..depth).map(|_| NodeId(serialized.get_u64())).collect();
            if changed.insert(token, row).is_some() {
                return Err(Error::Serialization {
                    reason: format!("token {} shows up twice in the serialized DltDelta", token),
                });
            }
        }

        Ok(Self {
            base_version,
            new_version,
            timestamp,
            width,
            depth,
            changed,
        })
    }

    fn estimated_size(&self) -> usize {
        HEADER_SIZE
            + self.changed.len() * (size_of::<u32>() + self.depth * size_of::<u64>())
            + size_of::<u32>()
    }
}

/// A lazily materialized table: every token not present in the overlay resolves to the
/// base table's row.
#[derive(Debug, Clone)]
pub struct DltDiff {
    base: Arc<Dlt>,
    delta: DltDelta,
}

impl DltDiff {
    /// Creates an empty overlay on top of `base` that will become `new_version` once flattened
    pub fn new(base: Arc<Dlt>, new_version: u64) -> Self {
        let delta = DltDelta {
            base_version: base.version(),
            new_version,
            timestamp: now_millis(),
            width: base.width(),
            depth: base.depth(),
            changed: BTreeMap::new(),
        };

        Self { base, delta }
    }

    /// Re-attaches a [`DltDelta`] (eg: one received from another node) to its base table.
    ///
    /// # Errors
    /// Returns [`Error::InvalidVersion`] if `base` is not the version the delta was computed from
    ///
    /// # Panics
    /// If the shapes of `base` and `delta` don't match
    pub fn from_delta(base: Arc<Dlt>, delta: DltDelta) -> Result<Self> {
        if base.version() != delta.base_version {
            return Err(Error::InvalidVersion {
                version: base.version(),
                reason: format!(
                    "delta was computed against version {}",
                    delta.base_version
                ),
            });
        }
        assert!(
            base.width() == delta.width && base.depth() == delta.depth,
            "delta shape (width={}, depth={}) doesn't match its base (width={}, depth={})",
            delta.width,
            delta.depth,
            base.width(),
            base.depth()
        );

        Ok(Self { base, delta })
    }

    pub fn base(&self) -> &Arc<Dlt> {
        &self.base
    }

    pub fn base_version(&self) -> u64 {
        self.delta.base_version
    }

    pub fn new_version(&self) -> u64 {
        self.delta.new_version
    }

    pub fn delta(&self) -> &DltDelta {
        &self.delta
    }

    pub fn into_delta(self) -> DltDelta {
        self.delta
    }

    /// Row of `token` as it will look in the new version
    pub fn nodes_for(&self, token: Token) -> &[NodeId] {
        match self.delta.changed.get(&token) {
            Some(row) => row,
            None => self.base.nodes_for(token),
        }
    }

    /// Sets a slot of the new version, copying the base row into the overlay on first write.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRank`] if `rank >= depth`
    pub fn set_node(&mut self, token: Token, rank: usize, node: NodeId) -> Result<()> {
        if rank >= self.delta.depth {
            return Err(Error::InvalidRank {
                rank,
                depth: self.delta.depth,
            });
        }
        if self.nodes_for(token)[rank] == node {
            return Ok(());
        }

        let base = &self.base;
        let row = self
            .delta
            .changed
            .entry(token)
            .or_insert_with(|| base.nodes_for(token).to_vec());
        row[rank] = node;
        Ok(())
    }

    /// Tokens recorded in the overlay
    pub fn changed_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.delta.changed.keys().copied()
    }

    /// Drops overlay rows that ended up identical to the base rows
    pub fn prune_unchanged(&mut self) {
        let base = &self.base;
        self.delta
            .changed
            .retain(|token, row| base.nodes_for(*token) != row.as_slice());
    }

    /// Materializes every row into a brand new [`Dlt`] with the overlay's new version
    pub fn flatten(&self) -> Dlt {
        let mut dlt = self.base.with_version(self.delta.new_version);
        for (token, row) in self.delta.changed.iter() {
            dlt.set_row(*token, row);
        }
        dlt
    }

    /// Serializes only the changed rows, see [`DltDelta`]
    pub fn serialize(&self) -> Bytes {
        self.delta.serialize()
    }
}

impl ReplicaRows for DltDiff {
    fn depth(&self) -> usize {
        self.delta.depth
    }

    fn num_tokens(&self) -> usize {
        1 << self.delta.width
    }

    fn nodes_for(&self, token: Token) -> &[NodeId] {
        DltDiff::nodes_for(self, token)
    }

    fn set_node(&mut self, token: Token, rank: usize, node: NodeId) -> Result<()> {
        DltDiff::set_node(self, token, rank, node)
    }
}
