//! This file contains the [`Dlt`] (data lookup table) definition.
//!
//! A [`Dlt`] maps every token to an ordered list of `depth` nodes (rank 0 is the primary).
//! Rows are stored in a single flat vector of `num_tokens * depth` slots.
//!
//! Tables are only mutated while they are being built (`&mut self` APIs). Once a table is
//! handed to the [`super::DltManager`] it's wrapped in an [`Arc`](std::sync::Arc) and becomes
//! read-only, except for the `closed` flag and the lease refcount which are both atomics.
use std::{
    collections::{BTreeSet, HashMap},
    mem::size_of,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        OnceLock,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    token::{token_of, token_range, MAX_TOKEN_BITS},
    NodeId, ObjectId, ReplicaRows, Serializable, Token,
};
use crate::error::{Error, Result};

/// Maximum number of replicas a table can hold per token
pub const MAX_DEPTH: usize = 16;

/// Magic number at the start of a serialized [`Dlt`] ("DLT" + format version 1)
const DLT_MAGIC: u32 = 0x444c_5401;

/// magic | version | timestamp | width | depth | closed
const HEADER_SIZE: usize =
    size_of::<u32>() + size_of::<u64>() + size_of::<u64>() + 3 * size_of::<u8>();
const CHECKSUM_SIZE: usize = size_of::<u32>();

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The data lookup table.
pub struct Dlt {
    version: u64,
    timestamp: u64,
    width: u32,
    depth: usize,
    /// set once every node acknowledged this version
    closed: AtomicBool,
    /// number of outstanding leases handed out by the [`super::DltManager`]
    refcount: AtomicU64,
    slots: Vec<NodeId>,
    /// node -> tokens the node appears in (any rank). Built on first use.
    token_index: OnceLock<HashMap<NodeId, Vec<Token>>>,
}

impl Dlt {
    /// Constructs an empty table (every slot set to [`NodeId::INVALID`])
    ///
    /// # Panics
    /// if `width` is above [`MAX_TOKEN_BITS`] or `depth` is not in `1..=MAX_DEPTH`
    pub fn new(width: u32, depth: usize, version: u64) -> Self {
        assert!(
            width <= MAX_TOKEN_BITS,
            "width {} is above the max of {}",
            width,
            MAX_TOKEN_BITS
        );
        assert!(
            (1..=MAX_DEPTH).contains(&depth),
            "depth {} must be within [1, {}]",
            depth,
            MAX_DEPTH
        );

        Self {
            version,
            timestamp: now_millis(),
            width,
            depth,
            closed: AtomicBool::new(false),
            refcount: AtomicU64::new(0),
            slots: vec![NodeId::INVALID; (1usize << width) * depth],
            token_index: OnceLock::new(),
        }
    }

    /// Builds a table out of explicit rows.
    ///
    /// # Error
    /// Returns [`Error::InvalidArgument`] if the number of rows is not `2^width` or if any row
    /// doesn't have exactly `depth` slots.
    pub fn from_rows(width: u32, depth: usize, version: u64, rows: &[Vec<NodeId>]) -> Result<Self> {
        if width > MAX_TOKEN_BITS || !(1..=MAX_DEPTH).contains(&depth) {
            return Err(Error::InvalidArgument {
                reason: format!("unsupported table shape width={} depth={}", width, depth),
            });
        }

        let mut dlt = Self::new(width, depth, version);
        if rows.len() != dlt.num_tokens() {
            return Err(Error::InvalidArgument {
                reason: format!(
                    "expected {} rows, got {}",
                    dlt.num_tokens(),
                    rows.len()
                ),
            });
        }

        for (token, row) in rows.iter().enumerate() {
            if row.len() != depth {
                return Err(Error::InvalidArgument {
                    reason: format!(
                        "row for token {} has {} slots, expected {}",
                        token,
                        row.len(),
                        depth
                    ),
                });
            }
            dlt.set_row(token as Token, row);
        }

        Ok(dlt)
    }

    /// Returns a copy of this table's rows under a new version.
    ///
    /// The copy is open (not closed), has no leases and gets a fresh timestamp.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            timestamp: now_millis(),
            width: self.width,
            depth: self.depth,
            closed: AtomicBool::new(false),
            refcount: AtomicU64::new(0),
            slots: self.slots.clone(),
            token_index: OnceLock::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn num_tokens(&self) -> usize {
        1 << self.width
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Number of outstanding leases on this table
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) -> u64 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the refcount and returns the new value, or `None` if it was already 0
    pub(crate) fn release(&self) -> Option<u64> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    fn row_start(&self, token: Token) -> usize {
        let token = token as usize;
        assert!(
            token < self.num_tokens(),
            "token {} is out of range for a table with {} tokens",
            token,
            self.num_tokens()
        );
        token * self.depth
    }

    /// Returns the ordered replica list of `token`
    pub fn nodes_for(&self, token: Token) -> &[NodeId] {
        let start = self.row_start(token);
        &self.slots[start..start + self.depth]
    }

    /// Returns the primary of `token`
    pub fn primary_for(&self, token: Token) -> NodeId {
        self.slots[self.row_start(token)]
    }

    /// Returns the node with the given `rank` on `token`'s replica list
    pub fn node_at(&self, token: Token, rank: usize) -> Result<NodeId> {
        if rank >= self.depth {
            return Err(Error::InvalidRank {
                rank,
                depth: self.depth,
            });
        }

        Ok(self.slots[self.row_start(token) + rank])
    }

    /// Returns the rank of `node` on `token`'s replica list, if present
    pub fn index_of(&self, token: Token, node: NodeId) -> Option<usize> {
        self.nodes_for(token).iter().position(|n| *n == node)
    }

    /// Sets the node on the given `rank` of `token`'s replica list
    ///
    /// # Error
    /// Returns [`Error::InvalidRank`] if `rank >= depth`
    pub fn set_node(&mut self, token: Token, rank: usize, node: NodeId) -> Result<()> {
        if rank >= self.depth {
            return Err(Error::InvalidRank {
                rank,
                depth: self.depth,
            });
        }

        let start = self.row_start(token);
        self.slots[start + rank] = node;
        self.token_index = OnceLock::new();
        Ok(())
    }

    pub(crate) fn set_row(&mut self, token: Token, row: &[NodeId]) {
        assert_eq!(row.len(), self.depth, "row doesn't match the table depth");
        let start = self.row_start(token);
        self.slots[start..start + self.depth].copy_from_slice(row);
        self.token_index = OnceLock::new();
    }

    /// Returns every token in which `node` appears, at any rank
    pub fn tokens_owned_by(&self, node: NodeId) -> &[Token] {
        self.token_index
            .get_or_init(|| {
                let mut index: HashMap<NodeId, Vec<Token>> = HashMap::new();
                for (slot, node) in self.slots.iter().enumerate() {
                    if node.is_valid() {
                        index
                            .entry(*node)
                            .or_default()
                            .push((slot / self.depth) as Token);
                    }
                }
                index
            })
            .get(&node)
            .map(|tokens| tokens.as_slice())
            .unwrap_or(&[])
    }

    /// Every node referenced by this table
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.slots.iter().copied().filter(NodeId::is_valid).collect()
    }

    /// Iterates over `(token, replica list)` pairs
    pub fn rows(&self) -> impl Iterator<Item = (Token, &[NodeId])> + '_ {
        self.slots
            .chunks(self.depth)
            .enumerate()
            .map(|(token, row)| (token as Token, row))
    }

    /// Range of object ids owned by `token`
    pub fn token_range_for(&self, token: Token) -> (ObjectId, ObjectId) {
        token_range(token, self.width)
    }

    pub fn token_for_object(&self, object_id: ObjectId) -> Token {
        token_of(object_id, self.width)
    }

    pub fn nodes_for_object(&self, object_id: ObjectId) -> &[NodeId] {
        self.nodes_for(self.token_for_object(object_id))
    }

    pub fn primary_for_object(&self, object_id: ObjectId) -> NodeId {
        self.primary_for(self.token_for_object(object_id))
    }

    /// True if `node` is the primary of the token owning `object_id`
    pub fn is_primary(&self, node: NodeId, object_id: ObjectId) -> bool {
        node.is_valid() && self.primary_for_object(object_id) == node
    }

    /// Verifies the structure of every row.
    ///
    /// # Errors
    ///  1. [`Error::IncompleteRow`] if a slot is still empty
    ///  2. [`Error::DuplicateInColumn`] if a node shows up twice on the same row
    ///  3. [`Error::UnexpectedNode`] if a row references a node outside of `expected_nodes`
    pub fn verify(&self, expected_nodes: &BTreeSet<NodeId>) -> Result<()> {
        for (token, row) in self.rows() {
            for (rank, node) in row.iter().enumerate() {
                if !node.is_valid() {
                    return Err(Error::IncompleteRow { token });
                }
                if row[..rank].contains(node) {
                    return Err(Error::DuplicateInColumn { token, node: *node });
                }
                if !expected_nodes.contains(node) {
                    return Err(Error::UnexpectedNode { token, node: *node });
                }
            }
        }

        Ok(())
    }
}

impl Clone for Dlt {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            timestamp: self.timestamp,
            width: self.width,
            depth: self.depth,
            closed: AtomicBool::new(self.is_closed()),
            refcount: AtomicU64::new(0),
            slots: self.slots.clone(),
            token_index: OnceLock::new(),
        }
    }
}

/// Two tables are equal if they have the same shape and the same rows, regardless of
/// version, timestamp or closed state.
impl PartialEq for Dlt {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width && self.depth == other.depth && self.slots == other.slots
    }
}

impl Eq for Dlt {}

impl std::fmt::Debug for Dlt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dlt")
            .field("version", &self.version)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("depth", &self.depth)
            .field("closed", &self.is_closed())
            .field("refcount", &self.refcount())
            .finish()
    }
}

impl std::fmt::Display for Dlt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "DLT version={} width={} depth={} closed={}",
            self.version,
            self.width,
            self.depth,
            self.is_closed()
        )?;
        for (token, row) in self.rows() {
            write!(f, "{:>6}:", token)?;
            for node in row {
                write!(f, " {}", node)?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

impl Serializable for Dlt {
    /// Format:
    /// | u32 | u64     | u64       | u8    | u8    | u8     | u64 * N * D | u32    |
    /// |magic| version | timestamp | width | depth | closed | node ids    | crc32c |
    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.estimated_size());
        buf.put_u32(DLT_MAGIC);
        buf.put_u64(self.version);
        buf.put_u64(self.timestamp);
        buf.put_u8(self.width as u8);
        buf.put_u8(self.depth as u8);
        buf.put_u8(self.is_closed() as u8);
        for node in self.slots.iter() {
            buf.put_u64(node.0);
        }
        let checksum = crc32c::crc32c(&buf);
        buf.put_u32(checksum);

        buf.freeze()
    }

    fn deserialize(mut serialized: Bytes) -> Result<Self> {
        verify_checksum(&serialized, HEADER_SIZE)?;

        let magic = serialized.get_u32();
        if magic != DLT_MAGIC {
            return Err(Error::Serialization {
                reason: format!("unexpected magic {:#x} for a serialized DLT", magic),
            });
        }

        let version = serialized.get_u64();
        let timestamp = serialized.get_u64();
        let width = serialized.get_u8() as u32;
        let depth = serialized.get_u8() as usize;
        let closed = serialized.get_u8() != 0;
        if width > MAX_TOKEN_BITS || !(1..=MAX_DEPTH).contains(&depth) {
            return Err(Error::Serialization {
                reason: format!("unsupported table shape width={} depth={}", width, depth),
            });
        }

        let n_slots = (1usize << width) * depth;
        let expected_size = n_slots * size_of::<u64>() + CHECKSUM_SIZE;
        if serialized.len() != expected_size {
            return Err(Error::Serialization {
                reason: format!(
                    "buffer provided to deserialize into Dlt has the wrong size. Expected {}, got {}",
                    expected_size,
                    serialized.len()
                ),
            });
        }

        let mut slots = Vec::with_capacity(n_slots);
        for _ in 0..n_slots {
            slots.push(NodeId(serialized.get_u64()));
        }

        Ok(Self {
            version,
            timestamp,
            width,
            depth,
            closed: AtomicBool::new(closed),
            refcount: AtomicU64::new(0),
            slots,
            token_index: OnceLock::new(),
        })
    }

    fn estimated_size(&self) -> usize {
        HEADER_SIZE + self.slots.len() * size_of::<NodeId>() + CHECKSUM_SIZE
    }
}

impl ReplicaRows for Dlt {
    fn depth(&self) -> usize {
        self.depth
    }

    fn num_tokens(&self) -> usize {
        Dlt::num_tokens(self)
    }

    fn nodes_for(&self, token: Token) -> &[NodeId] {
        Dlt::nodes_for(self, token)
    }

    fn set_node(&mut self, token: Token, rank: usize, node: NodeId) -> Result<()> {
        Dlt::set_node(self, token, rank, node)
    }
}

/// Checks the trailing crc32c of `serialized`, which must hold at least `min_size` bytes of
/// payload before the checksum.
pub(crate) fn verify_checksum(serialized: &Bytes, min_size: usize) -> Result<()> {
    if serialized.len() < min_size + CHECKSUM_SIZE {
        return Err(Error::Serialization {
            reason: format!(
                "buffer is too small. Expected at least {} bytes, got {}",
                min_size + CHECKSUM_SIZE,
                serialized.len()
            ),
        });
    }

    let (payload, mut checksum) = serialized.split_at(serialized.len() - CHECKSUM_SIZE);
    let expected = checksum.get_u32();
    let actual = crc32c::crc32c(payload);
    if expected != actual {
        return Err(Error::Serialization {
            reason: format!(
                "checksum mismatch. Expected {:#x}, got {:#x}",
                expected, actual
            ),
        });
    }

    Ok(())
}
