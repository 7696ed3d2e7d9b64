//! This module defines the errors that can be returned by the placement core.
//!
//! Only environmental conditions are surfaced as [`Error`]s. Structural invariant violations
//! (a row with a duplicated node after a placement pass, mismatched table shapes) are bugs
//! and panic instead.

use std::fmt::Display;

use serde::Serialize;

use crate::dlt::{NodeId, Token};

pub type Result<T> = std::result::Result<T, Error>;

/// Error enum with all possible variants
#[derive(Debug, Serialize)]
pub enum Error {
    /// The request can't be honored given the provided inputs (eg: a token would be left
    /// without any surviving primary)
    InvalidArgument {
        reason: String,
    },
    /// Not enough live nodes to fill every replica slot
    InsufficientCapacity {
        required: usize,
        available: usize,
    },
    InvalidVersion {
        version: u64,
        reason: String,
    },
    NotFound {
        reason: String,
    },
    InvalidRank {
        rank: usize,
        depth: usize,
    },
    DuplicateInColumn {
        token: Token,
        node: NodeId,
    },
    UnexpectedNode {
        token: Token,
        node: NodeId,
    },
    IncompleteRow {
        token: Token,
    },
    Serialization {
        reason: String,
    },
    InvalidConfig {
        reason: String,
    },
    Logic {
        reason: String,
    },
    Io {
        reason: String,
    },
}

impl Error {
    /// Returns true if this is an instance of a [`Error::NotFound`] variant
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true if this is an instance of a [`Error::InvalidArgument`] variant
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument { .. })
    }

    /// Returns true if this is an instance of a [`Error::InsufficientCapacity`] variant
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Error::InsufficientCapacity { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig {
            reason: err.to_string(),
        }
    }
}
