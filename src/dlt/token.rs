//! Token arithmetic.
//!
//! Object ids live in a 128 bit space. A table with `width` bits splits that space into
//! `2^width` contiguous ranges (tokens) by looking at the top `width` bits of an id.
//! Everything in here is pure and seedless so that every node (and every restart of the
//! same node) computes the same token for the same object.
use std::io::Cursor;

use murmur3::murmur3_x86_128;
use serde::{Deserialize, Serialize};

/// A token is the unit of placement: one shard of the object id space.
pub type Token = u32;

/// Upper bound on the number of bits a token can have.
pub const MAX_TOKEN_BITS: u32 = 24;

const OBJECT_ID_BITS: u32 = u128::BITS;

/// 128 bit identifier of an object stored in the cluster
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId(pub u128);

impl ObjectId {
    /// Derives the [`ObjectId`] of an arbitrary key (eg: an object name)
    pub fn from_key(key: &[u8]) -> Self {
        Self(murmur3_hash(key))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Returns the token that owns `object_id` in a table with `width` bits
pub fn token_of(object_id: ObjectId, width: u32) -> Token {
    assert!(
        width <= MAX_TOKEN_BITS,
        "token width {} is above the max of {}",
        width,
        MAX_TOKEN_BITS
    );
    if width == 0 {
        return 0;
    }

    (object_id.0 >> (OBJECT_ID_BITS - width)) as Token
}

/// Hashes `key` into an [`ObjectId`] and returns its token
pub fn token_of_key(key: &[u8], width: u32) -> Token {
    token_of(ObjectId::from_key(key), width)
}

/// Returns the inclusive range `[low, high]` of object ids owned by `token`
pub fn token_range(token: Token, width: u32) -> (ObjectId, ObjectId) {
    assert!(
        width <= MAX_TOKEN_BITS,
        "token width {} is above the max of {}",
        width,
        MAX_TOKEN_BITS
    );
    if width == 0 {
        return (ObjectId(0), ObjectId(u128::MAX));
    }

    assert!(
        (token as u64) < (1u64 << width),
        "token {} does not fit in {} bits",
        token,
        width
    );
    let shift = OBJECT_ID_BITS - width;
    let low = (token as u128) << shift;
    let high = low | ((1u128 << shift) - 1);
    (ObjectId(low), ObjectId(high))
}

/// murmur3 x86_128 with a fixed seed of 0
pub fn murmur3_hash(key: &[u8]) -> u128 {
    // reading from an in-memory cursor can't fail
    murmur3_x86_128(&mut Cursor::new(key), 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::{token_of, token_of_key, token_range, ObjectId, MAX_TOKEN_BITS};

    #[test]
    fn test_token_of_uses_top_bits() {
        let oid = ObjectId(0xABCDu128 << 112);
        assert_eq!(token_of(oid, 4), 0xA);
        assert_eq!(token_of(oid, 8), 0xAB);
        assert_eq!(token_of(oid, 16), 0xABCD);
        assert_eq!(token_of(oid, 0), 0);
    }

    #[test]
    fn test_token_of_key_is_stable() {
        // same input, same output - no random seeding anywhere
        for width in 0..=MAX_TOKEN_BITS {
            assert_eq!(token_of_key(b"foo", width), token_of_key(b"foo", width));
        }
        assert_eq!(ObjectId::from_key(b"bar"), ObjectId::from_key(b"bar"));
        assert_ne!(ObjectId::from_key(b"bar"), ObjectId::from_key(b"baz"));
    }

    #[test]
    fn test_token_range_edges() {
        let (low, high) = token_range(0, 4);
        assert_eq!(low, ObjectId(0));
        assert_eq!(high, ObjectId((1u128 << 124) - 1));

        let (low, high) = token_range(15, 4);
        assert_eq!(low, ObjectId(15u128 << 124));
        assert_eq!(high, ObjectId(u128::MAX));

        let (low, high) = token_range(0, 0);
        assert_eq!(low, ObjectId(0));
        assert_eq!(high, ObjectId(u128::MAX));
    }

    #[test]
    #[should_panic]
    fn test_token_range_out_of_bounds() {
        token_range(16, 4);
    }

    #[quickcheck]
    fn prop_object_id_falls_in_its_token_range(raw: u128, width: u8) -> bool {
        let width = width as u32 % (MAX_TOKEN_BITS + 1);
        let oid = ObjectId(raw);
        let token = token_of(oid, width);
        let (low, high) = token_range(token, width);
        low <= oid && oid <= high
    }
}
