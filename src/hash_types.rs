// SPDX-License-Identifier: CC0-1.0

//! Consensus hash types.
//!
//! All of these wrap a double-SHA256 digest. On the wire they are
//! little-endian byte arrays; their `Display` form is the conventional
//! reversed (big-endian) hex string.

use hashes::{hash_newtype, sha256d};

use crate::internal_macros::impl_hashencode;

hash_newtype! {
    /// A block's identifying hash, computed over the pure 80-byte header only.
    pub struct BlockHash(sha256d::Hash);
    /// A transaction's identifying hash.
    pub struct Txid(sha256d::Hash);
    /// A node in a merkle tree of transactions or of auxiliary chain roots.
    pub struct TxMerkleNode(sha256d::Hash);
}

impl_hashencode!(BlockHash);
impl_hashencode!(Txid);
impl_hashencode!(TxMerkleNode);
