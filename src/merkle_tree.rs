// SPDX-License-Identifier: CC0-1.0

//! Merkle tree functions.
//!
//! Both the transaction tree of a block and the tree of auxiliary chain
//! roots in a merged-mining coinbase use the same double-SHA256 pairwise
//! construction, so both are served by this module.

use hashes::{sha256d, Hash, HashEngine};

use crate::hash_types::{TxMerkleNode, Txid};

/// Folds a leaf hash up a merkle branch towards the root.
///
/// `index` is the leaf's position in the tree; its low bit selects on each
/// level whether the sibling is hashed on the left or the right. An index
/// of `-1` is the conventional "no position" value and yields the all-zero
/// sentinel. An empty branch returns the leaf unchanged.
pub fn fold_branch(leaf: sha256d::Hash, branch: &[TxMerkleNode], mut index: i32) -> sha256d::Hash {
    if index == -1 {
        return sha256d::Hash::all_zeros();
    }

    let mut hash = leaf;
    for node in branch {
        let mut engine = sha256d::Hash::engine();
        if index & 1 == 1 {
            engine.input(node.as_byte_array());
            engine.input(hash.as_byte_array());
        } else {
            engine.input(hash.as_byte_array());
            engine.input(node.as_byte_array());
        }
        hash = sha256d::Hash::from_engine(engine);
        index >>= 1;
    }
    hash
}

/// Calculates the merkle root of an iterator of transaction ids.
///
/// Returns `None` for an empty iterator; the root of an empty tree is
/// undefined. A single hash is by definition its own root. Levels with an
/// odd number of nodes hash their last node with itself.
pub fn calculate_root<I: Iterator<Item = Txid>>(hashes: I) -> Option<TxMerkleNode> {
    let mut nodes: Vec<sha256d::Hash> = hashes.map(|txid| txid.to_raw_hash()).collect();
    if nodes.is_empty() {
        return None;
    }

    while nodes.len() > 1 {
        nodes = nodes
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = *pair.last().expect("chunks are non-empty");
                let mut engine = sha256d::Hash::engine();
                engine.input(left.as_byte_array());
                engine.input(right.as_byte_array());
                sha256d::Hash::from_engine(engine)
            })
            .collect();
    }
    Some(TxMerkleNode::from_raw_hash(nodes[0]))
}
