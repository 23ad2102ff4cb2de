// SPDX-License-Identifier: CC0-1.0

//! # AuxPoW Consensus
//!
//! Consensus core for a merge-mined, Bitcoin-derived proof-of-work chain.
//! The crate covers exactly the rules a validator cannot disagree on
//! without forking:
//!
//! * the 80-byte block header, its chain-ID / auxpow version bitfield, and
//!   the optional merged-mining payload that follows it on the wire;
//! * structural verification of auxiliary proofs of work, where a parent
//!   chain's coinbase commits to this chain's block hash;
//! * the difficulty engine with both retarget algorithms and the
//!   height-gated emergency rules of the chain's history;
//! * the proof-of-work predicate, which for merge-mined blocks measures
//!   the *parent* header's hash against the child's target.
//!
//! Transaction validation, the UTXO set, networking, storage and wallets
//! live elsewhere; transactions appear here only as opaque participants of
//! merkle trees. Everything is deterministic and free of I/O, so the same
//! inputs produce the same answers on every machine.
//!
//! ```
//! use auxpow_consensus::{AuxPow, Params, PureHeader, Version};
//! use auxpow_consensus::{BlockHash, CompactTarget, TxMerkleNode};
//! use auxpow_consensus::hashes::Hash;
//!
//! let mut params = Params::MAINNET.clone();
//! params.strict_chain_id = false;
//!
//! let child = PureHeader {
//!     version: Version::from_parts(4, 42).with_auxpow(true),
//!     prev_blockhash: BlockHash::all_zeros(),
//!     merkle_root: TxMerkleNode::all_zeros(),
//!     time: 1_700_000_000,
//!     bits: CompactTarget::from_consensus(0x207fffff),
//!     nonce: 0,
//! };
//!
//! let auxpow = AuxPow::create(&child);
//! assert!(auxpow.check(child.block_hash(), 42, &params).is_ok());
//! ```

#![warn(missing_docs)]

pub mod auxpow;
pub mod blockdata;
pub mod chain;
pub mod consensus;
pub mod hash_types;
pub mod merkle_tree;
pub mod miner;
pub mod pow;
pub mod spacing;

mod internal_macros;

pub use hashes;

pub use crate::auxpow::{AuxPow, AuxPowError, MERGED_MINING_MAGIC};
pub use crate::blockdata::block::{Block, Header, PureHeader, ValidationError, Version};
pub use crate::blockdata::script::ScriptBuf;
pub use crate::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
pub use crate::chain::ChainIndex;
pub use crate::consensus::params::{Network, Params};
pub use crate::hash_types::{BlockHash, TxMerkleNode, Txid};
pub use crate::miner::{AuxBlock, AuxpowMiner, TemplateSource};
pub use crate::pow::{
    check_proof_of_work, next_work_required, permitted_difficulty_transition, CompactTarget,
    Target,
};
