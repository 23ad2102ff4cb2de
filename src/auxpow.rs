// SPDX-License-Identifier: CC0-1.0

//! Merged-mining auxiliary proof-of-work.
//!
//! A merge-mined block does not satisfy its own proof of work. Instead it
//! carries an [`AuxPow`] payload proving that a *parent chain's* block,
//! which does satisfy the work, committed to this block's hash inside its
//! coinbase transaction. Verification is purely structural: two merkle
//! branches, a byte-pattern search through the parent coinbase script, and
//! the lane assignment that stops one parent from claiming several slots
//! for the same chain.

use core::fmt;
use std::io::{self, Read, Write};

use hashes::Hash;

use crate::blockdata::block::{Header, PureHeader, Version};
use crate::blockdata::script::ScriptBuf;
use crate::blockdata::transaction::{OutPoint, Transaction, TxIn, SEQUENCE_FINAL};
use crate::consensus::encode::{self, Decodable, Encodable, MAX_VEC_SIZE};
use crate::consensus::Params;
use crate::hash_types::{BlockHash, TxMerkleNode};
use crate::merkle_tree;
use crate::pow::CompactTarget;

/// Byte sequence identifying merged-mining data inside a parent coinbase
/// script.
pub const MERGED_MINING_MAGIC: [u8; 4] = [0xfa, 0xbe, b'm', b'm'];

/// Longest chain merkle branch a payload may carry.
const MAX_CHAIN_BRANCH_LENGTH: usize = 30;

/// An auxiliary proof-of-work payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AuxPow {
    /// The parent chain's coinbase transaction.
    pub coinbase_tx: Transaction,
    /// Merkle branch proving the coinbase sits at index 0 of the parent
    /// block's transaction tree.
    pub coinbase_branch: Vec<TxMerkleNode>,
    /// Merkle branch proving this chain's root in the tree of auxiliary
    /// chains committed to by the parent coinbase.
    pub chain_branch: Vec<TxMerkleNode>,
    /// This chain's position in the auxiliary tree.
    pub chain_index: i32,
    /// The parent chain's header, which performs the actual proof of work.
    pub parent_block: PureHeader,
}

/// Reasons an auxiliary proof-of-work fails its structural checks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuxPowError {
    /// The parent block carries our own chain ID under strict mode.
    WrongChainId,
    /// The chain merkle branch exceeds the permitted depth.
    BranchTooLong,
    /// The coinbase branch does not fold to the parent's merkle root.
    MerkleRootMismatch,
    /// The parent coinbase transaction has no inputs.
    EmptyCoinbase,
    /// The chain merkle root was not found in the parent coinbase script.
    MissingChainRoot,
    /// More than one merged-mining magic in the parent coinbase script.
    DuplicateMagic,
    /// The merged-mining magic is present but not immediately before the
    /// chain merkle root.
    MagicNotBeforeRoot,
    /// Without a magic, the chain merkle root must sit in the first bytes
    /// of the script.
    RootNotInPrefix,
    /// Fewer than eight script bytes follow the chain merkle root.
    MissingSizeAndNonce,
    /// The declared tree size does not match the branch length.
    WrongMerkleSize,
    /// The chain index does not match the nonce-derived lane.
    WrongIndex,
}

impl fmt::Display for AuxPowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AuxPowError::WrongChainId => write!(f, "aux pow parent has our chain ID"),
            AuxPowError::BranchTooLong => write!(f, "aux pow chain merkle branch too long"),
            AuxPowError::MerkleRootMismatch => write!(f, "aux pow merkle root incorrect"),
            AuxPowError::EmptyCoinbase => write!(f, "aux pow coinbase has no inputs"),
            AuxPowError::MissingChainRoot => {
                write!(f, "aux pow missing chain merkle root in parent coinbase")
            }
            AuxPowError::DuplicateMagic => {
                write!(f, "multiple merged mining magics in parent coinbase")
            }
            AuxPowError::MagicNotBeforeRoot => {
                write!(f, "merged mining magic is not just before chain merkle root")
            }
            AuxPowError::RootNotInPrefix => {
                write!(f, "chain merkle root must start in the first 20 bytes of the parent coinbase")
            }
            AuxPowError::MissingSizeAndNonce => {
                write!(f, "aux pow missing chain merkle tree size and nonce in parent coinbase")
            }
            AuxPowError::WrongMerkleSize => {
                write!(f, "aux pow merkle branch size does not match parent coinbase")
            }
            AuxPowError::WrongIndex => write!(f, "aux pow wrong index"),
        }
    }
}

impl std::error::Error for AuxPowError {}

impl AuxPow {
    /// Verifies the payload against the child block's hash and chain ID.
    ///
    /// This is the structural half of merge-mined validation; whether the
    /// parent header's hash actually meets the child's target is checked
    /// separately by the proof-of-work predicate.
    pub fn check(
        &self,
        aux_hash: BlockHash,
        chain_id: i32,
        params: &Params,
    ) -> Result<(), AuxPowError> {
        if params.strict_chain_id && self.parent_block.version.chain_id() == chain_id {
            return Err(AuxPowError::WrongChainId);
        }

        if self.chain_branch.len() > MAX_CHAIN_BRANCH_LENGTH {
            return Err(AuxPowError::BranchTooLong);
        }

        // The root is committed big-endian inside the script while hashes
        // serialize little-endian, so reverse before searching.
        let root_hash =
            merkle_tree::fold_branch(aux_hash.to_raw_hash(), &self.chain_branch, self.chain_index);
        let mut root_bytes = root_hash.to_byte_array();
        root_bytes.reverse();

        let coinbase_hash = self.coinbase_tx.txid().to_raw_hash();
        if merkle_tree::fold_branch(coinbase_hash, &self.coinbase_branch, 0)
            != self.parent_block.merkle_root.to_raw_hash()
        {
            return Err(AuxPowError::MerkleRootMismatch);
        }

        if self.coinbase_tx.input.is_empty() {
            return Err(AuxPowError::EmptyCoinbase);
        }

        let script = self.coinbase_tx.input[0].script_sig.as_bytes();

        let magic_pos = find(script, &MERGED_MINING_MAGIC);
        let root_pos = match find(script, &root_bytes) {
            Some(pos) => pos,
            None => return Err(AuxPowError::MissingChainRoot),
        };

        match magic_pos {
            Some(magic) => {
                if find(&script[magic + 1..], &MERGED_MINING_MAGIC).is_some() {
                    return Err(AuxPowError::DuplicateMagic);
                }
                if magic + MERGED_MINING_MAGIC.len() != root_pos {
                    return Err(AuxPowError::MagicNotBeforeRoot);
                }
            }
            None => {
                // Without the magic the root must sit close to the script
                // start, where old miners placed it.
                if root_pos > 20 {
                    return Err(AuxPowError::RootNotInPrefix);
                }
            }
        }

        let tail = &script[root_pos + root_bytes.len()..];
        if tail.len() < 8 {
            return Err(AuxPowError::MissingSizeAndNonce);
        }

        let merkle_height = self.chain_branch.len() as u32;
        let size = read_le32(&tail[0..4]);
        if size != 1 << merkle_height {
            return Err(AuxPowError::WrongMerkleSize);
        }

        let nonce = read_le32(&tail[4..8]);
        if self.chain_index != Self::expected_index(nonce, chain_id, merkle_height) {
            return Err(AuxPowError::WrongIndex);
        }

        Ok(())
    }

    /// Computes the slot a chain is assigned in a parent's auxiliary tree.
    ///
    /// The linear-congruential mix keeps a parent from proving the same
    /// child chain in two different slots of one tree. `merkle_height`
    /// must be at most 30.
    pub fn expected_index(nonce: u32, chain_id: i32, merkle_height: u32) -> i32 {
        let mut rand = nonce;
        rand = rand.wrapping_mul(1103515245).wrapping_add(12345);
        rand = rand.wrapping_add(chain_id as u32);
        rand = rand.wrapping_mul(1103515245).wrapping_add(12345);
        (rand % (1 << merkle_height)) as i32
    }

    /// Hash of the parent block that performs the actual proof of work.
    pub fn parent_block_hash(&self) -> BlockHash { self.parent_block.block_hash() }

    /// Builds the minimal payload proving `header` in a synthetic parent.
    ///
    /// The parent consists of a single coinbase whose script commits to
    /// the child hash directly (tree of size one, zero nonce). Grinding
    /// the parent's own nonce is left to the caller.
    ///
    /// # Panics
    ///
    /// If `header` does not carry the auxpow version flag.
    pub fn create(header: &PureHeader) -> AuxPow {
        assert!(header.version.is_auxpow(), "header must carry the auxpow version flag");

        let mut input_data = header.block_hash().to_byte_array().to_vec();
        input_data.reverse();
        input_data.push(1);
        input_data.extend_from_slice(&[0u8; 7]);

        let mut script_sig = ScriptBuf::new();
        script_sig.push_slice(&input_data);

        let coinbase = Transaction {
            version: 1,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            output: vec![],
            lock_time: 0,
        };

        let parent_block = PureHeader {
            version: Version::from_consensus(1),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::from_raw_hash(coinbase.txid().to_raw_hash()),
            time: 0,
            bits: CompactTarget::from_consensus(0),
            nonce: 0,
        };

        AuxPow {
            coinbase_tx: coinbase,
            coinbase_branch: Vec::new(),
            chain_branch: Vec::new(),
            chain_index: 0,
            parent_block,
        }
    }

    /// Initialises the auxpow of the given block header: sets the version
    /// flag, installs a minimal payload, and returns a mutable reference
    /// to the parent header so it can be mined as a follow-up.
    pub fn init(header: &mut Header) -> &mut PureHeader {
        header.version = header.version.with_auxpow(true);
        let auxpow = AuxPow::create(&header.pure_header());
        header.auxpow = Some(auxpow);
        &mut header.auxpow.as_mut().expect("auxpow was just attached").parent_block
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn read_le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// The wire format keeps two reserved fields of the historical payload
// layout: a 32-byte parent-hash slot and a 4-byte branch-index slot. Both
// are written as zeros and ignored on read; do not re-purpose them.

impl Encodable for AuxPow {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.coinbase_tx.consensus_encode(w)?;
        len += [0u8; 32].consensus_encode(w)?;
        len += self.coinbase_branch.consensus_encode(w)?;
        len += 0i32.consensus_encode(w)?;
        len += self.chain_branch.consensus_encode(w)?;
        len += self.chain_index.consensus_encode(w)?;
        len += self.parent_block.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for AuxPow {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        let coinbase_tx = Decodable::consensus_decode_from_finite_reader(r)?;
        let _parent_hash_slot = <[u8; 32]>::consensus_decode(r)?;
        let coinbase_branch = Decodable::consensus_decode_from_finite_reader(r)?;
        let _index_slot = i32::consensus_decode(r)?;
        let chain_branch = Decodable::consensus_decode_from_finite_reader(r)?;
        let chain_index = i32::consensus_decode(r)?;
        let parent_block = Decodable::consensus_decode_from_finite_reader(r)?;
        Ok(AuxPow { coinbase_tx, coinbase_branch, chain_branch, chain_index, parent_block })
    }

    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let mut r = Read::take(r, MAX_VEC_SIZE as u64);
        Self::consensus_decode_from_finite_reader(&mut r)
    }
}
