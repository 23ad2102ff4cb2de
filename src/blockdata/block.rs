// SPDX-License-Identifier: CC0-1.0

//! Block headers and blocks.
//!
//! A header comes in two shapes. [`PureHeader`] is the 80-byte header the
//! proof-of-work is computed over; [`Header`] is the same fields plus an
//! optional merged-mining payload that follows on the wire when the
//! version's auxpow flag is set. The payload never contributes to the
//! block's identifying hash.

use core::fmt;
use std::io::{self, Read, Write};

use hashes::Hash;

use crate::auxpow::{AuxPow, AuxPowError};
use crate::consensus::encode::{self, Decodable, Encodable, MAX_VEC_SIZE};
use crate::consensus::Params;
use crate::blockdata::transaction::Transaction;
use crate::hash_types::{BlockHash, TxMerkleNode};
use crate::internal_macros::impl_consensus_encoding;
use crate::merkle_tree;
use crate::pow::{self, CompactTarget, Target};

/// A block version with the chain-ID / auxpow bitfield layout.
///
/// The low 8 bits carry the base version, bit 8 flags a merge-mined
/// header, and the high 16 bits carry the chain's identifier in the
/// merged-mining tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version(i32);

impl Version {
    /// Bit flagging a merge-mined header.
    const AUXPOW_FLAG: i32 = 1 << 8;
    /// First version bit belonging to the chain ID.
    const CHAIN_START: i32 = 1 << 16;

    /// Creates a [`Version`] from its consensus-encoded `i32`.
    pub fn from_consensus(v: i32) -> Self { Version(v) }

    /// Returns the consensus-encoded `i32` representation.
    pub fn to_consensus(self) -> i32 { self.0 }

    /// Builds a version from a base version and a chain ID, with the
    /// auxpow flag clear.
    pub fn from_parts(base: i32, chain_id: i32) -> Self {
        Version(base | chain_id * Self::CHAIN_START)
    }

    /// The base version in the low 8 bits.
    pub fn base_version(self) -> i32 { self.0 % Self::AUXPOW_FLAG }

    /// The chain ID in the high 16 bits.
    pub fn chain_id(self) -> i32 { self.0 / Self::CHAIN_START }

    /// Whether the auxpow flag is set.
    pub fn is_auxpow(self) -> bool { self.0 & Self::AUXPOW_FLAG != 0 }

    /// Whether this is a legacy version-1 header from before the version
    /// field was split into bitfields.
    pub fn is_legacy(self) -> bool { self.0 == 1 }

    /// Returns the version with the auxpow flag set or cleared, leaving
    /// the other fields untouched.
    pub fn with_auxpow(self, auxpow: bool) -> Version {
        if auxpow {
            Version(self.0 | Self::AUXPOW_FLAG)
        } else {
            Version(self.0 & !Self::AUXPOW_FLAG)
        }
    }

    /// Returns the version with the chain ID replaced, leaving the base
    /// version and flags untouched.
    pub fn with_chain_id(self, chain_id: i32) -> Version {
        Version(self.0 % Self::CHAIN_START | chain_id * Self::CHAIN_START)
    }
}

impl Encodable for Version {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for Version {
    #[inline]
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        i32::consensus_decode(r).map(Version)
    }
}

/// The 80-byte block header the proof-of-work commits to.
///
/// For a merge-mined block this is also the shape of the *parent* chain's
/// header embedded in the payload, which is why it exists separately from
/// [`Header`]: the parent must not recursively carry a payload of its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PureHeader {
    /// The protocol version with the chain-ID / auxpow bitfields.
    pub version: Version,
    /// Reference to the previous block in the chain.
    pub prev_blockhash: BlockHash,
    /// The root hash of the merkle tree of transactions in the block.
    pub merkle_root: TxMerkleNode,
    /// The timestamp of the block, as claimed by the miner.
    pub time: u32,
    /// The target value below which the proof-of-work hash must lie.
    pub bits: CompactTarget,
    /// The nonce, selected to obtain a low enough hash.
    pub nonce: u32,
}

impl_consensus_encoding!(PureHeader, version, prev_blockhash, merkle_root, time, bits, nonce);

impl PureHeader {
    /// Returns the block hash: double SHA-256 over exactly these 80 bytes.
    pub fn block_hash(&self) -> BlockHash {
        let mut engine = BlockHash::engine();
        self.consensus_encode(&mut engine).expect("engines don't error");
        BlockHash::from_engine(engine)
    }

    /// Computes the target this header declares.
    pub fn target(&self) -> Target { Target::from_compact(self.bits) }
}

/// A full block header: the pure header plus the optional merged-mining
/// payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Header {
    /// The protocol version with the chain-ID / auxpow bitfields.
    pub version: Version,
    /// Reference to the previous block in the chain.
    pub prev_blockhash: BlockHash,
    /// The root hash of the merkle tree of transactions in the block.
    pub merkle_root: TxMerkleNode,
    /// The timestamp of the block, as claimed by the miner.
    pub time: u32,
    /// The target value below which the proof-of-work hash must lie.
    pub bits: CompactTarget,
    /// The nonce of the child header; unused when merge-mined.
    pub nonce: u32,
    /// The auxiliary proof-of-work, present when the version flags it.
    pub auxpow: Option<AuxPow>,
}

impl Header {
    /// Copies the header's pure 80-byte part.
    pub fn pure_header(&self) -> PureHeader {
        PureHeader {
            version: self.version,
            prev_blockhash: self.prev_blockhash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// Returns the block hash.
    ///
    /// The hash covers only the pure 80 bytes; the auxpow payload never
    /// affects a block's identity.
    pub fn block_hash(&self) -> BlockHash { self.pure_header().block_hash() }

    /// Computes the target this header declares.
    pub fn target(&self) -> Target { Target::from_compact(self.bits) }

    /// Whether the wire format carries an auxpow payload for this header.
    ///
    /// The flag alone is not enough: chain ID zero predates merged mining
    /// and IDs of 0x100 and above never circulated, so both serialize as a
    /// bare header.
    pub fn expects_auxpow(&self) -> bool {
        let chain_id = self.version.chain_id();
        self.version.is_auxpow() && chain_id > 0 && chain_id < 0x100
    }

    /// Validates the header's proof of work, returning the block hash.
    ///
    /// For merge-mined headers the auxiliary proof is checked structurally
    /// and the *parent* header's hash is measured against the child's
    /// declared target.
    pub fn validate_pow(&self, params: &Params) -> Result<BlockHash, ValidationError> {
        let (target, negative, overflow) = Target::from_compact_with_flags(self.bits);
        if negative || overflow || target == Target::ZERO || target > params.pow_limit {
            return Err(ValidationError::BadTarget);
        }

        let block_hash = self.block_hash();
        let pow_hash = if self.version.is_auxpow() {
            let auxpow = self.auxpow.as_ref().ok_or(ValidationError::MissingAuxPow)?;
            auxpow.check(block_hash, self.version.chain_id(), params)?;
            auxpow.parent_block.block_hash()
        } else {
            block_hash
        };

        if target.is_met_by(pow_hash) {
            Ok(block_hash)
        } else {
            Err(ValidationError::BadProofOfWork)
        }
    }

    /// Checks this header's declared target against its predecessor's
    /// under the permitted-transition rules. `height` is this header's.
    pub fn validate_difficulty_transition(
        &self,
        params: &Params,
        height: u32,
        prev_bits: CompactTarget,
    ) -> Result<(), ValidationError> {
        if pow::permitted_difficulty_transition(params, height, prev_bits, self.bits) {
            Ok(())
        } else {
            Err(ValidationError::BadDifficultyTransition)
        }
    }
}

impl From<PureHeader> for Header {
    fn from(pure: PureHeader) -> Self {
        Header {
            version: pure.version,
            prev_blockhash: pure.prev_blockhash,
            merkle_root: pure.merkle_root,
            time: pure.time,
            bits: pure.bits,
            nonce: pure.nonce,
            auxpow: None,
        }
    }
}

impl From<Header> for PureHeader {
    fn from(header: Header) -> Self { header.pure_header() }
}

impl Encodable for Header {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.version.consensus_encode(w)?;
        len += self.prev_blockhash.consensus_encode(w)?;
        len += self.merkle_root.consensus_encode(w)?;
        len += self.time.consensus_encode(w)?;
        len += self.bits.consensus_encode(w)?;
        len += self.nonce.consensus_encode(w)?;
        // A flagged header without a payload still encodes; the bytes are
        // rejected on re-parse but are needed to exercise exactly that.
        if self.expects_auxpow() {
            if let Some(ref auxpow) = self.auxpow {
                len += auxpow.consensus_encode(w)?;
            }
        }
        Ok(len)
    }
}

impl Decodable for Header {
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        let mut header: Header = PureHeader::consensus_decode_from_finite_reader(r)?.into();
        if header.expects_auxpow() {
            header.auxpow = Some(decode_auxpow_payload(r, true)?);
        }
        Ok(header)
    }

    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let mut r = Read::take(r, MAX_VEC_SIZE as u64);
        let mut header: Header = PureHeader::consensus_decode(&mut r)?.into();
        if header.expects_auxpow() {
            header.auxpow = Some(decode_auxpow_payload(&mut r, false)?);
        }
        Ok(header)
    }
}

/// Decodes the payload that must follow a flagged header, turning a
/// truncated stream into the dedicated malformed-header error.
fn decode_auxpow_payload<R: Read + ?Sized>(
    r: &mut R,
    finite: bool,
) -> Result<AuxPow, encode::Error> {
    let result =
        if finite { AuxPow::consensus_decode_from_finite_reader(r) } else { AuxPow::consensus_decode(r) };
    match result {
        Ok(auxpow) => Ok(auxpow),
        Err(encode::Error::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(encode::Error::MalformedHeader)
        }
        Err(e) => Err(e),
    }
}

/// A block: a full header and the transactions it commits to.
///
/// The first transaction is the block's own coinbase. For a merge-mined
/// block this is distinct from the *parent chain's* coinbase carried
/// inside the header's payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// List of transactions contained in the block.
    pub txdata: Vec<Transaction>,
}

impl_consensus_encoding!(Block, header, txdata);

impl Block {
    /// Returns the block hash.
    pub fn block_hash(&self) -> BlockHash { self.header.block_hash() }

    /// Returns the block's own coinbase transaction, if present.
    pub fn coinbase(&self) -> Option<&Transaction> { self.txdata.first() }

    /// Calculates the merkle root of the transaction list.
    pub fn compute_merkle_root(&self) -> Option<TxMerkleNode> {
        merkle_tree::calculate_root(self.txdata.iter().map(|tx| tx.txid()))
    }

    /// Checks that the header's merkle root commits to the transaction
    /// list.
    pub fn check_merkle_root(&self) -> bool {
        match self.compute_merkle_root() {
            Some(root) => self.header.merkle_root == root,
            None => false,
        }
    }
}

/// A block validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The compact target is negative, zero, overflowing, or above the
    /// network limit.
    BadTarget,
    /// The proof-of-work hash is above the declared target.
    BadProofOfWork,
    /// The declared target moved further from its predecessor than
    /// consensus allows.
    BadDifficultyTransition,
    /// The version flags merged mining but the header carries no payload.
    MissingAuxPow,
    /// The merged-mining payload failed a structural check.
    AuxPow(AuxPowError),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ValidationError::BadTarget => write!(f, "block target is invalid"),
            ValidationError::BadProofOfWork => write!(f, "block target not met"),
            ValidationError::BadDifficultyTransition => {
                write!(f, "difficulty transition exceeds the permitted bounds")
            }
            ValidationError::MissingAuxPow => {
                write!(f, "header flags merged mining but carries no auxpow")
            }
            ValidationError::AuxPow(ref e) => write!(f, "invalid auxpow: {}", e),
        }
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            ValidationError::AuxPow(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<AuxPowError> for ValidationError {
    fn from(e: AuxPowError) -> Self { ValidationError::AuxPow(e) }
}
