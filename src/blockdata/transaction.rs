// SPDX-License-Identifier: CC0-1.0

//! Transactions.
//!
//! The consensus core only ever handles whole transactions as opaque
//! participants of merkle trees, plus the coinbase special case, so the
//! model here is the plain pre-segwit wire form.

use core::fmt;

use hashes::Hash;

use crate::blockdata::script::ScriptBuf;
use crate::hash_types::Txid;
use crate::internal_macros::impl_consensus_encoding;

/// A reference to a transaction output.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutPoint {
    /// The referenced transaction's txid.
    pub txid: Txid,
    /// The index of the referenced output in its transaction's vout.
    pub vout: u32,
}

impl OutPoint {
    /// Creates a "null" `OutPoint`, the value coinbase inputs carry since
    /// they do not spend a previous output.
    pub fn null() -> OutPoint {
        OutPoint { txid: Txid::all_zeros(), vout: u32::MAX }
    }

    /// Checks if an `OutPoint` is "null".
    pub fn is_null(&self) -> bool { *self == OutPoint::null() }
}

impl Default for OutPoint {
    fn default() -> Self { OutPoint::null() }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl_consensus_encoding!(OutPoint, txid, vout);

/// The sequence number carried by inputs that opt out of every
/// sequence-based feature.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// A transaction input.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TxIn {
    /// The reference to the previous output being spent.
    pub previous_output: OutPoint,
    /// The script that satisfies the spending conditions; for a coinbase
    /// this is arbitrary data chosen by the miner.
    pub script_sig: ScriptBuf,
    /// The sequence number.
    pub sequence: u32,
}

impl_consensus_encoding!(TxIn, previous_output, script_sig, sequence);

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TxOut {
    /// The value of the output, in satoshis.
    pub value: u64,
    /// The script locking the output.
    pub script_pubkey: ScriptBuf,
}

impl_consensus_encoding!(TxOut, value, script_pubkey);

/// A transaction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transaction {
    /// The protocol version.
    pub version: i32,
    /// List of inputs.
    pub input: Vec<TxIn>,
    /// List of outputs.
    pub output: Vec<TxOut>,
    /// Earliest block height or time the transaction may be included at.
    pub lock_time: u32,
}

impl_consensus_encoding!(Transaction, version, input, output, lock_time);

impl Transaction {
    /// Computes the transaction's identifying hash.
    pub fn txid(&self) -> Txid {
        use crate::consensus::Encodable;

        let mut engine = Txid::engine();
        self.consensus_encode(&mut engine).expect("engines don't error");
        Txid::from_engine(engine)
    }

    /// Whether this is a coinbase transaction: a single input spending the
    /// null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.input.len() == 1 && self.input[0].previous_output.is_null()
    }
}
