// SPDX-License-Identifier: CC0-1.0

//! Script bytes.
//!
//! The consensus core never interprets scripts; a coinbase script is only
//! ever searched for byte patterns and built from data pushes. This type is
//! therefore a thin owned byte buffer with a push-only builder.

use core::fmt;
use std::io::{self, Read, Write};

use hex::DisplayHex;

use crate::consensus::encode::{self, Decodable, Encodable};

/// An owned script.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScriptBuf(Vec<u8>);

impl ScriptBuf {
    /// Creates a new empty script.
    pub fn new() -> Self { ScriptBuf(Vec::new()) }

    /// Creates a script from raw bytes, without any checks.
    pub fn from_bytes(bytes: Vec<u8>) -> Self { ScriptBuf(bytes) }

    /// Returns the script bytes.
    pub fn as_bytes(&self) -> &[u8] { &self.0 }

    /// Converts the script into its raw bytes.
    pub fn into_bytes(self) -> Vec<u8> { self.0 }

    /// The length in bytes of the script.
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether the script is empty.
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Appends a minimal data push of `data` to the script.
    pub fn push_slice(&mut self, data: &[u8]) {
        match data.len() {
            n if n < 0x4c => {
                self.0.push(n as u8);
            }
            n if n <= 0xff => {
                self.0.push(0x4c); // OP_PUSHDATA1
                self.0.push(n as u8);
            }
            n if n <= 0xffff => {
                self.0.push(0x4d); // OP_PUSHDATA2
                self.0.extend_from_slice(&(n as u16).to_le_bytes());
            }
            n => {
                self.0.push(0x4e); // OP_PUSHDATA4
                self.0.extend_from_slice(&(n as u32).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
    }
}

impl fmt::Debug for ScriptBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Script({})", self.0.to_lower_hex_string())
    }
}

impl fmt::Display for ScriptBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_lower_hex_string())
    }
}

impl Encodable for ScriptBuf {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for ScriptBuf {
    #[inline]
    fn consensus_decode_from_finite_reader<R: Read + ?Sized>(
        r: &mut R,
    ) -> Result<Self, encode::Error> {
        Ok(ScriptBuf(Decodable::consensus_decode_from_finite_reader(r)?))
    }
}
