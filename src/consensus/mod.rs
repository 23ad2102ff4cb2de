// SPDX-License-Identifier: CC0-1.0

//! Consensus encoding and chain parameters.

pub mod encode;
pub mod params;

pub use self::encode::{
    deserialize, deserialize_partial, serialize, serialize_hex, Decodable, Encodable, Error,
    ReadExt, VarInt, WriteExt, MAX_VEC_SIZE,
};
pub use self::params::{Network, Params};
