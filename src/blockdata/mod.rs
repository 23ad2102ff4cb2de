// SPDX-License-Identifier: CC0-1.0

//! Block and transaction data structures.

pub mod block;
pub mod script;
pub mod transaction;
