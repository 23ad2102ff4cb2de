// SPDX-License-Identifier: CC0-1.0

//! Chain consensus parameters.
//!
//! One immutable record per network carrying every tunable the proof-of-work
//! rules depend on: the target limits of the two retarget eras, spacing and
//! window sizes, and the height gates at which behaviour changed.

use crate::pow::Target;

/// The chain on which a set of parameters is valid.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The public test network.
    Testnet,
    /// Local regression testing.
    Regtest,
}

// Target limits, lowest difficulty first. `pow_max_limit` and
// `pow_din_limit` are only reachable through the emergency rules.
const MAINNET_POW_MAX_LIMIT: Target = Target::from_raw(0xFFFF_u128 << (216 - 128), 0);
const MAINNET_POW_LIMIT: Target = Target::from_raw(0xFFFF_u128 << (208 - 128), 0);
const MAINNET_POW_DIN_LIMIT: Target = Target::from_raw(0x0FFF_u128 << (208 - 128), 0);
const MAINNET_POW_NEW_LIMIT: Target = Target::from_raw(0xFFFF_u128 << (200 - 128), 0);
const REGTEST_POW_LIMIT: Target =
    Target::from_raw(0x7FFF_FF00_0000_0000_0000_0000_0000_0000, 0);

/// Parameters that influence chain consensus.
#[derive(Debug, Clone)]
pub struct Params {
    /// Network for which the parameters are valid.
    pub network: Network,
    /// Cap on the target produced by the legacy retarget, and the ultimate
    /// clamp on every retarget output.
    pub pow_limit: Target,
    /// Default target the averaging retarget falls back to when it cannot
    /// compute (short chain, bad windows) and during the forced bands.
    pub pow_new_limit: Target,
    /// Extreme-relax target reachable only inside the historic relax band.
    pub pow_max_limit: Target,
    /// Extreme-relax target for the emergency era.
    pub pow_din_limit: Target,
    /// Expected spacing between blocks under the legacy algorithm, seconds.
    pub pow_target_spacing: u64,
    /// Legacy retarget window, seconds.
    pub pow_target_timespan: u64,
    /// Number of predecessors averaged by the new retarget algorithm.
    pub pow_averaging_window: i64,
    /// Maximum percentage the target may move down (difficulty up) per block.
    pub pow_max_adjust_up: i64,
    /// Maximum percentage the target may move up (difficulty down) per block.
    pub pow_max_adjust_down: i64,
    /// Expected spacing between blocks under the new algorithm, seconds.
    pub post_blossom_pow_target_spacing: i64,
    /// Height at which the new difficulty algorithm activates.
    pub new_pow_diff_height: u32,
    /// Height at which the emergency rules switch from their historical
    /// form to the fixed form.
    pub hard_fork_height: u32,
    /// Earliest height at which merge-mined blocks are accepted.
    pub auxpow_start_height: u32,
    /// This chain's identifier in the merged-mining tree.
    pub auxpow_chain_id: i32,
    /// Reject auxiliary proofs whose parent carries our own chain ID.
    pub strict_chain_id: bool,
    /// Determines whether minimal difficulty may be used for blocks or not.
    pub allow_min_difficulty_blocks: bool,
    /// Determines whether retargeting is disabled for this network or not.
    pub no_pow_retargeting: bool,
    /// First height at which the minimum block spacing guard applies.
    pub min_block_spacing_start_height: u32,
    /// Height at which the minimum block spacing guard is lifted again.
    pub no_min_spacing_activation_height: u32,
}

/// The mainnet parameters.
pub static MAINNET: Params = Params::MAINNET;
/// The testnet parameters.
pub static TESTNET: Params = Params::TESTNET;
/// The regtest parameters.
pub static REGTEST: Params = Params::REGTEST;

impl Params {
    /// The mainnet parameters.
    pub const MAINNET: Params = Params {
        network: Network::Mainnet,
        pow_limit: MAINNET_POW_LIMIT,
        pow_new_limit: MAINNET_POW_NEW_LIMIT,
        pow_max_limit: MAINNET_POW_MAX_LIMIT,
        pow_din_limit: MAINNET_POW_DIN_LIMIT,
        pow_target_spacing: 10 * 60,            // 10 minutes.
        pow_target_timespan: 14 * 24 * 60 * 60, // 2 weeks.
        pow_averaging_window: 17,
        pow_max_adjust_up: 16,
        pow_max_adjust_down: 32,
        post_blossom_pow_target_spacing: 10 * 60,
        new_pow_diff_height: 122_311,
        hard_fork_height: 139_000,
        auxpow_start_height: 110_000,
        auxpow_chain_id: 0x0020,
        strict_chain_id: true,
        allow_min_difficulty_blocks: false,
        no_pow_retargeting: false,
        min_block_spacing_start_height: 127_928,
        no_min_spacing_activation_height: 139_000,
    };

    /// The testnet parameters.
    pub const TESTNET: Params = Params {
        network: Network::Testnet,
        pow_limit: MAINNET_POW_LIMIT,
        pow_new_limit: MAINNET_POW_NEW_LIMIT,
        pow_max_limit: MAINNET_POW_MAX_LIMIT,
        pow_din_limit: MAINNET_POW_DIN_LIMIT,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_averaging_window: 17,
        pow_max_adjust_up: 16,
        pow_max_adjust_down: 32,
        post_blossom_pow_target_spacing: 10 * 60,
        new_pow_diff_height: 2016,
        hard_fork_height: 4032,
        auxpow_start_height: 0,
        auxpow_chain_id: 0x0020,
        strict_chain_id: false,
        allow_min_difficulty_blocks: true,
        no_pow_retargeting: false,
        min_block_spacing_start_height: 0,
        no_min_spacing_activation_height: 0,
    };

    /// The regtest parameters.
    pub const REGTEST: Params = Params {
        network: Network::Regtest,
        pow_limit: REGTEST_POW_LIMIT,
        pow_new_limit: REGTEST_POW_LIMIT,
        pow_max_limit: REGTEST_POW_LIMIT,
        pow_din_limit: REGTEST_POW_LIMIT,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_averaging_window: 17,
        pow_max_adjust_up: 16,
        pow_max_adjust_down: 32,
        post_blossom_pow_target_spacing: 10 * 60,
        new_pow_diff_height: 200,
        hard_fork_height: 300,
        auxpow_start_height: 0,
        auxpow_chain_id: 0x0020,
        strict_chain_id: false,
        allow_min_difficulty_blocks: true,
        no_pow_retargeting: true,
        min_block_spacing_start_height: 0,
        no_min_spacing_activation_height: 0,
    };

    /// Creates the parameter set for the given network.
    pub const fn new(network: Network) -> Self {
        match network {
            Network::Mainnet => Params::MAINNET,
            Network::Testnet => Params::TESTNET,
            Network::Regtest => Params::REGTEST,
        }
    }

    /// Calculates the number of blocks between legacy difficulty adjustments.
    pub fn difficulty_adjustment_interval(&self) -> u64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    /// Expected duration of a full averaging window, seconds.
    ///
    /// Returns 1 when the window parameters are degenerate so callers can
    /// divide by it unconditionally.
    pub fn averaging_window_timespan(&self) -> i64 {
        if self.pow_averaging_window <= 0 || self.post_blossom_pow_target_spacing <= 0 {
            return 1;
        }
        self.pow_averaging_window * self.post_blossom_pow_target_spacing
    }

    /// Shortest actual timespan the averaging retarget will accept.
    pub fn min_actual_timespan(&self) -> i64 {
        let timespan = self.averaging_window_timespan();
        if self.pow_max_adjust_up >= 100 {
            return timespan / 100;
        }
        timespan * (100 - self.pow_max_adjust_up) / 100
    }

    /// Longest actual timespan the averaging retarget will accept.
    pub fn max_actual_timespan(&self) -> i64 {
        let timespan = self.averaging_window_timespan();
        timespan * (100 + self.pow_max_adjust_down) / 100
    }
}

impl From<Network> for Params {
    fn from(network: Network) -> Self { Self::new(network) }
}

impl AsRef<Params> for Params {
    fn as_ref(&self) -> &Params { self }
}

impl AsRef<Params> for Network {
    fn as_ref(&self) -> &Params {
        match *self {
            Network::Mainnet => &MAINNET,
            Network::Testnet => &TESTNET,
            Network::Regtest => &REGTEST,
        }
    }
}
