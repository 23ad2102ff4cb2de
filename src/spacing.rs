// SPDX-License-Identifier: CC0-1.0

//! Block spacing guardrails.
//!
//! For a stretch of its history the chain discouraged blocks that followed
//! their predecessor too quickly: miners had to stamp templates at least
//! [`MIN_BLOCK_SPACING`] after the tip, and relays deprioritised anything
//! faster than [`FAST_BLOCK_SPACING`]. Both guards were switched off again
//! at a later height. The activation window is consensus; the scoring
//! itself only steers relay policy.

use crate::consensus::Params;

/// Minimum spacing enforced on miners while the guard is active, seconds.
pub const MIN_BLOCK_SPACING: i64 = 480;

/// Spacing below which a block counts as fast for relay scoring, seconds.
pub const FAST_BLOCK_SPACING: i64 = 120;

/// Whether the minimum spacing guard applies to a block at `height`.
pub fn min_spacing_enforced(params: &Params, height: u32) -> bool {
    height >= params.min_block_spacing_start_height
        && height < params.no_min_spacing_activation_height
}

/// Earliest timestamp a block on top of the given predecessor may carry.
///
/// Zero when the guard is inactive at `height`.
pub fn minimum_block_time(params: &Params, height: u32, prev_time: u32) -> u32 {
    if min_spacing_enforced(params, height) {
        prev_time.saturating_add(MIN_BLOCK_SPACING as u32)
    } else {
        0
    }
}

/// Whether a block came too quickly after its predecessor.
///
/// Always false once the guard window has closed at the predecessor's
/// height.
pub fn is_fast_block(params: &Params, prev_height: u32, prev_time: u32, block_time: u32) -> bool {
    if !min_spacing_enforced(params, prev_height) {
        return false;
    }
    i64::from(block_time) - i64::from(prev_time) < FAST_BLOCK_SPACING
}

/// Scores how aggressively a fast block should be discouraged.
///
/// Zero for normal blocks, up to 100 for blocks racing the threshold, and
/// an off-scale 1000 for non-monotone timestamps.
pub fn fast_block_score(
    params: &Params,
    prev_height: u32,
    prev_time: u32,
    block_time: u32,
) -> i64 {
    if !is_fast_block(params, prev_height, prev_time, block_time) {
        return 0;
    }

    let diff = i64::from(block_time) - i64::from(prev_time);
    if diff <= 0 {
        return 1000;
    }

    let score = (FAST_BLOCK_SPACING - diff) * 100 / FAST_BLOCK_SPACING;
    score.min(100)
}

/// Whether a block should be relayed immediately based on its timing.
pub fn should_relay(params: &Params, prev_height: u32, prev_time: u32, block_time: u32) -> bool {
    fast_block_score(params, prev_height, prev_time, block_time) <= 75
}

/// Relay delay for fast blocks, seconds.
pub fn relay_delay(params: &Params, prev_height: u32, prev_time: u32, block_time: u32) -> i64 {
    fast_block_score(params, prev_height, prev_time, block_time) * 30 / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::Network;

    fn params() -> Params { Params::new(Network::Mainnet) }

    #[test]
    fn enforcement_window_boundaries() {
        let params = params();
        let start = params.min_block_spacing_start_height;
        let end = params.no_min_spacing_activation_height;

        assert!(!min_spacing_enforced(&params, start - 1));
        assert!(min_spacing_enforced(&params, start));
        assert!(min_spacing_enforced(&params, end - 1));
        assert!(!min_spacing_enforced(&params, end));
        assert!(!min_spacing_enforced(&params, end + 1));
    }

    #[test]
    fn minimum_time_inside_window() {
        let params = params();
        let height = params.min_block_spacing_start_height + 1;
        assert_eq!(minimum_block_time(&params, height, 1_000_000), 1_000_480);
        assert_eq!(
            minimum_block_time(&params, params.no_min_spacing_activation_height, 1_000_000),
            0
        );
    }

    #[test]
    fn fast_block_detection_deactivates() {
        let params = params();
        let active = params.no_min_spacing_activation_height - 1;

        // Sixty-second spacing trips the guard while it is active; at the
        // deactivation height the same spacing is fine.
        assert!(is_fast_block(&params, active, 1_000_000, 1_000_060));
        assert!(!is_fast_block(
            &params,
            params.no_min_spacing_activation_height,
            1_000_000,
            1_000_060
        ));
    }

    #[test]
    fn score_scales_with_speed() {
        let params = params();
        let height = params.min_block_spacing_start_height + 1;

        assert_eq!(fast_block_score(&params, height, 1_000_000, 1_000_600), 0);
        assert_eq!(fast_block_score(&params, height, 1_000_000, 1_000_060), 50);
        assert_eq!(fast_block_score(&params, height, 1_000_000, 1_000_012), 90);
        // Non-monotone timestamps are off the scale.
        assert_eq!(fast_block_score(&params, height, 1_000_000, 1_000_000), 1000);
    }

    #[test]
    fn relay_policy_follows_score() {
        let params = params();
        let height = params.min_block_spacing_start_height + 1;

        assert!(should_relay(&params, height, 1_000_000, 1_000_600));
        assert!(should_relay(&params, height, 1_000_000, 1_000_060));
        assert!(!should_relay(&params, height, 1_000_000, 1_000_012));

        assert_eq!(relay_delay(&params, height, 1_000_000, 1_000_600), 0);
        assert_eq!(relay_delay(&params, height, 1_000_000, 1_000_060), 15);
        assert_eq!(relay_delay(&params, height, 1_000_000, 1_000_012), 27);
    }
}
