// SPDX-License-Identifier: CC0-1.0

//! Proof-of-work types and the difficulty engine.
//!
//! Provides the [`Target`] and [`CompactTarget`] types used in proof-of-work
//! calculations, the PoW predicate itself, and the retarget engine with both
//! of the chain's difficulty algorithms. The retarget functions never fail:
//! pathological inputs fall back to a sentinel target, because a node that
//! cannot compute the next target cannot follow the chain at all.
//!
//! Several branches in here reproduce historical behaviour of specific
//! height ranges. They look redundant on purpose; altering any of them
//! changes the required target of old blocks and forks the chain.

use core::fmt;
use std::io::{self, Read, Write};

use log::info;

use crate::chain::ChainIndex;
use crate::consensus::encode::{self, Decodable, Encodable};
use crate::consensus::Params;
use crate::hash_types::BlockHash;

/// A 256-bit integer representing a proof-of-work target.
///
/// The double-SHA256 of a block's pure header (or, for merge-mined blocks,
/// of the parent header) must be lower than or equal to the current target
/// for the block to be accepted by the network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Target(U256);

impl Target {
    /// A target of zero: unattainable, used as the decode result for
    /// degenerate compact encodings.
    pub const ZERO: Target = Target(U256::ZERO);

    pub(crate) const fn from_raw(high: u128, low: u128) -> Target { Target(U256(high, low)) }

    /// Computes the target value from its compact representation.
    ///
    /// Negative and overflowing encodings still produce a (meaningless)
    /// magnitude; consensus callers must use
    /// [`Target::from_compact_with_flags`] and reject those.
    pub fn from_compact(c: CompactTarget) -> Target { Self::from_compact_with_flags(c).0 }

    /// Computes the target value from its compact representation, together
    /// with the `negative` and `overflow` flags of the encoding.
    ///
    /// This is the full decode used by consensus code. The compact form is
    /// a floating-point encoding inherited from OpenSSL's bignum: one byte
    /// of base-256 exponent and a signed 24-bit mantissa.
    pub fn from_compact_with_flags(c: CompactTarget) -> (Target, bool, bool) {
        let bits = c.to_consensus();
        let size = bits >> 24;
        let word = bits & 0x007f_ffff;

        let value = if size <= 3 {
            U256::from(word >> (8 * (3 - size)))
        } else {
            U256::from(word).shl(8 * (size - 3))
        };

        let negative = word != 0 && (bits & 0x0080_0000) != 0;
        let overflow = word != 0
            && ((size > 34) || (word > 0xff && size > 33) || (word > 0xffff && size > 32));

        (Target(value), negative, overflow)
    }

    /// Computes the compact representation of this target.
    ///
    /// The compact form is by definition lossy: the mantissa keeps only the
    /// 24 most significant bits, so
    /// `t == Target::from_compact(t.to_compact_lossy())` does not always
    /// hold.
    pub fn to_compact_lossy(self) -> CompactTarget {
        let mut size = (self.0.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            (self.0.low_u64() << (8 * (3 - size))) as u32
        } else {
            self.0.shr(8 * (size - 3)).low_u32()
        };

        // The mantissa is signed, shift it back out of the sign bit.
        if (compact & 0x0080_0000) != 0 {
            compact >>= 8;
            size += 1;
        }

        CompactTarget(compact | (size << 24))
    }

    /// Returns true if the given hash is less than or equal to this target.
    pub fn is_met_by(&self, hash: BlockHash) -> bool {
        use hashes::Hash;
        let hash = U256::from_le_bytes(hash.to_byte_array());
        hash <= self.0
    }

    /// Creates a target from a big-endian byte array.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Target { Target(U256::from_be_bytes(bytes)) }

    /// Converts this target to a big-endian byte array.
    pub fn to_be_bytes(self) -> [u8; 32] { self.0.to_be_bytes() }

    /// Converts this target to a little-endian byte array, the form in
    /// which 256-bit values travel on the wire.
    pub fn to_le_bytes(self) -> [u8; 32] { self.0.to_le_bytes() }

    /// Multiplies by a small integer, wrapping on 256-bit overflow.
    fn mul_int(self, n: u64) -> Target { Target(self.0.mul_u64(n).0) }

    /// Divides by a small positive integer.
    fn div_int(self, n: u64) -> Target { Target(self.0.div_rem(U256::from(n)).0) }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::Display::fmt(&self.0, f) }
}

impl fmt::LowerHex for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::LowerHex::fmt(&self.0, f) }
}

impl fmt::UpperHex for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::UpperHex::fmt(&self.0, f) }
}

/// Encoding of a 256-bit target as a 32-bit "float".
///
/// This is used to carry the target in the block header. Satoshi made this
/// part of consensus code in the original version of Bitcoin, likely
/// copying the idea from OpenSSL, and every derived chain is stuck with it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompactTarget(u32);

impl CompactTarget {
    /// Creates a [`CompactTarget`] from its consensus-encoded `u32`.
    pub fn from_consensus(bits: u32) -> Self { Self(bits) }

    /// Returns the consensus-encoded `u32` representation.
    pub fn to_consensus(self) -> u32 { self.0 }
}

impl From<CompactTarget> for Target {
    fn from(c: CompactTarget) -> Self { Target::from_compact(c) }
}

impl fmt::LowerHex for CompactTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::LowerHex::fmt(&self.0, f) }
}

impl fmt::UpperHex for CompactTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::UpperHex::fmt(&self.0, f) }
}

impl Encodable for CompactTarget {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for CompactTarget {
    #[inline]
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        u32::consensus_decode(r).map(CompactTarget)
    }
}

/// Checks that a proof-of-work hash satisfies the claimed compact target.
///
/// Rejects negative, zero and overflowing encodings as well as targets
/// above the network limit. For merge-mined blocks the hash to pass here is
/// the *parent* header's hash; the `bits` are still the child's.
pub fn check_proof_of_work(hash: BlockHash, bits: CompactTarget, params: &Params) -> bool {
    let (target, negative, overflow) = Target::from_compact_with_flags(bits);
    if negative || overflow || target == Target::ZERO || target > params.pow_limit {
        return false;
    }
    target.is_met_by(hash)
}

// Forced-target bands and era boundaries baked into mainnet history. These
// heights are consensus: every node derives the same required target for
// every historical block from them.
const POW_LIMIT_RESET_START: u32 = 112_266;
const POW_LIMIT_RESET_END: u32 = 112_300;
const NEW_LIMIT_RESET_START: u32 = 112_301;
const NEW_LIMIT_RESET_END: u32 = 112_401;
const NEW_LIMIT_OVERRIDE_START: u32 = 122_291;
const NEW_LIMIT_OVERRIDE_END: u32 = 122_310;
const EARLY_STALL_RULE_END: u32 = 126_800;
const RELAX_BAND_START: u32 = 127_464;
const RELAX_BAND_END: u32 = 127_927;
const EMERGENCY_ERA_START: u32 = 127_928;

/// Spacing below which a block counts towards a hashrate spike, seconds.
const FAST_SPIKE_SPACING: i64 = 120;
/// Average window spacing below which a spike counts as sustained, seconds.
const FAST_SPIKE_AVG_SPACING: i64 = 300;

/// Computes the compact target required for the block following `last`.
///
/// `last` is the current chain tip (`None` only for the genesis block) and
/// `candidate_time` the timestamp of the block being built or validated.
/// The function cannot fail; when history is too short or parameters are
/// degenerate it returns a sentinel limit instead.
pub fn next_work_required<C: ChainIndex>(
    last: Option<&C>,
    candidate_time: u32,
    params: &Params,
) -> CompactTarget {
    let pow_limit = params.pow_limit.to_compact_lossy();
    let pow_new_limit = params.pow_new_limit.to_compact_lossy();

    let last = match last {
        Some(last) => last,
        None => return pow_limit,
    };
    let height = last.height();

    if (NEW_LIMIT_OVERRIDE_START..=NEW_LIMIT_OVERRIDE_END).contains(&height) {
        return pow_new_limit;
    }

    if height >= params.new_pow_diff_height {
        return next_work_required_new(last, candidate_time, params);
    }

    if (POW_LIMIT_RESET_START..=POW_LIMIT_RESET_END).contains(&height) {
        return pow_limit;
    }

    if (NEW_LIMIT_RESET_START..=NEW_LIMIT_RESET_END).contains(&height) {
        return pow_new_limit;
    }

    let interval = params.difficulty_adjustment_interval() as u32;

    // Only change once per difficulty adjustment interval.
    if (height + 1) % interval != 0 {
        if params.allow_min_difficulty_blocks {
            // Special difficulty rule for testnet: if the new block's
            // timestamp is more than twice the target spacing after the
            // tip, a min-difficulty block is allowed.
            if i64::from(candidate_time)
                > i64::from(last.time()) + params.pow_target_spacing as i64 * 2
            {
                return pow_limit;
            }
            // Return the last non-special-min-difficulty-rules block.
            let mut index = last;
            while let Some(prev) = index.prev() {
                if index.height() % interval == 0 || index.bits() != pow_limit {
                    break;
                }
                index = prev;
            }
            return index.bits();
        }
        return last.bits();
    }

    // Go back by what we want to be a full timespan worth of blocks.
    let first_height = match height.checked_sub(interval - 1) {
        Some(h) => h,
        None => return last.bits(),
    };
    let first = match last.ancestor(first_height) {
        Some(first) => first,
        None => return last.bits(),
    };
    legacy_retarget(last, first.time(), params)
}

/// The original Bitcoin retarget, applied once per interval.
fn legacy_retarget<C: ChainIndex>(last: &C, first_block_time: u32, params: &Params) -> CompactTarget {
    if params.no_pow_retargeting {
        return last.bits();
    }

    // Limit the adjustment step.
    let timespan = params.pow_target_timespan as i64;
    let mut actual = i64::from(last.time()) - i64::from(first_block_time);
    if actual < timespan / 4 {
        actual = timespan / 4;
    }
    if actual > timespan * 4 {
        actual = timespan * 4;
    }

    // Multiply before dividing: the clamped timespan keeps the product
    // inside 256 bits, and dividing first would lose the low bits.
    let (target, _, _) = Target::from_compact_with_flags(last.bits());
    let mut new_target = target.mul_int(actual as u64).div_int(timespan as u64);
    if new_target > params.pow_limit {
        new_target = params.pow_limit;
    }
    new_target.to_compact_lossy()
}

/// The averaging-window retarget era, with its height-gated emergency rules.
fn next_work_required_new<C: ChainIndex>(
    last: &C,
    candidate_time: u32,
    params: &Params,
) -> CompactTarget {
    let pow_new_limit = params.pow_new_limit.to_compact_lossy();
    let pow_max_limit = params.pow_max_limit.to_compact_lossy();
    let pow_din_limit = params.pow_din_limit.to_compact_lossy();

    if params.no_pow_retargeting {
        return last.bits();
    }
    if params.pow_averaging_window <= 0 || params.post_blossom_pow_target_spacing <= 0 {
        return pow_new_limit;
    }

    let height = last.height();
    let time_diff = i64::from(candidate_time) - i64::from(last.time());
    let spacing = params.post_blossom_pow_target_spacing;

    // First stall rule: a long gap simply resets to the baseline target.
    if height < EARLY_STALL_RULE_END && time_diff > spacing * 6 {
        return pow_new_limit;
    }

    if (RELAX_BAND_START..=RELAX_BAND_END).contains(&height) {
        let (last_target, _, _) = Target::from_compact_with_flags(last.bits());
        let mut target = last_target;

        if time_diff > spacing * 8 {
            return pow_max_limit;
        } else if time_diff > spacing * 6 {
            target = target.mul_int(100).div_int(35);
        } else if time_diff > spacing * 3 {
            target = target.mul_int(100).div_int(50);
        }

        if target > params.pow_max_limit {
            return pow_max_limit;
        }
        // This band returns unconditionally, also when no threshold fired.
        return target.to_compact_lossy();
    }

    let emergency_start = if params.allow_min_difficulty_blocks {
        params.new_pow_diff_height
    } else {
        EMERGENCY_ERA_START
    };

    if height >= emergency_start {
        let (last_target, _, _) = Target::from_compact_with_flags(last.bits());

        if height < params.hard_fork_height {
            // Historical form of the emergency rule: it returns even when
            // no threshold fired, so the averaging retarget below was
            // unreachable for these heights. Kept exactly as deployed.
            let mut target = last_target;

            if time_diff > spacing * 8 {
                return pow_din_limit;
            } else if time_diff > spacing * 6 {
                target = target.mul_int(100).div_int(35);
            } else if time_diff > spacing * 3 {
                target = target.mul_int(100).div_int(50);
            }

            if target > params.pow_din_limit {
                return pow_din_limit;
            }
            return target.to_compact_lossy();
        }

        // Fast-block emergency: only tighten on a sustained burst, one
        // lucky block is not a hashrate spike.
        if time_diff < FAST_SPIKE_SPACING {
            let mut index = last;
            let mut total_time = 0i64;
            let mut count = 0i64;
            for _ in 0..params.pow_averaging_window {
                let prev = match index.prev() {
                    Some(prev) => prev,
                    None => break,
                };
                total_time += i64::from(index.time()) - i64::from(prev.time());
                index = prev;
                count += 1;
            }
            if count > 0 {
                let avg_block_time = total_time / count;
                if avg_block_time < FAST_SPIKE_AVG_SPACING {
                    info!(
                        "emergency retarget at height {}: {}s block, {}s average, doubling difficulty",
                        height + 1,
                        time_diff,
                        avg_block_time
                    );
                    return last_target.div_int(2).to_compact_lossy();
                }
            }
        }

        // Slow-block emergency: widen the target in steps.
        if time_diff > spacing * 8 {
            info!(
                "emergency retarget at height {}: {}s without a block, dropping to the emergency limit",
                height + 1,
                time_diff
            );
            return pow_din_limit;
        } else if time_diff > spacing * 6 {
            let target = last_target.mul_int(100).div_int(35);
            if target > params.pow_din_limit {
                return pow_din_limit;
            }
            info!("emergency retarget at height {}: severe delay, 65% easier", height + 1);
            return target.to_compact_lossy();
        } else if time_diff > spacing * 4 {
            let target = last_target.mul_int(100).div_int(25);
            if target > params.pow_din_limit {
                return pow_din_limit;
            }
            info!("emergency retarget at height {}: major delay, 75% easier", height + 1);
            return target.to_compact_lossy();
        } else if time_diff > spacing * 3 {
            let target = last_target.mul_int(100).div_int(50);
            if target > params.pow_din_limit {
                return pow_din_limit;
            }
            info!("emergency retarget at height {}: moderate delay, 50% easier", height + 1);
            return target.to_compact_lossy();
        }

        // No emergency: fall through to the averaging retarget.
    }

    // Sum the compact targets over the averaging window.
    let mut index = Some(last);
    let mut total = U256::ZERO;
    for _ in 0..params.pow_averaging_window {
        match index {
            Some(node) => {
                let (target, _, _) = Target::from_compact_with_flags(node.bits());
                total = total.wrapping_add(target.0);
                index = node.prev();
            }
            None => break,
        }
    }

    // The block before the window anchors the actual timespan; without it
    // the window is not full and the baseline target applies.
    let first = match index {
        Some(first) => first,
        None => return pow_new_limit,
    };

    let avg = Target(total.div_rem(U256::from(params.pow_averaging_window as u64)).0);
    averaging_retarget(avg, first.time(), last.time(), params)
}

/// Scales the window-average target by the dampened actual timespan.
fn averaging_retarget(avg: Target, first_time: u32, last_time: u32, params: &Params) -> CompactTarget {
    let window_timespan = params.averaging_window_timespan();
    if window_timespan <= 0 {
        return params.pow_new_limit.to_compact_lossy();
    }

    // Dampen the measured timespan towards the expected one.
    let mut actual = i64::from(last_time) - i64::from(first_time);
    actual = window_timespan + (actual - window_timespan) / 4;

    if actual < params.min_actual_timespan() {
        actual = params.min_actual_timespan();
    }
    if actual > params.max_actual_timespan() {
        actual = params.max_actual_timespan();
    }

    // Divide before multiplying: the window average sits near the top of
    // the 256-bit range and multiplying first can overflow.
    let mut new_target = avg.div_int(window_timespan as u64).mul_int(actual as u64);
    if new_target > params.pow_limit {
        new_target = params.pow_limit;
    }
    new_target.to_compact_lossy()
}

/// Checks whether a difficulty transition between consecutive blocks is
/// within the bounds consensus allows.
///
/// `height` is the height of the block carrying `new_bits`; `old_bits` are
/// its predecessor's. Used by header sync to cheaply reject forged
/// difficulty drops without replaying the whole retarget.
pub fn permitted_difficulty_transition(
    params: &Params,
    height: u32,
    old_bits: CompactTarget,
    new_bits: CompactTarget,
) -> bool {
    if params.allow_min_difficulty_blocks {
        return true;
    }

    if height >= params.new_pow_diff_height {
        let (observed, _, _) = Target::from_compact_with_flags(new_bits);
        let (old, _, _) = Target::from_compact_with_flags(old_bits);

        let mut max_target = old.mul_int(100 + params.pow_max_adjust_down as u64).div_int(100);
        if max_target > params.pow_limit {
            max_target = params.pow_limit;
        }

        // Guard the subtraction when the permitted upward adjustment is
        // one hundred percent or more.
        let min_target = if params.pow_max_adjust_up >= 100 {
            old.div_int(100)
        } else {
            old.mul_int(100 - params.pow_max_adjust_up as u64).div_int(100)
        };

        if observed > max_target || observed < min_target {
            return false;
        }
    } else if u64::from(height) % params.difficulty_adjustment_interval() == 0 {
        let timespan = params.pow_target_timespan;
        let smallest_timespan = timespan / 4;
        let largest_timespan = timespan * 4;

        let (observed, _, _) = Target::from_compact_with_flags(new_bits);
        let (old, _, _) = Target::from_compact_with_flags(old_bits);

        // Round the bounds through the compact encoding, the header only
        // ever carries the lossy form.
        let mut largest = old.mul_int(largest_timespan).div_int(timespan);
        if largest > params.pow_limit {
            largest = params.pow_limit;
        }
        let maximum = Target::from_compact(largest.to_compact_lossy());
        if maximum < observed {
            return false;
        }

        let mut smallest = old.mul_int(smallest_timespan).div_int(timespan);
        if smallest > params.pow_limit {
            smallest = params.pow_limit;
        }
        let minimum = Target::from_compact(smallest.to_compact_lossy());
        if minimum > observed {
            return false;
        }
    } else if old_bits != new_bits {
        return false;
    }

    true
}

/// Big-endian 256 bit integer type.
// (high, low): u.0 contains the high bits, u.1 contains the low bits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
struct U256(u128, u128);

impl U256 {
    const ZERO: U256 = U256(0, 0);

    /// Creates a [`U256`] from a big-endian array of `u8`s.
    fn from_be_bytes(a: [u8; 32]) -> U256 {
        let (high, low) = split_in_half(a);
        U256(u128::from_be_bytes(high), u128::from_be_bytes(low))
    }

    /// Creates a [`U256`] from a little-endian array of `u8`s.
    fn from_le_bytes(a: [u8; 32]) -> U256 {
        let (low, high) = split_in_half(a);
        U256(u128::from_le_bytes(high), u128::from_le_bytes(low))
    }

    /// Converts `self` to a big-endian array of `u8`s.
    fn to_be_bytes(self) -> [u8; 32] {
        let mut out = [0; 32];
        out[..16].copy_from_slice(&self.0.to_be_bytes());
        out[16..].copy_from_slice(&self.1.to_be_bytes());
        out
    }

    /// Converts `self` to a little-endian array of `u8`s.
    fn to_le_bytes(self) -> [u8; 32] {
        let mut out = [0; 32];
        out[..16].copy_from_slice(&self.1.to_le_bytes());
        out[16..].copy_from_slice(&self.0.to_le_bytes());
        out
    }

    fn is_zero(&self) -> bool { self.0 == 0 && self.1 == 0 }

    /// Returns the low 32 bits.
    fn low_u32(&self) -> u32 { self.1 as u32 }

    /// Returns the low 64 bits.
    fn low_u64(&self) -> u64 { self.1 as u64 }

    /// Returns the least number of bits needed to represent the number.
    fn bits(&self) -> u32 {
        if self.0 > 0 {
            256 - self.0.leading_zeros()
        } else {
            128 - self.1.leading_zeros()
        }
    }

    /// Wrapping multiplication by `u64`, with an overflow flag.
    fn mul_u64(self, rhs: u64) -> (U256, bool) {
        let mut carry: u128 = 0;
        let mut split_le =
            [self.1 as u64, (self.1 >> 64) as u64, self.0 as u64, (self.0 >> 64) as u64];

        for word in &mut split_le {
            // This will not overflow: max u64 * max u64 + max u64 < max u128.
            let n = carry + u128::from(rhs) * u128::from(*word);
            *word = n as u64; // Intentional truncation, save the low bits
            carry = n >> 64; // and carry the high bits.
        }

        let low = u128::from(split_le[0]) | u128::from(split_le[1]) << 64;
        let high = u128::from(split_le[2]) | u128::from(split_le[3]) << 64;
        (U256(high, low), carry != 0)
    }

    /// Calculates quotient and remainder.
    ///
    /// # Panics
    ///
    /// If `rhs` is zero.
    fn div_rem(self, rhs: Self) -> (Self, Self) {
        let mut sub_copy = self;
        let mut shift_copy = rhs;
        let mut ret = [0u128; 2];

        let my_bits = self.bits();
        let your_bits = rhs.bits();

        assert!(your_bits != 0, "attempted to divide {} by zero", self);

        // Early return in case we are dividing by a larger number than us.
        if my_bits < your_bits {
            return (U256::ZERO, sub_copy);
        }

        // Bitwise long division.
        let mut shift = my_bits - your_bits;
        shift_copy = shift_copy.shl(shift);
        loop {
            if sub_copy >= shift_copy {
                ret[1 - (shift / 128) as usize] |= 1 << (shift % 128);
                sub_copy = sub_copy.wrapping_sub(shift_copy);
            }
            shift_copy = shift_copy.shr(1);
            if shift == 0 {
                break;
            }
            shift -= 1;
        }

        (U256(ret[0], ret[1]), sub_copy)
    }

    /// Calculates `self + rhs`, with an overflow flag.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    fn overflowing_add(self, rhs: Self) -> (Self, bool) {
        let mut ret = U256::ZERO;
        let mut ret_overflow = false;

        let (high, overflow) = self.0.overflowing_add(rhs.0);
        ret.0 = high;
        ret_overflow |= overflow;

        let (low, overflow) = self.1.overflowing_add(rhs.1);
        ret.1 = low;
        if overflow {
            let (high, overflow) = ret.0.overflowing_add(1);
            ret.0 = high;
            ret_overflow |= overflow;
        }

        (ret, ret_overflow)
    }

    /// Wrapping (modular) addition.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    fn wrapping_add(self, rhs: Self) -> Self {
        let (ret, _overflow) = self.overflowing_add(rhs);
        ret
    }

    /// Wrapping (modular) subtraction.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    fn wrapping_sub(self, rhs: Self) -> Self {
        let one = U256(0, 1);
        self.wrapping_add(U256(!rhs.0, !rhs.1)).wrapping_add(one)
    }

    /// Bitwise shift left. Shifts of 256 bits or more yield zero.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    fn shl(self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }

        let mut ret = U256::ZERO;
        let word_shift = shift >= 128;
        let bit_shift = shift % 128;

        if word_shift {
            ret.0 = self.1 << bit_shift;
        } else {
            ret.0 = self.0 << bit_shift;
            if bit_shift > 0 {
                ret.0 += self.1.wrapping_shr(128 - bit_shift);
            }
            ret.1 = self.1 << bit_shift;
        }
        ret
    }

    /// Bitwise shift right. Shifts of 256 bits or more yield zero.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    fn shr(self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }

        let mut ret = U256::ZERO;
        let word_shift = shift >= 128;
        let bit_shift = shift % 128;

        if word_shift {
            ret.1 = self.0 >> bit_shift;
        } else {
            ret.0 = self.0 >> bit_shift;
            ret.1 = self.1 >> bit_shift;
            if bit_shift > 0 {
                ret.1 += self.0.wrapping_shl(128 - bit_shift);
            }
        }
        ret
    }

    /// Formats `self` as a decimal when the value is known to be non-zero.
    fn fmt_decimal(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const DIGITS: usize = 78; // U256::MAX has 78 base 10 digits.
        const TEN: U256 = U256(0, 10);

        let mut buf = [0_u8; DIGITS];
        let mut i = DIGITS - 1; // We loop backwards.
        let mut cur = *self;

        loop {
            let (quotient, remainder) = cur.div_rem(TEN);
            buf[i] = remainder.1 as u8 + b'0'; // Cast after rem 10 is lossless.
            cur = quotient;
            if cur.is_zero() {
                break;
            }
            i -= 1;
        }
        let s = core::str::from_utf8(&buf[i..]).expect("digits 0-9 are valid UTF8");
        f.pad_integral(true, "", s)
    }
}

impl<T: Into<u128>> From<T> for U256 {
    fn from(x: T) -> Self { U256(0, x.into()) }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_zero() {
            return f.pad_integral(true, "", "0");
        }
        self.fmt_decimal(f)
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{:#x}", self) }
}

impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 == 0 {
            fmt::LowerHex::fmt(&self.1, f)
        } else {
            write!(f, "{:x}{:032x}", self.0, self.1)
        }
    }
}

impl fmt::UpperHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 == 0 {
            fmt::UpperHex::fmt(&self.1, f)
        } else {
            write!(f, "{:X}{:032X}", self.0, self.1)
        }
    }
}

/// Splits a 32 byte array into two 16 byte arrays.
fn split_in_half(a: [u8; 32]) -> ([u8; 16], [u8; 16]) {
    let mut first = [0u8; 16];
    let mut second = [0u8; 16];

    first.copy_from_slice(&a[..16]);
    second.copy_from_slice(&a[16..]);
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::Network;

    struct MockIndex {
        height: u32,
        time: u32,
        bits: CompactTarget,
        prev: Option<Box<MockIndex>>,
    }

    impl ChainIndex for MockIndex {
        fn height(&self) -> u32 { self.height }
        fn time(&self) -> u32 { self.time }
        fn bits(&self) -> CompactTarget { self.bits }
        fn prev(&self) -> Option<&Self> { self.prev.as_deref() }
    }

    /// Builds a chain of `len` blocks ending at `tip_height`, spaced
    /// `spacing` seconds apart with constant `bits`, tip time `tip_time`.
    fn chain(tip_height: u32, len: u32, tip_time: u32, spacing: u32, bits: u32) -> MockIndex {
        assert!(len >= 1 && len <= tip_height + 1);
        let mut node: Option<Box<MockIndex>> = None;
        for i in 0..len {
            let height = tip_height - (len - 1) + i;
            let time = tip_time - (len - 1 - i) * spacing;
            node = Some(Box::new(MockIndex {
                height,
                time,
                bits: CompactTarget::from_consensus(bits),
                prev: node,
            }));
        }
        *node.unwrap()
    }

    fn compact(bits: u32) -> CompactTarget { CompactTarget::from_consensus(bits) }

    #[test]
    fn compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x1b0404cb, 0x1c05a3f4, 0x207fffff, 0x1c0fff00, 0x0300ffff] {
            let target = Target::from_compact(compact(bits));
            assert_eq!(target.to_compact_lossy(), compact(bits), "bits 0x{:08x}", bits);
        }
    }

    #[test]
    fn compact_flags() {
        // Sign bit set with a non-zero mantissa decodes as negative.
        let (_, negative, overflow) = Target::from_compact_with_flags(compact(0x01fedcba));
        assert!(negative);
        assert!(!overflow);

        // Oversized exponent overflows.
        let (_, negative, overflow) = Target::from_compact_with_flags(compact(0xff123456));
        assert!(!negative);
        assert!(overflow);

        // A zero mantissa is neither.
        let (target, negative, overflow) = Target::from_compact_with_flags(compact(0x1d000000));
        assert_eq!(target, Target::ZERO);
        assert!(!negative);
        assert!(!overflow);
    }

    #[test]
    fn compact_low_exponent() {
        // Exponent <= 3 shifts the mantissa down.
        let (target, _, _) = Target::from_compact_with_flags(compact(0x0200ffff));
        assert_eq!(target, Target(U256::from(0xffu32)));
    }

    #[test]
    fn target_ordering() {
        let small = Target::from_compact(compact(0x1c00ffff));
        let large = Target::from_compact(compact(0x1d00ffff));
        assert!(small < large);
        assert!(large > small);
    }

    #[test]
    fn check_proof_of_work_rejects_bad_encodings() {
        use hashes::Hash;
        let params = Params::new(Network::Mainnet);
        let zero_hash = BlockHash::all_zeros();

        // Zero, negative, overflowing and above-limit targets all fail.
        assert!(!check_proof_of_work(zero_hash, compact(0x1d000000), &params));
        assert!(!check_proof_of_work(zero_hash, compact(0x01803456), &params));
        assert!(!check_proof_of_work(zero_hash, compact(0xff123456), &params));
        assert!(!check_proof_of_work(zero_hash, compact(0x1e00ffff), &params));

        // The zero hash meets any valid target.
        assert!(check_proof_of_work(zero_hash, compact(0x1d00ffff), &params));
    }

    // The legacy retarget against the historical mainnet vectors.

    #[test]
    fn legacy_retarget_no_constraints() {
        let params = Params::new(Network::Mainnet);
        let last = chain(32255, 1, 1262152739, 600, 0x1d00ffff);
        assert_eq!(legacy_retarget(&last, 1261130161, &params), compact(0x1d00d86a));
    }

    #[test]
    fn legacy_retarget_pow_limit_cap() {
        let params = Params::new(Network::Mainnet);
        let last = chain(2015, 1, 1233061996, 600, 0x1d00ffff);
        assert_eq!(legacy_retarget(&last, 1231006505, &params), compact(0x1d00ffff));
    }

    #[test]
    fn legacy_retarget_lower_clamp() {
        let params = Params::new(Network::Mainnet);
        let last = chain(68543, 1, 1279297671, 600, 0x1c05a3f4);
        assert_eq!(legacy_retarget(&last, 1279008237, &params), compact(0x1c0168fd));
    }

    #[test]
    fn legacy_retarget_upper_clamp() {
        let params = Params::new(Network::Mainnet);
        let last = chain(46367, 1, 1269211443, 600, 0x1c387f6f);
        assert_eq!(legacy_retarget(&last, 1263163443, &params), compact(0x1d00e1fd));
    }

    #[test]
    fn legacy_retarget_half_timespan() {
        let params = Params::new(Network::Mainnet);
        let last = chain(2015, 1, 1000000 + 604800, 600, 0x1d00ffff);
        assert_eq!(legacy_retarget(&last, 1000000, &params), compact(0x1c7fff80));
    }

    #[test]
    fn legacy_retarget_no_retargeting_flag() {
        let mut params = Params::new(Network::Mainnet);
        params.no_pow_retargeting = true;
        let last = chain(2015, 1, 1233061996, 600, 0x1c05a3f4);
        assert_eq!(legacy_retarget(&last, 1231006505, &params), compact(0x1c05a3f4));
    }

    #[test]
    fn genesis_uses_pow_limit() {
        let params = Params::new(Network::Mainnet);
        assert_eq!(next_work_required::<MockIndex>(None, 0, &params), compact(0x1d00ffff));
    }

    #[test]
    fn forced_band_boundaries() {
        let params = Params::new(Network::Mainnet);
        let bits = 0x1b00ffff;

        // Just before the override band the legacy non-boundary rule holds.
        let last = chain(122_290, 1, 2_000_000, 600, bits);
        assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(bits));

        // Inside the band the baseline target is forced.
        for height in [122_291, 122_310] {
            let last = chain(height, 1, 2_000_000, 600, bits);
            assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(0x1c00ffff));
        }

        // One past the band the new algorithm takes over; with no window
        // available it falls back to the same baseline.
        let last = chain(122_311, 1, 2_000_000, 600, bits);
        assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(0x1c00ffff));
    }

    #[test]
    fn forced_reset_bands() {
        let params = Params::new(Network::Mainnet);
        let bits = 0x1b00ffff;

        for (height, expected) in [
            (112_265u32, bits),
            (112_266, 0x1d00ffff),
            (112_300, 0x1d00ffff),
            (112_301, 0x1c00ffff),
            (112_401, 0x1c00ffff),
            (112_402, bits),
        ] {
            let last = chain(height, 1, 2_000_000, 600, bits);
            assert_eq!(
                next_work_required(Some(&last), 2_000_600, &params),
                compact(expected),
                "height {}",
                height
            );
        }
    }

    #[test]
    fn early_stall_rule() {
        let params = Params::new(Network::Mainnet);
        // Before 126800 a six-spacing gap resets to the baseline target.
        let last = chain(125_000, 1, 2_000_000, 600, 0x1b00ffff);
        assert_eq!(next_work_required(Some(&last), 2_000_000 + 3601, &params), compact(0x1c00ffff));
    }

    #[test]
    fn relax_band_always_returns() {
        let params = Params::new(Network::Mainnet);
        let bits = 0x1d00ffff;

        // No threshold fired: the band still returns the previous bits
        // instead of falling through to the averaging retarget.
        let last = chain(127_500, 1, 2_000_000, 600, bits);
        assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(bits));

        // Extreme delay drops to the band's own limit.
        let last = chain(127_500, 1, 2_000_000, 600, bits);
        assert_eq!(
            next_work_required(Some(&last), 2_000_000 + 8 * 600 + 1, &params),
            compact(0x1e00ffff)
        );

        // Severe delay widens by 100/35.
        let last = chain(127_500, 1, 2_000_000, 600, bits);
        assert_eq!(
            next_work_required(Some(&last), 2_000_000 + 6 * 600 + 1, &params),
            compact(0x1d02db6a)
        );
    }

    #[test]
    fn relax_band_boundaries() {
        let params = Params::new(Network::Mainnet);
        let bits = 0x1d00ffff;
        // A moderate delay inside the band rescales; on either side of the
        // band the same delay hits the surrounding emergency rules instead.
        let delay = 2_000_000 + 4 * 600;

        let last = chain(127_464, 1, 2_000_000, 600, bits);
        let inside = next_work_required(Some(&last), delay, &params);
        let last = chain(127_927, 1, 2_000_000, 600, bits);
        assert_eq!(next_work_required(Some(&last), delay, &params), inside);

        let last = chain(127_463, 1, 2_000_000, 600, bits);
        let before = next_work_required(Some(&last), delay, &params);
        assert_ne!(before, inside);

        let last = chain(127_928, 1, 2_000_000, 600, bits);
        let after = next_work_required(Some(&last), delay, &params);
        assert_ne!(after, inside);
    }

    #[test]
    fn emergency_era_pre_fork_always_returns() {
        let params = Params::new(Network::Mainnet);
        let bits = 0x1b00ffff;

        // Below the hard fork the emergency branch returns the previous
        // bits even when nothing fired.
        let last = chain(130_000, 3, 2_000_000, 600, bits);
        assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(bits));

        // Thresholds rescale from the previous target.
        let last = chain(130_000, 3, 2_000_000, 600, bits);
        assert_eq!(
            next_work_required(Some(&last), 2_000_000 + 6 * 600 + 1, &params),
            compact(0x1b02db6a)
        );
        let last = chain(130_000, 3, 2_000_000, 600, bits);
        assert_eq!(
            next_work_required(Some(&last), 2_000_000 + 8 * 600 + 1, &params),
            compact(0x1c0fff00)
        );
    }

    #[test]
    fn emergency_era_post_fork_falls_through() {
        let params = Params::new(Network::Mainnet);
        let bits = 0x1b00ffff;

        // Past the hard fork a quiet block falls through to the averaging
        // retarget, which without a full window returns the baseline.
        let last = chain(139_001, 3, 2_000_000, 600, bits);
        assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(0x1c00ffff));
    }

    #[test]
    fn emergency_era_post_fork_cascade() {
        let params = Params::new(Network::Mainnet);
        let bits = 0x1b00ffff;

        for (gap, expected) in [
            (8 * 600 + 1, 0x1c0fff00u32), // extreme delay: emergency limit
            (6 * 600 + 1, 0x1b02db6a),    // severe: 100/35
            (4 * 600 + 1, 0x1b03fffc),    // major: 100/25
            (3 * 600 + 1, 0x1b01fffe),    // moderate: 100/50
        ] {
            let last = chain(139_010, 3, 2_000_000, 600, bits);
            assert_eq!(
                next_work_required(Some(&last), 2_000_000 + gap, &params),
                compact(expected),
                "gap {}",
                gap
            );
        }
    }

    #[test]
    fn fast_spike_doubles_difficulty() {
        let params = Params::new(Network::Mainnet);

        // Sustained 60 second blocks and a 30 second candidate: the target
        // is halved.
        let last = chain(139_010, 18, 2_000_000, 60, 0x1c7fff00);
        assert_eq!(next_work_required(Some(&last), 2_000_030, &params), compact(0x1c3fff80));
    }

    #[test]
    fn fast_block_without_sustained_spike() {
        let params = Params::new(Network::Mainnet);

        // One fast block after normally spaced history is not a spike; the
        // averaging retarget runs instead.
        let last = chain(139_010, 18, 2_000_000, 600, 0x1c7fff00);
        let got = next_work_required(Some(&last), 2_000_030, &params);
        assert_ne!(got, compact(0x1c3fff80));
    }

    #[test]
    fn averaging_retarget_steady_state() {
        let params = Params::new(Network::Mainnet);

        // A full window at exactly the target spacing: only the
        // divide-then-multiply rounding moves the mantissa.
        let last = chain(139_050, 18, 2_000_000, 600, 0x1c7fff00);
        assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(0x1c7ffeff));
    }

    #[test]
    fn averaging_retarget_short_history() {
        let params = Params::new(Network::Mainnet);

        // Seventeen blocks but no anchor before the window.
        let last = chain(139_050, 17, 2_000_000, 600, 0x1c7fff00);
        assert_eq!(next_work_required(Some(&last), 2_000_600, &params), compact(0x1c00ffff));
    }

    #[test]
    fn new_algorithm_respects_no_retargeting() {
        let mut params = Params::new(Network::Mainnet);
        params.no_pow_retargeting = true;
        let last = chain(139_050, 2, 2_000_000, 600, 0x1b00ffff);
        assert_eq!(next_work_required(Some(&last), 2_005_000, &params), compact(0x1b00ffff));
    }

    #[test]
    fn min_difficulty_rules() {
        let mut params = Params::new(Network::Mainnet);
        params.allow_min_difficulty_blocks = true;
        params.new_pow_diff_height = 1_000_000; // keep the legacy path

        // A long gap allows a limit-difficulty block.
        let last = chain(1000, 3, 2_000_000, 600, 0x1b00ffff);
        assert_eq!(next_work_required(Some(&last), 2_000_000 + 1201, &params), compact(0x1d00ffff));

        // Otherwise walk back over min-difficulty blocks to the last real
        // target.
        let real_bits = CompactTarget::from_consensus(0x1b00ffff);
        let base = MockIndex {
            height: 1000,
            time: 2_000_000,
            bits: real_bits,
            prev: None,
        };
        let tip = MockIndex {
            height: 1002,
            time: 2_001_200,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            prev: Some(Box::new(MockIndex {
                height: 1001,
                time: 2_000_600,
                bits: CompactTarget::from_consensus(0x1d00ffff),
                prev: Some(Box::new(base)),
            })),
        };
        assert_eq!(next_work_required(Some(&tip), 2_001_800, &params), real_bits);
    }

    #[test]
    fn legacy_boundary_retarget_through_engine() {
        let mut params = Params::new(Network::Mainnet);
        // Shrink the interval so a short mock chain can cover a window.
        params.pow_target_timespan = 4 * params.pow_target_spacing;
        params.new_pow_diff_height = 1_000_000;

        // Heights 4..=7, so the next block (height 8) is on a boundary.
        let last = chain(7, 4, 1_000_000, 600, 0x1c05a3f4);
        let got = next_work_required(Some(&last), 1_000_600, &params);
        // Actual timespan 1800s against a 2400s window: target shrinks.
        let expected = legacy_retarget(&last, 1_000_000 - 1800, &params);
        assert_eq!(got, expected);
        assert!(Target::from_compact(got) < Target::from_compact(compact(0x1c05a3f4)));
    }

    #[test]
    fn permitted_transition_legacy() {
        let params = Params::new(Network::Mainnet);
        let old = compact(0x1c05a3f4);

        // Off-boundary transitions must not change the target at all.
        assert!(permitted_difficulty_transition(&params, 1001, old, old));
        assert!(!permitted_difficulty_transition(&params, 1001, old, compact(0x1c05a3f5)));

        // On a boundary anything within the four-fold clamp is permitted.
        assert!(permitted_difficulty_transition(&params, 2016, old, compact(0x1c0b47e8)));
        assert!(!permitted_difficulty_transition(&params, 2016, old, compact(0x1c1c33c4)));
    }

    #[test]
    fn permitted_transition_new_algorithm() {
        let params = Params::new(Network::Mainnet);
        let old = compact(0x1b00ffff);
        let height = params.new_pow_diff_height;

        assert!(permitted_difficulty_transition(&params, height, old, compact(0x1b011998)));
        assert!(!permitted_difficulty_transition(&params, height, old, compact(0x1b017ffe)));
        assert!(permitted_difficulty_transition(&params, height, old, compact(0x1b00e665)));
        assert!(!permitted_difficulty_transition(&params, height, old, compact(0x1b00cccc)));
    }

    #[test]
    fn permitted_transition_large_upward_adjustment() {
        let mut params = Params::new(Network::Mainnet);
        params.pow_max_adjust_up = 100;
        let old = compact(0x1b00ffff);
        let height = params.new_pow_diff_height;

        // With a hundred percent bound the floor collapses to old/100.
        // 0x1a028f5a decodes just above that floor, 0x1a0147ac well below.
        assert!(permitted_difficulty_transition(&params, height, old, compact(0x1a028f5a)));
        assert!(!permitted_difficulty_transition(&params, height, old, compact(0x1a0147ac)));
    }

    #[test]
    fn permitted_transition_min_difficulty_networks() {
        let params = Params::new(Network::Regtest);
        assert!(permitted_difficulty_transition(
            &params,
            5,
            compact(0x207fffff),
            compact(0x1d00ffff)
        ));
    }

    #[test]
    fn retarget_output_is_always_permitted() {
        let params = Params::new(Network::Mainnet);

        // Averaging retarget output round-trips through the transition
        // validator.
        let last = chain(139_050, 18, 2_000_000, 600, 0x1c7fff00);
        let next = next_work_required(Some(&last), 2_000_600, &params);
        assert!(permitted_difficulty_transition(&params, 139_051, last.bits(), next));

        // A slow window stretches the timespan but stays inside the
        // per-block adjustment bounds.
        let last = chain(139_050, 18, 2_000_000, 660, 0x1c7fff00);
        let next = next_work_required(Some(&last), 2_000_660, &params);
        assert!(permitted_difficulty_transition(&params, 139_051, last.bits(), next));
    }

    #[test]
    fn retarget_outputs_respect_limits() {
        let params = Params::new(Network::Mainnet);

        // Every engine output decodes to a target at or below the limit
        // that applies to its branch.
        let last = chain(139_050, 18, 2_000_000, 600, 0x1c7fff00);
        let bits = next_work_required(Some(&last), 2_000_600, &params);
        assert!(Target::from_compact(bits) <= params.pow_limit);

        let last = chain(127_500, 1, 2_000_000, 600, 0x1d00ffff);
        let bits = next_work_required(Some(&last), 2_000_000 + 8 * 600 + 1, &params);
        assert!(Target::from_compact(bits) <= params.pow_max_limit);

        let last = chain(139_010, 3, 2_000_000, 600, 0x1d00ffff);
        let bits = next_work_required(Some(&last), 2_000_000 + 8 * 600 + 1, &params);
        assert!(Target::from_compact(bits) <= params.pow_din_limit);
    }

    #[test]
    fn u256_arithmetic() {
        let x = U256::from(0xDEADBEEFu32);
        assert_eq!(x.shl(32).shr(32), x);
        assert_eq!(x.shl(300), U256::ZERO);
        assert_eq!(x.shr(300), U256::ZERO);

        let (product, overflow) = U256(u128::MAX, u128::MAX).mul_u64(2);
        assert!(overflow);
        assert_eq!(product, U256(u128::MAX, u128::MAX - 1));

        let (quotient, remainder) = U256::from(1000u32).div_rem(U256::from(17u32));
        assert_eq!(quotient, U256::from(58u32));
        assert_eq!(remainder, U256::from(14u32));

        assert_eq!(U256::from(100u32).wrapping_sub(U256::from(1u32)), U256::from(99u32));
    }

    #[test]
    fn u256_byte_order() {
        let target = Target::from_compact(compact(0x1d00ffff));
        let be = target.to_be_bytes();
        let le = target.to_le_bytes();
        let mut reversed = le;
        reversed.reverse();
        assert_eq!(be, reversed);
        assert_eq!(Target::from_be_bytes(be), target);
    }

    #[test]
    fn u256_display() {
        assert_eq!(format!("{}", U256::ZERO), "0");
        assert_eq!(format!("{}", U256::from(42u32)), "42");
        assert_eq!(format!("{:x}", U256::from(0xabcdu32)), "abcd");
        assert_eq!(
            format!("{:x}", U256(1, 0)),
            "100000000000000000000000000000000"
        );
    }
}
