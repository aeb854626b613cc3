//! Wraparound-safe comparison of 32-bit sequence numbers.
//!
//! Two sequence numbers are ordered by the sign of their wrapping difference,
//! so `0xFFFF_FFFF` precedes `0` as long as the two are less than 2^31 apart.

use std::cmp::Ordering;

/// Signed distance from `b` to `a`
#[inline]
#[must_use]
pub fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Order `a` relative to `b`
#[inline]
#[must_use]
pub fn seq_cmp(a: u32, b: u32) -> Ordering {
    seq_diff(a, b).cmp(&0)
}

/// `a` comes before `b`
#[inline]
#[must_use]
pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_diff(a, b) < 0
}

/// `a` comes before or equals `b`
#[inline]
#[must_use]
pub fn seq_le(a: u32, b: u32) -> bool {
    seq_diff(a, b) <= 0
}

/// Later of `a` and `b`
#[inline]
#[must_use]
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_lt(a, b) { b } else { a }
}
