//! TCP Sequence Number Arithmetic
//!
//! Implements 32-bit modular sequence numbers with wraparound-aware
//! comparison. All segment positioning and overlap computation goes through
//! the signed difference; raw integer subtraction is never correct here.

use std::fmt;

/// TCP sequence number with wraparound-aware arithmetic and comparison.
///
/// Sequence numbers are 32-bit unsigned integers that wrap at 2^32. Two
/// numbers are compared through their signed distance, interpreted in the
/// half-space `[-2^31, 2^31)`: a distance of exactly 2^31 counts as behind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence(u32);

impl Sequence {
    /// Create a sequence number from a raw u32 value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        Sequence(value)
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Advance the sequence number by `n` bytes (with wraparound).
    #[inline]
    pub fn add(self, n: usize) -> Self {
        Sequence(self.0.wrapping_add(n as u32))
    }

    /// Signed distance from `self` to `other`.
    ///
    /// Positive result means `other` is ahead of `self`, negative means it
    /// is behind. The result lies in `[-2^31, 2^31)`.
    #[inline]
    pub fn difference(self, other: Sequence) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    /// Check if this sequence number is before another.
    #[inline]
    pub fn is_before(self, other: Sequence) -> bool {
        self.difference(other) > 0
    }

    /// Check if this sequence number is after another.
    #[inline]
    pub fn is_after(self, other: Sequence) -> bool {
        self.difference(other) < 0
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Sequence {
    #[inline]
    fn from(value: u32) -> Self {
        Sequence(value)
    }
}

impl From<Sequence> for u32 {
    #[inline]
    fn from(seq: Sequence) -> Self {
        seq.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_comparison() {
        let a = Sequence::new(100);
        let b = Sequence::new(200);

        assert!(a.is_before(b));
        assert!(b.is_after(a));
        assert!(!a.is_after(b));
        assert!(!b.is_before(a));
    }

    #[test]
    fn test_difference() {
        let a = Sequence::new(100);
        let b = Sequence::new(200);

        assert_eq!(a.difference(b), 100);
        assert_eq!(b.difference(a), -100);
        assert_eq!(a.difference(a), 0);
    }

    #[test]
    fn test_wraparound_comparison() {
        let near_max = Sequence::new(u32::MAX - 10);
        let after_wrap = Sequence::new(10);

        assert!(near_max.is_before(after_wrap));
        assert!(after_wrap.is_after(near_max));
        assert_eq!(near_max.difference(after_wrap), 21);
    }

    #[test]
    fn test_wraparound_at_boundary() {
        let max = Sequence::new(u32::MAX);
        let zero = Sequence::new(0);

        assert!(max.is_before(zero));
        assert!(zero.is_after(max));
        assert_eq!(max.difference(zero), 1);
    }

    #[test]
    fn test_wraparound_add() {
        let near_max = Sequence::new(u32::MAX - 5);
        assert_eq!(near_max.add(10).raw(), 4);

        let zero = Sequence::new(0);
        assert_eq!(zero.add(0).raw(), 0);
    }

    #[test]
    fn test_half_range_boundary() {
        // At exactly half the range the distance is i32::MIN, so the far
        // number counts as behind.
        let a = Sequence::new(0);
        let half = Sequence::new(0x8000_0000);

        assert_eq!(a.difference(half), i32::MIN);
        assert!(!a.is_before(half));
        assert!(a.is_after(half));
    }

    #[test]
    fn test_large_gap_comparison() {
        let a = Sequence::new(0);
        let b = Sequence::new(i32::MAX as u32);

        assert!(a.is_before(b));
        assert!(b.is_after(a));
    }

    #[test]
    fn test_from_into() {
        let seq: Sequence = 12345u32.into();
        assert_eq!(seq.raw(), 12345);

        let val: u32 = seq.into();
        assert_eq!(val, 12345);
    }

    #[test]
    fn test_display_debug() {
        let seq = Sequence::new(12345);
        assert_eq!(format!("{}", seq), "12345");
        assert_eq!(format!("{:?}", seq), "Sequence(12345)");
    }
}
