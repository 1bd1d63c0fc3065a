//! Numeric intervals over i64
//!
//! `[lo, hi]` with the extreme values of `i64` standing in for the
//! infinities. Join takes the outermost bounds, meet the innermost, and
//! widening jumps any unstable endpoint straight to the corresponding
//! infinity so that increasing chains stabilize in at most two steps.

use super::AbstractDomain;
use std::fmt;

pub const MIN: i64 = i64::MIN;
pub const MAX: i64 = i64::MAX;

/// A numeric interval. Bottom is canonically represented as `[MAX, MIN]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalDomain {
    lo: i64,
    hi: i64,
}

impl IntervalDomain {
    /// `[lo, hi]`; asserts a non-empty interval.
    pub fn finite(lo: i64, hi: i64) -> Self {
        assert!(lo <= hi, "empty interval [{}, {}]", lo, hi);
        IntervalDomain { lo, hi }
    }

    /// `[v, v]`.
    pub fn singleton(v: i64) -> Self {
        IntervalDomain { lo: v, hi: v }
    }

    /// `(-inf, hi]`.
    pub fn bounded_above(hi: i64) -> Self {
        IntervalDomain { lo: MIN, hi }
    }

    /// `[lo, +inf)`.
    pub fn bounded_below(lo: i64) -> Self {
        IntervalDomain { lo, hi: MAX }
    }

    pub fn lower_bound(&self) -> i64 {
        assert!(!self.is_bottom());
        self.lo
    }

    pub fn upper_bound(&self) -> i64 {
        assert!(!self.is_bottom());
        self.hi
    }

    pub fn contains(&self, v: i64) -> bool {
        !self.is_bottom() && self.lo <= v && v <= self.hi
    }

    pub fn get_constant(&self) -> Option<i64> {
        if !self.is_bottom() && self.lo == self.hi {
            Some(self.lo)
        } else {
            None
        }
    }
}

impl AbstractDomain for IntervalDomain {
    fn bottom() -> Self {
        IntervalDomain { lo: MAX, hi: MIN }
    }

    fn top() -> Self {
        IntervalDomain { lo: MIN, hi: MAX }
    }

    fn is_bottom(&self) -> bool {
        self.lo > self.hi
    }

    fn is_top(&self) -> bool {
        self.lo == MIN && self.hi == MAX
    }

    fn leq(&self, other: &Self) -> bool {
        self.is_bottom() || (other.lo <= self.lo && self.hi <= other.hi)
    }

    fn join_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = *other;
            return;
        }
        self.lo = self.lo.min(other.lo);
        self.hi = self.hi.max(other.hi);
    }

    fn meet_with(&mut self, other: &Self) {
        if self.is_bottom() {
            return;
        }
        if other.is_bottom() {
            *self = Self::bottom();
            return;
        }
        self.lo = self.lo.max(other.lo);
        self.hi = self.hi.min(other.hi);
        if self.lo > self.hi {
            *self = Self::bottom();
        }
    }

    fn widen_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = *other;
            return;
        }
        if other.lo < self.lo {
            self.lo = MIN;
        }
        if other.hi > self.hi {
            self.hi = MAX;
        }
    }
}

impl fmt::Display for IntervalDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            return write!(f, "_|_");
        }
        if self.is_top() {
            return write!(f, "T");
        }
        let bound = |v: i64| -> String {
            if v == MIN {
                "-inf".to_string()
            } else if v == MAX {
                "+inf".to_string()
            } else {
                v.to_string()
            }
        };
        write!(f, "[{}, {}]", bound(self.lo), bound(self.hi))
    }
}
