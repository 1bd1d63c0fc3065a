//! Reduced product of sign, interval and constant information
//!
//! The representation is a normalized bounds triple `{lo, hi, is_nez}`:
//! the interval carries the sign and constant information, and the
//! not-equal-zero bit preserves the one fact an interval cannot express
//! (a hole at zero). After every operation the triple is re-normalized so
//! that each component constrains the others: a constant pins the
//! interval, a nez bit excludes zero endpoints, and contradictory
//! components collapse to bottom.

use super::sign::{SignDomain, SignInterval};
use super::{AbstractDomain, ConstantDomain, IntervalDomain};
use std::fmt;

const MIN: i64 = i64::MIN;
const MAX: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Bounds {
    is_nez: bool,
    lo: i64,
    hi: i64,
}

impl Bounds {
    const TOP: Bounds = Bounds { is_nez: false, lo: MIN, hi: MAX };
    const BOTTOM: Bounds = Bounds { is_nez: true, lo: MAX, hi: MIN };
    const NEZ: Bounds = Bounds { is_nez: true, lo: MIN, hi: MAX };

    fn is_constant(&self) -> bool {
        self.lo == self.hi
    }

    fn is_bottom(&self) -> bool {
        *self == Bounds::BOTTOM
    }

    fn leq(&self, other: &Bounds) -> bool {
        self.is_bottom()
            || (other.lo <= self.lo && self.hi <= other.hi && other.is_nez <= self.is_nez)
    }

    fn normalize(&mut self) {
        if self.is_nez {
            if self.lo == 0 {
                self.lo += 1;
            }
            if self.hi == 0 {
                self.hi -= 1;
            }
        }
        if self.hi < self.lo {
            *self = Bounds::BOTTOM;
        }
        debug_assert!(self.is_normalized());
    }

    fn is_normalized(&self) -> bool {
        // Bottom has one canonical shape.
        if self.hi < self.lo {
            return self.is_bottom();
        }
        // nez cannot be set when 0 is an endpoint, and must be set when 0
        // lies outside the range.
        if self.lo == 0 || self.hi == 0 {
            return !self.is_nez;
        }
        (self.lo <= 0 && self.hi >= 0) || self.is_nez
    }

    fn from_interval(interval: SignInterval) -> Bounds {
        match interval {
            SignInterval::Empty => Bounds::BOTTOM,
            SignInterval::Eqz => Bounds { is_nez: false, lo: 0, hi: 0 },
            SignInterval::Lez => Bounds { is_nez: false, lo: MIN, hi: 0 },
            SignInterval::Ltz => Bounds { is_nez: true, lo: MIN, hi: -1 },
            SignInterval::Gez => Bounds { is_nez: false, lo: 0, hi: MAX },
            SignInterval::Gtz => Bounds { is_nez: true, lo: 1, hi: MAX },
            SignInterval::Nez => Bounds::NEZ,
            SignInterval::All => Bounds::TOP,
        }
    }

    fn from_integer(v: i64) -> Bounds {
        Bounds { is_nez: v != 0, lo: v, hi: v }
    }
}

/// The signed-constant domain used throughout constant propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignedConstantDomain {
    bounds: Bounds,
}

impl SignedConstantDomain {
    pub fn new(v: i64) -> Self {
        SignedConstantDomain { bounds: Bounds::from_integer(v) }
    }

    pub fn from_sign(interval: SignInterval) -> Self {
        SignedConstantDomain { bounds: Bounds::from_interval(interval) }
    }

    /// `[min, max]`, additionally marked nez when zero is outside.
    pub fn from_range(min: i64, max: i64) -> Self {
        assert!(min <= max);
        SignedConstantDomain { bounds: Bounds { is_nez: min > 0 || max < 0, lo: min, hi: max } }
    }

    pub fn nez() -> Self {
        SignedConstantDomain { bounds: Bounds::NEZ }
    }

    pub fn is_nez(&self) -> bool {
        self.bounds.is_nez
    }

    /// The sign component of the product.
    pub fn sign(&self) -> SignDomain {
        SignDomain::new(self.sign_interval())
    }

    pub fn sign_interval(&self) -> SignInterval {
        let b = &self.bounds;
        if b.is_bottom() {
            return SignInterval::Empty;
        }
        if b.lo > 0 {
            return SignInterval::Gtz;
        }
        if b.hi < 0 {
            return SignInterval::Ltz;
        }
        if b.lo == 0 {
            return if b.hi == 0 { SignInterval::Eqz } else { SignInterval::Gez };
        }
        if b.hi == 0 {
            return SignInterval::Lez;
        }
        if b.is_nez {
            return SignInterval::Nez;
        }
        SignInterval::All
    }

    /// The constant component of the product.
    pub fn constant_domain(&self) -> ConstantDomain<i64> {
        match self.get_constant() {
            Some(v) => ConstantDomain::value(v),
            None if self.is_bottom() => ConstantDomain::bottom(),
            None => ConstantDomain::top(),
        }
    }

    /// The interval component of the product.
    pub fn numeric_interval(&self) -> IntervalDomain {
        if self.is_bottom() {
            return IntervalDomain::bottom();
        }
        if self.bounds == Bounds::NEZ {
            return IntervalDomain::top();
        }
        IntervalDomain::finite(self.bounds.lo, self.bounds.hi)
    }

    pub fn get_constant(&self) -> Option<i64> {
        if self.bounds.is_constant() {
            Some(self.bounds.lo)
        } else {
            None
        }
    }

    /// The largest element within the interval.
    pub fn max_element(&self) -> i64 {
        assert!(!self.is_bottom());
        self.bounds.hi
    }

    /// The smallest element within the interval.
    pub fn min_element(&self) -> i64 {
        assert!(!self.is_bottom());
        self.bounds.lo
    }

    /// Meet with the i32 value range.
    pub fn clamp_int(&self) -> Self {
        self.meet(&SignedConstantDomain::from_range(i32::MIN as i64, i32::MAX as i64))
    }

    /// Bits known to be one across every concrete value. Exact when the
    /// domain has degenerated to a single constant; conservatively zero
    /// otherwise.
    pub fn known_one_bits(&self) -> u64 {
        match self.get_constant() {
            Some(v) => v as u64,
            None => 0,
        }
    }

    /// Bits known to be zero across every concrete value. Exact for
    /// constants; for a non-negative range the bits above the highest
    /// possible bit are known zero.
    pub fn known_zero_bits(&self) -> u64 {
        if let Some(v) = self.get_constant() {
            return !(v as u64);
        }
        if !self.is_bottom() && self.bounds.lo >= 0 {
            // All values fit below the leading bit of the upper bound.
            let leading = 64 - (self.bounds.hi as u64).leading_zeros();
            if leading < 64 {
                return !((1u64 << leading) - 1);
            }
        }
        0
    }
}

impl Default for SignedConstantDomain {
    fn default() -> Self {
        Self::top()
    }
}

impl AbstractDomain for SignedConstantDomain {
    fn bottom() -> Self {
        SignedConstantDomain { bounds: Bounds::BOTTOM }
    }

    fn top() -> Self {
        SignedConstantDomain { bounds: Bounds::TOP }
    }

    fn is_bottom(&self) -> bool {
        self.bounds.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.bounds == Bounds::TOP
    }

    fn leq(&self, other: &Self) -> bool {
        self.bounds.leq(&other.bounds)
    }

    fn join_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = *other;
            return;
        }
        self.bounds.lo = self.bounds.lo.min(other.bounds.lo);
        self.bounds.hi = self.bounds.hi.max(other.bounds.hi);
        self.bounds.is_nez &= other.bounds.is_nez;
        debug_assert!(self.bounds.is_normalized());
    }

    fn meet_with(&mut self, other: &Self) {
        if self.is_bottom() {
            return;
        }
        if other.is_bottom() {
            *self = Self::bottom();
            return;
        }
        self.bounds.lo = self.bounds.lo.max(other.bounds.lo);
        self.bounds.hi = self.bounds.hi.min(other.bounds.hi);
        self.bounds.is_nez |= other.bounds.is_nez;
        self.bounds.normalize();
    }

    fn widen_with(&mut self, other: &Self) {
        // The interval component has infinite ascending chains, so an
        // unstable endpoint jumps to its infinity; nez only survives if
        // both sides agree.
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = *other;
            return;
        }
        if other.bounds.lo < self.bounds.lo {
            self.bounds.lo = MIN;
        }
        if other.bounds.hi > self.bounds.hi {
            self.bounds.hi = MAX;
        }
        self.bounds.is_nez &= other.bounds.is_nez;
        self.bounds.normalize();
    }
}

impl fmt::Display for SignedConstantDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            return write!(f, "_|_");
        }
        let min = self.min_element();
        let max = self.max_element();
        if min == MIN && max == MAX {
            return write!(f, "{}", if self.is_nez() { "NEZ" } else { "T" });
        }
        if min == MIN {
            if max == -1 {
                return write!(f, "LTZ");
            }
            if max == 0 {
                return write!(f, "LEZ");
            }
        }
        if max == MAX {
            if min == 1 {
                return write!(f, "GTZ");
            }
            if min == 0 {
                return write!(f, "GEZ");
            }
        }
        let show = |v: i64| -> String {
            if v == MIN {
                "min".to_string()
            } else if v == MAX {
                "max".to_string()
            } else {
                v.to_string()
            }
        };
        if min == max {
            return write!(f, "{}", show(min));
        }
        if min < 0 && max > 0 && self.is_nez() {
            write!(f, "[{},-1]U[1,{}]", show(min), show(max))
        } else {
            write!(f, "[{},{}]", show(min), show(max))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_constant_construction() {
        let five = SignedConstantDomain::new(5);
        assert_eq!(five.get_constant(), Some(5));
        assert!(five.is_nez());
        assert_eq!(five.sign_interval(), SignInterval::Gtz);
    }

    #[test]
    fn test_join_loses_constant_keeps_range() {
        let a = SignedConstantDomain::new(1);
        let b = SignedConstantDomain::new(3);
        let joined = a.join(&b);
        assert_eq!(joined.get_constant(), None);
        assert_eq!(joined.min_element(), 1);
        assert_eq!(joined.max_element(), 3);
        assert!(joined.is_nez());
    }

    #[test]
    fn test_join_through_zero_drops_nez() {
        let a = SignedConstantDomain::new(-1);
        let b = SignedConstantDomain::new(1);
        let joined = a.join(&b);
        // The interval spans zero, but both inputs were nez.
        assert!(joined.is_nez());
        assert_eq!(joined.to_string(), "[-1,-1]U[1,1]");

        let with_zero = joined.join(&SignedConstantDomain::new(0));
        assert!(!with_zero.is_nez());
    }

    #[test]
    fn test_meet_reduction_to_bottom() {
        // sign and interval disagreeing collapses to bottom
        let gtz = SignedConstantDomain::from_sign(SignInterval::Gtz);
        let neg = SignedConstantDomain::new(-3);
        assert!(gtz.meet(&neg).is_bottom());
    }

    #[test]
    fn test_meet_nez_excludes_zero_endpoint() {
        let gez = SignedConstantDomain::from_sign(SignInterval::Gez);
        let nez = SignedConstantDomain::nez();
        let met = gez.meet(&nez);
        // [0, max] with a hole at zero normalizes to [1, max].
        assert_eq!(met.sign_interval(), SignInterval::Gtz);
        assert_eq!(met.min_element(), 1);
    }

    #[test]
    fn test_widening_stabilizes_growing_interval() {
        let mut state = SignedConstantDomain::new(0);
        state.widen_with(&SignedConstantDomain::from_range(0, 1));
        let after = state;
        state.widen_with(&SignedConstantDomain::from_range(0, 100));
        assert_eq!(state, after);
        assert_eq!(state.max_element(), MAX);
        assert_eq!(state.min_element(), 0);
    }

    #[test]
    fn test_known_bits_for_constant() {
        let v = SignedConstantDomain::new(0b1010);
        assert_eq!(v.known_one_bits(), 0b1010);
        assert_eq!(v.known_zero_bits(), !0b1010u64);
        assert_eq!(SignedConstantDomain::top().known_one_bits(), 0);
    }

    #[test]
    fn test_clamp_int() {
        let wide = SignedConstantDomain::from_range(i64::MIN, 7);
        let clamped = wide.clamp_int();
        assert_eq!(clamped.min_element(), i32::MIN as i64);
        assert_eq!(clamped.max_element(), 7);
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(SignedConstantDomain::top().to_string(), "T");
        assert_eq!(SignedConstantDomain::bottom().to_string(), "_|_");
        assert_eq!(SignedConstantDomain::nez().to_string(), "NEZ");
        assert_eq!(SignedConstantDomain::from_sign(SignInterval::Gtz).to_string(), "GTZ");
        assert_eq!(SignedConstantDomain::new(42).to_string(), "42");
        assert_eq!(SignedConstantDomain::from_range(1, 5).to_string(), "[1,5]");
    }
}
