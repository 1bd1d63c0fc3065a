//! Signedness of integer values
//!
//! This module deals with the signedness of integer types, representing
//! them as intervals with zero as an endpoint. The lattice is finite:
//!
//! ```text
//!              ALL
//!           /   |   \
//!        LEZ   NEZ   GEZ
//!        / \   / \   / \
//!      LTZ  EQZ     GTZ
//!           \   |   /
//!             EMPTY
//! ```
//!
//! Elements are encoded as bit vectors over the three atoms
//! {negative, zero, positive}, so join, meet and the partial order are
//! single bitwise operations.

use super::AbstractDomain;
use bitflags::bitflags;
use std::fmt;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct SignBits: u8 {
        const NEG = 0b001;
        const ZERO = 0b010;
        const POS = 0b100;
    }
}

/// The named points of the sign lattice, used when constructing or
/// inspecting a [`SignDomain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInterval {
    Empty, // Ø -- bottom
    Ltz,   // (-inf, 0)
    Gtz,   // (0, +inf)
    Eqz,   // {0}
    Gez,   // [0, +inf)
    Lez,   // (-inf, 0]
    Nez,   // (-inf, 0) u (0, +inf)
    All,   // (-inf, +inf) -- top
}

/// The sign abstract domain. Join and meet are the equivalents of interval
/// union and intersection respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignDomain(SignBits);

impl SignDomain {
    pub fn new(interval: SignInterval) -> Self {
        let bits = match interval {
            SignInterval::Empty => SignBits::empty(),
            SignInterval::Ltz => SignBits::NEG,
            SignInterval::Gtz => SignBits::POS,
            SignInterval::Eqz => SignBits::ZERO,
            SignInterval::Gez => SignBits::ZERO | SignBits::POS,
            SignInterval::Lez => SignBits::NEG | SignBits::ZERO,
            SignInterval::Nez => SignBits::NEG | SignBits::POS,
            SignInterval::All => SignBits::all(),
        };
        SignDomain(bits)
    }

    pub fn from_int(v: i64) -> Self {
        if v < 0 {
            Self::new(SignInterval::Ltz)
        } else if v == 0 {
            Self::new(SignInterval::Eqz)
        } else {
            Self::new(SignInterval::Gtz)
        }
    }

    pub fn interval(&self) -> SignInterval {
        match (
            self.0.contains(SignBits::NEG),
            self.0.contains(SignBits::ZERO),
            self.0.contains(SignBits::POS),
        ) {
            (false, false, false) => SignInterval::Empty,
            (true, false, false) => SignInterval::Ltz,
            (false, false, true) => SignInterval::Gtz,
            (false, true, false) => SignInterval::Eqz,
            (false, true, true) => SignInterval::Gez,
            (true, true, false) => SignInterval::Lez,
            (true, false, true) => SignInterval::Nez,
            (true, true, true) => SignInterval::All,
        }
    }

    /// True if the concrete value `v` is contained in this sign class.
    pub fn contains(&self, v: i64) -> bool {
        SignDomain::from_int(v).leq(self)
    }
}

impl AbstractDomain for SignDomain {
    fn bottom() -> Self {
        SignDomain(SignBits::empty())
    }

    fn top() -> Self {
        SignDomain(SignBits::all())
    }

    fn is_bottom(&self) -> bool {
        self.0.is_empty()
    }

    fn is_top(&self) -> bool {
        self.0 == SignBits::all()
    }

    fn leq(&self, other: &Self) -> bool {
        other.0.contains(self.0)
    }

    fn join_with(&mut self, other: &Self) {
        self.0 |= other.0;
    }

    fn meet_with(&mut self, other: &Self) {
        self.0 &= other.0;
    }
}

impl fmt::Display for SignDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.interval() {
            SignInterval::Empty => "_|_",
            SignInterval::Ltz => "LTZ",
            SignInterval::Gtz => "GTZ",
            SignInterval::Eqz => "EQZ",
            SignInterval::Gez => "GEZ",
            SignInterval::Lez => "LEZ",
            SignInterval::Nez => "NEZ",
            SignInterval::All => "T",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_lattice_extremes() {
        assert!(SignDomain::bottom().is_bottom());
        assert!(SignDomain::top().is_top());
        assert!(SignDomain::bottom().leq(&SignDomain::new(SignInterval::Ltz)));
        assert!(SignDomain::new(SignInterval::Gez).leq(&SignDomain::top()));
    }

    #[rstest]
    #[case(SignInterval::Ltz, SignInterval::Eqz, SignInterval::Lez)]
    #[case(SignInterval::Gtz, SignInterval::Eqz, SignInterval::Gez)]
    #[case(SignInterval::Ltz, SignInterval::Gtz, SignInterval::Nez)]
    #[case(SignInterval::Lez, SignInterval::Gez, SignInterval::All)]
    fn test_join_table(
        #[case] a: SignInterval,
        #[case] b: SignInterval,
        #[case] expected: SignInterval,
    ) {
        let joined = SignDomain::new(a).join(&SignDomain::new(b));
        assert_eq!(joined.interval(), expected);
    }

    #[rstest]
    #[case(SignInterval::Lez, SignInterval::Gez, SignInterval::Eqz)]
    #[case(SignInterval::Nez, SignInterval::Gez, SignInterval::Gtz)]
    #[case(SignInterval::Ltz, SignInterval::Gtz, SignInterval::Empty)]
    fn test_meet_table(
        #[case] a: SignInterval,
        #[case] b: SignInterval,
        #[case] expected: SignInterval,
    ) {
        let met = SignDomain::new(a).meet(&SignDomain::new(b));
        assert_eq!(met.interval(), expected);
    }

    #[test]
    fn test_contains() {
        assert!(SignDomain::new(SignInterval::Gez).contains(0));
        assert!(SignDomain::new(SignInterval::Gez).contains(5));
        assert!(!SignDomain::new(SignInterval::Gez).contains(-5));
        assert!(SignDomain::new(SignInterval::Nez).contains(-1));
        assert!(!SignDomain::new(SignInterval::Nez).contains(0));
    }
}
