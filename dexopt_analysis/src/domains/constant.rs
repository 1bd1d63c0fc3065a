//! The flat constant lattice
//!
//! `⊤ ⊒ value(t) ⊒ ⊥` for every `t`; distinct values are incomparable.
//! This is the workhorse domain for interned references (strings, types,
//! fields, heap pointers) and for plain integers where no interval
//! reasoning is wanted.

use super::AbstractDomain;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantDomain<T: Clone + PartialEq> {
    Bottom,
    Value(T),
    Top,
}

impl<T: Clone + PartialEq> ConstantDomain<T> {
    pub fn value(v: T) -> Self {
        ConstantDomain::Value(v)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, ConstantDomain::Value(_))
    }

    pub fn get_constant(&self) -> Option<&T> {
        match self {
            ConstantDomain::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: Clone + PartialEq> AbstractDomain for ConstantDomain<T> {
    fn bottom() -> Self {
        ConstantDomain::Bottom
    }

    fn top() -> Self {
        ConstantDomain::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, ConstantDomain::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, ConstantDomain::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstantDomain::Bottom, _) => true,
            (_, ConstantDomain::Top) => true,
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) => a == b,
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        match (&*self, other) {
            (_, ConstantDomain::Bottom) => {}
            (ConstantDomain::Bottom, _) => *self = other.clone(),
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) if a == b => {}
            _ => *self = ConstantDomain::Top,
        }
    }

    fn meet_with(&mut self, other: &Self) {
        match (&*self, other) {
            (_, ConstantDomain::Top) => {}
            (ConstantDomain::Top, _) => *self = other.clone(),
            (ConstantDomain::Value(a), ConstantDomain::Value(b)) if a == b => {}
            _ => *self = ConstantDomain::Bottom,
        }
    }
}

impl<T: Clone + PartialEq + fmt::Display> fmt::Display for ConstantDomain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantDomain::Bottom => write!(f, "_|_"),
            ConstantDomain::Top => write!(f, "T"),
            ConstantDomain::Value(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_lattice_order() {
        let bot: ConstantDomain<i64> = ConstantDomain::bottom();
        let one = ConstantDomain::value(1i64);
        let two = ConstantDomain::value(2i64);
        let top: ConstantDomain<i64> = ConstantDomain::top();

        assert!(bot.leq(&one));
        assert!(one.leq(&top));
        assert!(one.leq(&one));
        assert!(!one.leq(&two));
        assert!(!two.leq(&one));
        assert!(!top.leq(&one));
    }

    #[test]
    fn test_join_of_distinct_values_is_top() {
        let one = ConstantDomain::value(1i64);
        let two = ConstantDomain::value(2i64);
        assert!(one.clone().join(&two).is_top());
        assert_eq!(one.clone().join(&one), one);
    }

    #[test]
    fn test_meet_of_distinct_values_is_bottom() {
        let one = ConstantDomain::value(1i64);
        let two = ConstantDomain::value(2i64);
        assert!(one.clone().meet(&two).is_bottom());
        let top: ConstantDomain<i64> = ConstantDomain::top();
        assert_eq!(top.meet(&one), one);
    }
}
