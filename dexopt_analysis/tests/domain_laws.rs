//! Property tests for the lattice laws every abstract domain must satisfy
//!
//! For any a, b, c in any domain:
//!   a v b = b v a
//!   (a v b) v c = a v (b v c)
//!   a <= a v b
//!   a ^ b <= a
//!   bottom <= a <= top
//!   a <= b and b <= a implies a = b

use dexopt_analysis::domains::{
    AbstractDomain, ConstantDomain, IntervalDomain, PowersetDomain, SignDomain, SignInterval,
    SignedConstantDomain,
};
use proptest::prelude::*;

fn sign_strategy() -> impl Strategy<Value = SignDomain> {
    prop_oneof![
        Just(SignDomain::bottom()),
        Just(SignDomain::top()),
        Just(SignDomain::new(SignInterval::Ltz)),
        Just(SignDomain::new(SignInterval::Gtz)),
        Just(SignDomain::new(SignInterval::Eqz)),
        Just(SignDomain::new(SignInterval::Gez)),
        Just(SignDomain::new(SignInterval::Lez)),
        Just(SignDomain::new(SignInterval::Nez)),
    ]
}

fn interval_strategy() -> impl Strategy<Value = IntervalDomain> {
    prop_oneof![
        Just(IntervalDomain::bottom()),
        Just(IntervalDomain::top()),
        (-100i64..100).prop_map(IntervalDomain::singleton),
        (-100i64..100, 0i64..50).prop_map(|(lo, w)| IntervalDomain::finite(lo, lo + w)),
        (-100i64..100).prop_map(IntervalDomain::bounded_below),
        (-100i64..100).prop_map(IntervalDomain::bounded_above),
    ]
}

fn signed_constant_strategy() -> impl Strategy<Value = SignedConstantDomain> {
    prop_oneof![
        Just(SignedConstantDomain::bottom()),
        Just(SignedConstantDomain::top()),
        Just(SignedConstantDomain::nez()),
        (-100i64..100).prop_map(SignedConstantDomain::new),
        (-100i64..100, 0i64..50).prop_map(|(lo, w)| SignedConstantDomain::from_range(lo, lo + w)),
        prop_oneof![
            Just(SignInterval::Ltz),
            Just(SignInterval::Gtz),
            Just(SignInterval::Eqz),
            Just(SignInterval::Gez),
            Just(SignInterval::Lez),
        ]
        .prop_map(SignedConstantDomain::from_sign),
    ]
}

fn constant_strategy() -> impl Strategy<Value = ConstantDomain<i64>> {
    prop_oneof![
        Just(ConstantDomain::bottom()),
        Just(ConstantDomain::top()),
        (-10i64..10).prop_map(ConstantDomain::value),
    ]
}

fn powerset_strategy() -> impl Strategy<Value = PowersetDomain<u8>> {
    prop_oneof![
        Just(PowersetDomain::bottom()),
        Just(PowersetDomain::top()),
        proptest::collection::hash_set(0u8..16, 0..6)
            .prop_map(|s| PowersetDomain::value(s)),
    ]
}

macro_rules! lattice_laws {
    ($name:ident, $strategy:expr, $ty:ty) => {
        mod $name {
            use super::*;

            proptest! {
                #[test]
                fn join_is_commutative(a in $strategy, b in $strategy) {
                    prop_assert_eq!(a.clone().join(&b), b.clone().join(&a));
                }

                #[test]
                fn join_is_associative(a in $strategy, b in $strategy, c in $strategy) {
                    let left = a.clone().join(&b).join(&c);
                    let right = a.clone().join(&b.clone().join(&c));
                    prop_assert_eq!(left, right);
                }

                #[test]
                fn join_is_an_upper_bound(a in $strategy, b in $strategy) {
                    let joined = a.clone().join(&b);
                    prop_assert!(a.leq(&joined));
                    prop_assert!(b.leq(&joined));
                }

                #[test]
                fn meet_is_a_lower_bound(a in $strategy, b in $strategy) {
                    let met = a.clone().meet(&b);
                    prop_assert!(met.leq(&a));
                    prop_assert!(met.leq(&b));
                }

                #[test]
                fn extremes(a in $strategy) {
                    prop_assert!(<$ty>::bottom().leq(&a));
                    prop_assert!(a.leq(&<$ty>::top()));
                }

                #[test]
                fn leq_is_reflexive(a in $strategy) {
                    prop_assert!(a.leq(&a));
                }

                #[test]
                fn leq_antisymmetry(a in $strategy, b in $strategy) {
                    if a.leq(&b) && b.leq(&a) {
                        prop_assert_eq!(a, b);
                    }
                }

                #[test]
                fn widening_is_an_upper_bound(a in $strategy, b in $strategy) {
                    let mut widened = a.clone();
                    widened.widen_with(&b);
                    prop_assert!(a.leq(&widened));
                    prop_assert!(b.leq(&widened));
                }

                #[test]
                fn join_idempotent(a in $strategy) {
                    prop_assert_eq!(a.clone().join(&a), a);
                }
            }
        }
    };
}

lattice_laws!(sign_laws, sign_strategy(), SignDomain);
lattice_laws!(interval_laws, interval_strategy(), IntervalDomain);
lattice_laws!(signed_constant_laws, signed_constant_strategy(), SignedConstantDomain);
lattice_laws!(constant_laws, constant_strategy(), ConstantDomain<i64>);
lattice_laws!(powerset_laws, powerset_strategy(), PowersetDomain<u8>);
