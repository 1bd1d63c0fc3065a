//! Powerset domains
//!
//! Sets of elements ordered by inclusion, with join = union and
//! meet = intersection. The liveness analysis instantiates this over
//! virtual registers.

use super::AbstractDomain;
use hashbrown::HashSet;
use std::fmt;
use std::hash::Hash;

/// The set of live virtual registers at a program point.
pub type LivenessDomain = PowersetDomain<u32>;

#[derive(Debug, Clone)]
pub enum PowersetDomain<T: Clone + Eq + Hash> {
    Bottom,
    Value(HashSet<T>),
    Top,
}

impl<T: Clone + Eq + Hash> PowersetDomain<T> {
    pub fn value(elements: impl IntoIterator<Item = T>) -> Self {
        PowersetDomain::Value(elements.into_iter().collect())
    }

    /// Adds an element. No-op on top (already everything) and on bottom
    /// (unreachable states stay unreachable).
    pub fn add(&mut self, element: T) {
        if let PowersetDomain::Value(set) = self {
            set.insert(element);
        }
    }

    /// Removes an element. No-op on bottom; a removal from top would need
    /// a co-finite representation, so top saturates too.
    pub fn remove(&mut self, element: &T) {
        if let PowersetDomain::Value(set) = self {
            set.remove(element);
        }
    }

    pub fn contains(&self, element: &T) -> bool {
        match self {
            PowersetDomain::Bottom => false,
            PowersetDomain::Top => true,
            PowersetDomain::Value(set) => set.contains(element),
        }
    }

    /// Iterates the elements of a finite value; empty for bottom.
    /// Asserts on top, which has no finite enumeration.
    pub fn elements(&self) -> impl Iterator<Item = &T> {
        match self {
            PowersetDomain::Top => panic!("cannot enumerate the top powerset"),
            PowersetDomain::Bottom => None.into_iter().flatten(),
            PowersetDomain::Value(set) => Some(set.iter()).into_iter().flatten(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PowersetDomain::Bottom => 0,
            PowersetDomain::Top => panic!("cannot size the top powerset"),
            PowersetDomain::Value(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PowersetDomain::Bottom => true,
            PowersetDomain::Top => false,
            PowersetDomain::Value(set) => set.is_empty(),
        }
    }
}

impl<T: Clone + Eq + Hash> PartialEq for PowersetDomain<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PowersetDomain::Bottom, PowersetDomain::Bottom) => true,
            (PowersetDomain::Top, PowersetDomain::Top) => true,
            (PowersetDomain::Value(a), PowersetDomain::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Clone + Eq + Hash> AbstractDomain for PowersetDomain<T> {
    fn bottom() -> Self {
        PowersetDomain::Bottom
    }

    fn top() -> Self {
        PowersetDomain::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, PowersetDomain::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, PowersetDomain::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (PowersetDomain::Bottom, _) => true,
            (_, PowersetDomain::Top) => true,
            (PowersetDomain::Value(a), PowersetDomain::Value(b)) => a.is_subset(b),
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        match (&mut *self, other) {
            (_, PowersetDomain::Bottom) => {}
            (PowersetDomain::Bottom, _) => *self = other.clone(),
            (PowersetDomain::Top, _) => {}
            (_, PowersetDomain::Top) => *self = PowersetDomain::Top,
            (PowersetDomain::Value(a), PowersetDomain::Value(b)) => {
                a.extend(b.iter().cloned());
            }
        }
    }

    fn meet_with(&mut self, other: &Self) {
        match (&mut *self, other) {
            (_, PowersetDomain::Top) => {}
            (PowersetDomain::Top, _) => *self = other.clone(),
            (PowersetDomain::Bottom, _) => {}
            (_, PowersetDomain::Bottom) => *self = PowersetDomain::Bottom,
            (PowersetDomain::Value(a), PowersetDomain::Value(b)) => {
                a.retain(|x| b.contains(x));
            }
        }
    }
}

impl<T: Clone + Eq + Hash + Ord + fmt::Display> fmt::Display for PowersetDomain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowersetDomain::Bottom => write!(f, "_|_"),
            PowersetDomain::Top => write!(f, "T"),
            PowersetDomain::Value(set) => {
                let mut sorted: Vec<&T> = set.iter().collect();
                sorted.sort();
                write!(f, "{{")?;
                for (i, v) in sorted.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
        }
    }
}
