//! Abstract partitions
//!
//! A partition maps labels to abstract values and denotes the *join* of
//! the states observed over all execution paths reaching each label: an
//! unbound label is bottom (no path reaches it), and the whole partition
//! is bottom only when no label is bound. This is the right shape for
//! whole-program summaries -- the state of a method's return value is the
//! join over every return instruction, and a method that never returns
//! stays at bottom without dragging anything else down. Contrast with
//! [`super::environment`], where the map denotes a meet along one path.

use super::AbstractDomain;
use hashbrown::HashMap;
use std::fmt;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub enum HashedAbstractPartition<K: Clone + Eq + Hash, D: AbstractDomain> {
    Value(HashMap<K, D>),
    Top,
}

impl<K: Clone + Eq + Hash, D: AbstractDomain> Default for HashedAbstractPartition<K, D> {
    fn default() -> Self {
        Self::bottom()
    }
}

impl<K: Clone + Eq + Hash, D: AbstractDomain> HashedAbstractPartition<K, D> {
    /// The value bound to `label`; bottom when unbound.
    pub fn get(&self, label: &K) -> D {
        match self {
            Self::Top => D::top(),
            Self::Value(map) => map.get(label).cloned().unwrap_or_else(D::bottom),
        }
    }

    /// Binds `label` to `value`. Binding to bottom erases the entry.
    pub fn set(&mut self, label: K, value: D) {
        let Self::Value(map) = self else {
            return;
        };
        if value.is_bottom() {
            map.remove(&label);
        } else {
            map.insert(label, value);
        }
    }

    /// Applies `f` to the value bound at `label` (bottom when unbound)
    /// and rebinds the result.
    pub fn update(&mut self, label: &K, f: impl FnOnce(&D) -> D) {
        if matches!(self, Self::Top) {
            return;
        }
        let current = self.get(label);
        self.set(label.clone(), f(&current));
    }

    /// Joins `value` into the binding at `label`.
    pub fn join_at(&mut self, label: &K, value: &D) {
        self.update(label, |current| current.clone().join(value));
    }

    /// The number of explicit (non-bottom) bindings.
    pub fn size(&self) -> usize {
        match self {
            Self::Top => 0,
            Self::Value(map) => map.len(),
        }
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&K, &D)> {
        match self {
            Self::Top => None,
            Self::Value(map) => Some(map.iter()),
        }
        .into_iter()
        .flatten()
    }

    fn pointwise_join(&mut self, other: &Self, combine: impl Fn(&mut D, &D)) {
        match (&mut *self, other) {
            (Self::Top, _) => {}
            (_, Self::Top) => *self = Self::Top,
            (Self::Value(map), Self::Value(other_map)) => {
                for (label, other_value) in other_map {
                    match map.get_mut(label) {
                        None => {
                            map.insert(label.clone(), other_value.clone());
                        }
                        Some(existing) => combine(existing, other_value),
                    }
                }
            }
        }
    }

    fn pointwise_meet(&mut self, other: &Self, combine: impl Fn(&mut D, &D)) {
        match (&mut *self, other) {
            (_, Self::Top) => {}
            (Self::Top, _) => *self = other.clone(),
            (Self::Value(map), Self::Value(other_map)) => {
                let labels: Vec<K> = map.keys().cloned().collect();
                for label in labels {
                    match other_map.get(&label) {
                        None => {
                            map.remove(&label);
                        }
                        Some(other_value) => {
                            let existing = map.get_mut(&label).expect("label just listed");
                            combine(existing, other_value);
                            if existing.is_bottom() {
                                map.remove(&label);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<K: Clone + Eq + Hash, D: AbstractDomain> PartialEq for HashedAbstractPartition<K, D> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Top, Self::Top) => true,
            (Self::Value(a), Self::Value(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            _ => false,
        }
    }
}

impl<K: Clone + Eq + Hash, D: AbstractDomain> AbstractDomain for HashedAbstractPartition<K, D> {
    fn bottom() -> Self {
        Self::Value(HashMap::new())
    }

    fn top() -> Self {
        Self::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, Self::Value(map) if map.is_empty())
    }

    fn is_top(&self) -> bool {
        matches!(self, Self::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (_, Self::Top) => true,
            (Self::Top, _) => false,
            (Self::Value(map), Self::Value(_)) => map
                .iter()
                .all(|(label, value)| value.leq(&other.get(label))),
        }
    }

    fn join_with(&mut self, other: &Self) {
        self.pointwise_join(other, |a, b| a.join_with(b));
    }

    fn widen_with(&mut self, other: &Self) {
        self.pointwise_join(other, |a, b| a.widen_with(b));
    }

    fn meet_with(&mut self, other: &Self) {
        self.pointwise_meet(other, |a, b| a.meet_with(b));
    }

    fn narrow_with(&mut self, other: &Self) {
        self.pointwise_meet(other, |a, b| a.narrow_with(b));
    }
}

impl<K, D> fmt::Display for HashedAbstractPartition<K, D>
where
    K: Clone + Eq + Hash + fmt::Display + Ord,
    D: AbstractDomain + fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Top => write!(f, "T"),
            Self::Value(map) => {
                let mut entries: Vec<(&K, &D)> = map.iter().collect();
                entries.sort_by_key(|(k, _)| *k);
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} -> {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}
