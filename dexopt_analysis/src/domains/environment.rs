//! Abstract environments over patricia-tree maps
//!
//! An environment maps variables (registers, interned field ids) to
//! abstract values and denotes the *meet* of the facts recorded along one
//! execution path: an unbound variable is unconstrained (top), and any
//! variable bound to bottom makes the whole environment bottom
//! (unreachable). Contrast with [`super::partition`], where the map
//! denotes a join over many paths.
//!
//! Only non-top values are stored, so leq/join/meet operate on bindings
//! pointwise with absence meaning top.

use super::patricia::PatriciaTreeMap;
use super::AbstractDomain;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum PatriciaTreeMapEnvironment<V: AbstractDomain> {
    Bottom,
    Value(PatriciaTreeMap<V>),
}

impl<V: AbstractDomain> Default for PatriciaTreeMapEnvironment<V> {
    fn default() -> Self {
        Self::top()
    }
}

impl<V: AbstractDomain> PatriciaTreeMapEnvironment<V> {
    /// The value bound to `key`; top when unbound.
    pub fn get(&self, key: u32) -> V {
        match self {
            Self::Bottom => V::bottom(),
            Self::Value(map) => map.get(key).cloned().unwrap_or_else(V::top),
        }
    }

    /// Binds `key` to `value`. Binding to bottom collapses the whole
    /// environment; binding to top erases the entry.
    pub fn set(&mut self, key: u32, value: V) {
        let Self::Value(map) = self else {
            return;
        };
        if value.is_bottom() {
            *self = Self::Bottom;
        } else if value.is_top() {
            map.remove(key);
        } else {
            map.insert(key, value);
        }
    }

    /// Applies `f` to the value bound at `key` (top when unbound) and
    /// rebinds the result.
    pub fn update(&mut self, key: u32, f: impl FnOnce(&V) -> V) {
        let current = self.get(key);
        if matches!(self, Self::Bottom) {
            return;
        }
        self.set(key, f(&current));
    }

    /// The number of explicit (non-top) bindings.
    pub fn size(&self) -> usize {
        match self {
            Self::Bottom => 0,
            Self::Value(map) => map.len(),
        }
    }

    pub fn bindings(&self) -> impl Iterator<Item = (u32, &V)> {
        match self {
            Self::Bottom => None,
            Self::Value(map) => Some(map.iter()),
        }
        .into_iter()
        .flatten()
    }

    fn pointwise_narrowing(
        &mut self,
        other: &Self,
        combine: impl Fn(&mut V, &V),
    ) {
        // Meet-like combine: bindings from either side survive, keys bound
        // on both sides are combined, and a bottom result poisons the
        // whole environment.
        let mut poisoned = false;
        match (&mut *self, other) {
            (Self::Bottom, _) => return,
            (_, Self::Bottom) => {
                *self = Self::Bottom;
                return;
            }
            (Self::Value(map), Self::Value(other_map)) => {
                for (key, other_value) in other_map.iter() {
                    match map.get(key).cloned() {
                        None => map.insert(key, other_value.clone()),
                        Some(mut combined) => {
                            combine(&mut combined, other_value);
                            if combined.is_bottom() {
                                poisoned = true;
                                break;
                            }
                            map.insert(key, combined);
                        }
                    }
                }
            }
        }
        if poisoned {
            *self = Self::Bottom;
        }
    }

    fn pointwise_extrapolation(
        &mut self,
        other: &Self,
        combine: impl Fn(&mut V, &V),
    ) {
        // Join-like combine: only keys bound on both sides survive, and a
        // top result erases the binding.
        match (&mut *self, other) {
            (Self::Bottom, _) => *self = other.clone(),
            (_, Self::Bottom) => {}
            (Self::Value(map), Self::Value(other_map)) => {
                let keys: Vec<u32> = map.keys().collect();
                for key in keys {
                    match other_map.get(key) {
                        None => map.remove(key),
                        Some(other_value) => {
                            let mut combined = map.get(key).cloned().expect("key just listed");
                            combine(&mut combined, other_value);
                            if combined.is_top() {
                                map.remove(key);
                            } else {
                                map.insert(key, combined);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<V: AbstractDomain> AbstractDomain for PatriciaTreeMapEnvironment<V> {
    fn bottom() -> Self {
        Self::Bottom
    }

    fn top() -> Self {
        Self::Value(PatriciaTreeMap::new())
    }

    fn is_bottom(&self) -> bool {
        matches!(self, Self::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, Self::Value(map) if map.is_empty())
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bottom, _) => true,
            (_, Self::Bottom) => false,
            (Self::Value(self_map), Self::Value(_)) => {
                // self(k) <= other(k) for every k. Keys unbound in other
                // are top there; keys unbound in self are top here and can
                // only be <= a binding that is also top, which is never
                // stored.
                other.bindings().all(|(key, other_value)| {
                    self_map
                        .get(key)
                        .map(|v| v.leq(other_value))
                        .unwrap_or(false)
                })
            }
        }
    }

    fn join_with(&mut self, other: &Self) {
        self.pointwise_extrapolation(other, |a, b| a.join_with(b));
    }

    fn widen_with(&mut self, other: &Self) {
        self.pointwise_extrapolation(other, |a, b| a.widen_with(b));
    }

    fn meet_with(&mut self, other: &Self) {
        self.pointwise_narrowing(other, |a, b| a.meet_with(b));
    }

    fn narrow_with(&mut self, other: &Self) {
        self.pointwise_narrowing(other, |a, b| a.narrow_with(b));
    }
}

impl<V: AbstractDomain + fmt::Display> fmt::Display for PatriciaTreeMapEnvironment<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bottom => write!(f, "_|_"),
            Self::Value(map) => {
                let mut entries: Vec<(u32, &V)> = map.iter().collect();
                entries.sort_by_key(|(k, _)| *k);
                write!(f, "[")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} -> {}", k, v)?;
                }
                write!(f, "]")
            }
        }
    }
}
