//! Abstract domains
//!
//! Every domain is a lattice of compile-time approximations of runtime
//! values. All operations are monotonic in their arguments; the laws
//! (commutativity and associativity of join, the ordering laws relating
//! join/meet to leq) are property-tested in `tests/domain_laws.rs`.

pub mod constant;
pub mod environment;
pub mod interval;
pub mod partition;
pub mod patricia;
pub mod powerset;
pub mod sign;
pub mod signed_constant;

pub use constant::ConstantDomain;
pub use environment::PatriciaTreeMapEnvironment;
pub use interval::IntervalDomain;
pub use partition::HashedAbstractPartition;
pub use patricia::{PatriciaTreeMap, PatriciaTreeSet};
pub use powerset::{LivenessDomain, PowersetDomain};
pub use sign::{SignDomain, SignInterval};
pub use signed_constant::SignedConstantDomain;

/// The lattice interface every abstract domain implements.
///
/// The mutating forms (`join_with` and friends) are the primitive
/// operations so that environments can update bindings in place; the value
/// forms are provided for convenience.
pub trait AbstractDomain: Clone + PartialEq {
    fn bottom() -> Self;
    fn top() -> Self;

    fn is_bottom(&self) -> bool;
    fn is_top(&self) -> bool;

    /// The partial order of the lattice.
    fn leq(&self, other: &Self) -> bool;

    fn join_with(&mut self, other: &Self);
    fn meet_with(&mut self, other: &Self);

    /// Widening. Must eventually stabilize any increasing chain. Domains
    /// of finite height can leave the default, which is the join.
    fn widen_with(&mut self, other: &Self) {
        self.join_with(other);
    }

    /// Narrowing. Domains that don't refine post-fixpoints can leave the
    /// default, which is the meet.
    fn narrow_with(&mut self, other: &Self) {
        self.meet_with(other);
    }

    fn set_to_bottom(&mut self) {
        *self = Self::bottom();
    }

    fn set_to_top(&mut self) {
        *self = Self::top();
    }

    fn join(mut self, other: &Self) -> Self {
        self.join_with(other);
        self
    }

    fn meet(mut self, other: &Self) -> Self {
        self.meet_with(other);
        self
    }
}
