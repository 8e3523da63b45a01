//! Placement relations (Milestone 0): incremental set/map machinery shared by
//! the binder and the projector.
//!
//! - [`differencer`]: whole-value snapshots in, elemental add/remove out
//! - [`hash_domain`]: equality and hashing for keys without native `Hash`
//! - [`factorer`]: invertible `whole <-> (part, rest)` decompositions
//! - [`factored`], [`indexed`]: relations stored behind such a decomposition
//! - [`relay`]: latest-value cache that fans out to subscribers

#![forbid(unsafe_code)]

pub mod differencer;
pub mod factored;
pub mod factorer;
pub mod hash_domain;
pub mod indexed;
pub mod relay;

pub use differencer::{MapDifferencer, SinglePlacementSliceSetReducer, SliceDifferencer};
pub use factored::{GenericFactoredMap, PutOutcome};
pub use factorer::{Factorer, Rotator};
pub use hash_domain::{DomainKey, DomainMap, DomainSet, HashDomain, NativeDomain, SetDomain, UpsyncDomain};
pub use indexed::{IndexedRelation, Leaf, Relation, SingleIndexedRelation2, SingleIndexedRelation3, SingleIndexedRelation4};
pub use relay::{RelayMap, RelayReceiver};
