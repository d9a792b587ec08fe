//! Routing & Affinity
//!
//! Decides which node receives the next unit of work for a stage.
//!
//! ## Policies
//! - **Keyed** work is sticky: the first resolution of `(session, stage, key)`
//!   finds the node already holding that unit's state (or picks a capable one)
//!   and every later send for the triple goes straight there.
//! - **Keyless** work is spread uniformly at random over the nodes that can run
//!   the stage.
//!
//! Both policies talk to the cluster through `ClusterLink`, so the node can
//! plug in its fabric (with local bypass) and tests can plug in an in-memory
//! cluster.

pub mod availability;
pub mod broadcast;
pub mod link;
pub mod router;
pub mod sticky;

pub use availability::AvailabilityCache;
pub use broadcast::{gather, notify_all, race};
pub use link::ClusterLink;
pub use router::Router;
pub use sticky::StickyCache;
