//! Termination Detection
//!
//! Detects, without any global view of the pipeline, when every unit sent into
//! a group has been processed somewhere in the cluster.
//!
//! ## Protocol
//! 1. Whoever sent units into a group announces `NULL_ACHIEVED {group, totalSum}`.
//! 2. A node that knows the total asks every member `COUNT_PROCESSED` and sums
//!    the answers. It repeats the check whenever its own in-flight count for
//!    the group drops to zero.
//! 3. Once the sum reaches the total, the node asks every member
//!    `END_PROCESSING`. Each member finishes its instances of the group exactly
//!    once, drops the group's state, and answers with how many units it sent
//!    into each child group.
//! 4. The finisher sums the child counts and announces `NULL_ACHIEVED` for each
//!    child, so the same check runs one level down the fan-out tree.

pub mod detector;
pub mod state;

pub use detector::TerminationDetector;
pub use state::{GroupState, GroupStore, InstanceCell, InstanceSlot};

#[cfg(test)]
mod tests;
