//! Stage Runtime
//!
//! User processing logic lives in named stages. A stage builds one instance
//! per unit of work: keyed units keep their instance until the end-of-key
//! sentinel (or until their group ends), keyless units get a fresh instance per
//! message.
//!
//! ## Submodules
//! - **`types`**: the `Stage` / `StageInstance` seams and the closure-backed `Handler`.
//! - **`registry`**: explicit stage name → stage map.
//! - **`sender`**: the `send` capability handed to every instance.
//! - **`runtime`**: memoized instantiation, dispatch and group accounting.

pub mod registry;
pub mod runtime;
pub mod sender;
pub mod types;

pub use registry::StageRegistry;
pub use runtime::{Processed, StageRuntime};
pub use sender::{Outbox, StageSender};
pub use types::{Handler, Stage, StageInstance};
