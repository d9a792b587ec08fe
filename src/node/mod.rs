//! Node Composition Module
//!
//! A `Node` is one member of the cluster. It owns both listeners, the
//! connections to every other member, the stage runtime and the termination
//! detector, and wires them together.
//!
//! ## Submodules
//! - **`node`**: The `Node` itself. Answers control-plane questions, routes
//!   outgoing units and implements `ClusterLink` for the routing layer.
//! - **`handlers`**: Listener hooks that decode inbound lines and hand them to
//!   the node.
//! - **`session`**: Submission side: `run_stream` and the handle used to await
//!   the end of a session.

pub mod handlers;
pub mod node;
pub mod session;

pub use node::Node;
pub use session::SessionHandle;

#[cfg(test)]
mod tests;
