//! Clustered Stream Map-Reduce Library
//!
//! This library crate defines the modules of one cluster node. The binary
//! (`main.rs`) only loads a config, registers stages and starts a `Node`.
//!
//! ## Architecture Modules
//! - **`framing`**: Cuts byte streams into lines on a configurable break pattern.
//! - **`queue`**: Bounded in-memory FIFO that spills to disk segments under load.
//! - **`fabric`**: Persistent TCP connections to every peer (worker data plane and
//!   manager control plane), retry policy and the line-JSON wire protocol.
//! - **`routing`**: Broadcast asks, availability polling and the sticky cache that
//!   pins keyed units to one node for the life of a session.
//! - **`stage`**: User stage registry and the runtime that drives stage instances.
//! - **`termination`**: Per-group accounting and the `NULL_ACHIEVED` / `END_PROCESSING`
//!   protocol that decides when a group, and finally a session, is done.
//! - **`node`**: Composes all of the above and exposes `run_stream`.
//!
//! Supporting modules: `config` (JSON configuration), `error` (`ClusterError`)
//! and `ids` (session, group and unit identifiers).

pub mod config;
pub mod error;
pub mod fabric;
pub mod framing;
pub mod ids;
pub mod node;
pub mod queue;
pub mod routing;
pub mod stage;
pub mod termination;
