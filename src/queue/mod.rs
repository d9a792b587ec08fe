//! Backpressure Queue
//!
//! A FIFO buffer with bounded memory that spills to disk. Each inbound socket
//! owns one, so the socket can keep being read while handlers lag behind:
//! excess lines land in memory first, then in on-disk segments.
//!
//! ## Layout
//! Entries live in three places, oldest to newest:
//! 1. **Head** (memory): what `pop` serves from.
//! 2. **Segments** (disk): append-only newline-delimited files, read oldest-first
//!    and deleted once loaded back into the head.
//! 3. **Tail** (memory): recent pushes, flushed to a new segment once it reaches
//!    the memory limit.
//!
//! Pushes go straight to the head only while nothing older is waiting behind
//! it, which keeps the overall order strictly FIFO.

pub mod spill;

pub use spill::SpillQueue;
