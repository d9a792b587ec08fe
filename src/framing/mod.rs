//! Framing Layer
//!
//! Turns an arbitrarily chunked byte stream into a sequence of complete lines.
//! Every socket in the cluster carries newline-delimited JSON, and the same
//! framing feeds `run_stream` input into a session.
//!
//! ## Behavior
//! - **Carry-over**: a single buffer holds the unterminated tail of the previous
//!   chunk, so lines (and multi-byte characters) may straddle chunk boundaries.
//! - **Configurable breaks**: lines split on a regex, `\r?\n` by default.
//! - **End of stream**: whatever remains buffered is flushed as a final line.

pub mod splitter;

pub use splitter::{FramingOptions, LineReader, LineSplitter};
