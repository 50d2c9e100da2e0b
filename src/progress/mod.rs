//! Progress extraction from the test process output stream
//!
//! Raw bytes from the child are assembled into lines, each line is classified
//! as a progress marker or plain text, and the result is folded into a
//! [`ProgressModel`] that the UI reads from.

pub mod assembler;
pub mod marker;
pub mod model;

pub use assembler::{LineAssembler, Lines, RawLine};
pub use marker::{percentage, MarkerEvent, MarkerParser, ProgressValue};
pub use model::{LogBuffer, LogEntry, ProgressChange, ProgressModel, ProgressSnapshot};

/// Errors raised while turning output bytes into progress events.
///
/// Both variants are recovered locally: the offending line is dropped and
/// processing continues with the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A `*` or `|` line that does not follow `<curr>/<total><suffix>`
    #[error("malformed progress marker: {0:?}")]
    MalformedMarker(String),
    /// A line grew past the assembler cap without a terminator
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}
