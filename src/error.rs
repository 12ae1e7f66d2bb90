//! Error vocabulary.
//!
//! The engine's own surface is infallible: truncation degrades to a
//! placeholder, late signals become no-ops. What needs a type here is the
//! *application's* errors — a middleware's `Err` travels the chain untouched
//! and the engine only records what escaped the top.

use thiserror::Error;

/// The erased error type middleware return.
///
/// Anything implementing `std::error::Error + Send + Sync` converts into it
/// with `?`, so application middleware keep their own error types end to end.
/// The engine never inspects it beyond its `Display` output.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failure that escaped the top of a middleware chain, as recorded on the
/// finished trace.
///
/// The original error object went back to the application untouched; the
/// trace keeps its message verbatim.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TraceError {
    /// `Display` output of the escaped error.
    pub message: String,
}

impl TraceError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
