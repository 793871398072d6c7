//! Error taxonomy for the crate.
//!
//! Mirrors the semantic kinds in spec §7: parse errors carry enough context
//! to locate the problem, structural errors name the invariant that broke.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Sniffer recognized none of the three supported chart formats.
    #[error("unsupported input format")]
    UnsupportedFormat,

    /// Canonical JSON declares a version other than `acmacs-ace-v1`.
    #[error("unsupported chart version: {0}")]
    UnsupportedVersion(String),

    /// A parser failed outright.
    #[error("malformed input at byte {offset}: {snippet}")]
    MalformedInput {
        /// Byte offset into the input at which parsing failed.
        offset: usize,
        /// Short snippet of the input around `offset`, for diagnostics.
        snippet: String,
    },

    /// Input parsed but violates a data-model invariant.
    #[error("invalid structure: {0}")]
    StructureInvalid(String),

    /// A requested optional substructure is absent.
    #[error("data not available: {0}")]
    DataNotAvailable(String),

    /// A titer's text form could not be parsed.
    #[error("invalid titer text: {0:?}")]
    InvalidTiter(String),

    /// A cross-projection operation needs equal or compatible dimensions.
    #[error("invalid dimensionality: {0}")]
    InvalidDimensionality(String),

    /// Merge failed; wraps the originating error message.
    #[error("merge error: {0}")]
    MergeError(String),

    /// The external minimizer failed or produced a non-finite stress.
    #[error("optimizer failure: {0}")]
    OptimizerFailure(String),
}

impl Error {
    /// Build a [`Error::MalformedInput`] from a byte offset and the original text.
    pub fn malformed_at(input: &str, offset: usize) -> Self {
        let snippet: String = input
            .chars()
            .skip(offset.saturating_sub(16))
            .take(48)
            .collect();
        Error::MalformedInput { offset, snippet }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A non-fatal diagnostic emitted by an operation that otherwise succeeds
/// (annotation mismatches on merge, cheating-assay fallback, dimension
/// annealing oddities — spec §7).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Human-readable text of the message.
    pub text: String,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Collects [`Message`]s produced during an operation, also forwarding each
/// to `tracing::warn!` as it is pushed.
#[derive(Debug, Clone, Default)]
pub struct MessageChannel {
    messages: Vec<Message>,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning, both in the returned list and via `tracing`.
    pub fn warn(&mut self, text: impl Into<String>) {
        let message = Message::new(text);
        tracing::warn!("{}", message.text);
        self.messages.push(message);
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}
