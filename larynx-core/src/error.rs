//! Structured error types for the Larynx workspace.

use thiserror::Error;

/// Unified error type for all Larynx operations.
#[derive(Debug, Error)]
pub enum LarynxError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error (malformed configuration values or text input)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Graph topology violates its invariants (unreachable nodes, dangling
    /// arcs, missing entry/exit).
    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    /// Frame or state counts of cooperating inputs disagree.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// No alignment path with non-zero probability exists.
    #[error("zero probability: {0}")]
    ZeroProbability(String),

    /// Model or statistics could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A failure confined to a single utterance.
    #[error("utterance {id}: {source}")]
    Utterance {
        id: String,
        #[source]
        source: Box<LarynxError>,
    },

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

impl LarynxError {
    /// Attach an utterance identifier to an error.
    pub fn in_utterance(self, id: impl Into<String>) -> Self {
        match self {
            e @ Self::Utterance { .. } => e,
            e => Self::Utterance {
                id: id.into(),
                source: Box::new(e),
            },
        }
    }

    /// Whether the error only invalidates the utterance it occurred in.
    ///
    /// Training loops skip such utterances and continue with the next one.
    pub fn is_utterance_local(&self) -> bool {
        match self {
            Self::ZeroProbability(_) | Self::MalformedGraph(_) | Self::DimensionMismatch(_) => {
                true
            }
            Self::Utterance { source, .. } => source.is_utterance_local(),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the Larynx workspace.
pub type Result<T> = std::result::Result<T, LarynxError>;
