use thiserror::Error;

/// Errors surfaced by the analysis boundary.
///
/// Missing face/pose evidence and heuristic timeouts are not errors; they are
/// folded into the profile as `NoEvidence` findings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// Malformed or empty frame, or an unusable detection context.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Missing or invalid threshold configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AnalysisError {
    pub(crate) fn input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
