use thiserror::Error;

/// Fatal conditions raised by the engine.
///
/// These travel inside `anyhow::Error`; callers that care recover them with
/// `downcast_ref::<DeobError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum DeobError {
    #[error("unresolved class: {0}")]
    UnresolvedClass(String),
    #[error("malformed pattern {pattern:?}: {reason}")]
    MalformedPattern { pattern: String, reason: String },
    #[error("analysis invariant violated in {owner}.{method}: {reason}")]
    AnalysisInvariant {
        owner: String,
        method: String,
        reason: String,
    },
}

impl DeobError {
    pub(crate) fn invariant(owner: &str, method: &str, reason: impl Into<String>) -> Self {
        DeobError::AnalysisInvariant {
            owner: owner.to_string(),
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}
