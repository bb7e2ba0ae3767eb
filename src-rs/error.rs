use std::time::Duration;
use thiserror::Error;

/// How much of an unparseable response is kept for diagnostics.
pub const EXCERPT_LIMIT: usize = 500;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unrecoverable analysis response ({reason}): {excerpt}")]
    Unrecoverable { reason: String, excerpt: String },
}

impl ParseError {
    pub fn unrecoverable(reason: impl Into<String>, raw: &str) -> Self {
        Self::Unrecoverable {
            reason: reason.into(),
            excerpt: raw.chars().take(EXCERPT_LIMIT).collect(),
        }
    }

    pub fn excerpt(&self) -> &str {
        match self {
            Self::Unrecoverable { excerpt, .. } => excerpt,
        }
    }
}

/// Failure classes the retry loop is allowed to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Overloaded,
    Unavailable,
    Network,
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("analysis service is overloaded after {attempts} attempt(s)")]
    Overloaded { attempts: u32 },
    #[error("analysis service unavailable after {attempts} attempt(s){}: {message}", status_suffix(.status))]
    Unavailable {
        status: Option<u16>,
        attempts: u32,
        message: String,
    },
    #[error("analysis request rejected{}: {message}", status_suffix(.status))]
    Terminal { status: Option<u16>, message: String },
    #[error("analysis response could not be decoded: {0}")]
    Malformed(#[from] ParseError),
    #[error("analysis request was superseded")]
    Cancelled,
}

impl AnalysisError {
    /// True for the retryable classes once the retry budget is spent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded { .. } | Self::Unavailable { .. })
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Overloaded { .. } => {
                "The analysis service is busy right now. Please try again shortly.".to_string()
            }
            Self::Unavailable { .. } => {
                "The analysis service could not be reached. Check your connection and try again."
                    .to_string()
            }
            Self::Terminal { message, .. } => format!("The analysis request failed: {message}"),
            Self::Malformed(_) => {
                "The analysis service answered, but no usable prediction could be read from it."
                    .to_string()
            }
            Self::Cancelled => "A newer question replaced this one.".to_string(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" (HTTP {code})"))
        .unwrap_or_default()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("rendering host unavailable: {0}")]
    Unavailable(String),
    #[error("rendering host connection interrupted: {0}")]
    Interrupted(String),
    #[error("rendering host call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rendering host rejected request: {0}")]
    Rejected(String),
    #[error("marker process could not be launched: {0}")]
    Spawn(String),
    #[error("invalid control-plane message: {0}")]
    Protocol(String),
}
