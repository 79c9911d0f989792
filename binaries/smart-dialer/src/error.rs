use thiserror::Error;

/// The error kinds the Smart Dialer core recognizes, per the component design.
///
/// Only [`SmartDialerError::ConfigParse`], [`SmartDialerError::AllCandidatesFailed`], and
/// [`SmartDialerError::Cancelled`] are ever surfaced to the caller of [`crate::new_dialer`].
/// Everything else (`ProbeFailure`, `ResumeMismatch`, `UnsupportedFallback`, `CacheError`) is
/// logged and discarded internally.
#[derive(Debug, Error)]
pub enum SmartDialerError {
    #[error("could not parse strategy config: {0}")]
    ConfigParse(String),

    #[error("candidate failed: {0}")]
    ProbeFailure(#[from] anyhow::Error),

    #[error("all candidates failed in this race")]
    AllCandidatesFailed { summary: String },

    #[error("cached winner is not in the current config, treating as cache miss")]
    ResumeMismatch,

    #[error("fallback type is not supported by this build: {0}")]
    UnsupportedFallback(String),

    #[error("strategy result cache error: {0}")]
    CacheError(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SmartDialerError>;
