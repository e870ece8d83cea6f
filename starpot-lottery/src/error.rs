use thiserror::Error;

pub type Result<T> = std::result::Result<T, LotteryError>;

#[derive(Error, Debug)]
pub enum LotteryError {
    #[error("Starpot core error: {0}")]
    Core(#[from] starpot_core::StarpotError),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Entry fee mismatch: round charges {expected}, offered {offered}")]
    FeeMismatch {
        expected: starpot_core::Amount,
        offered: starpot_core::Amount,
    },

    #[error("Store did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("{operation} lost {attempts} consecutive races with concurrent writers")]
    Contention {
        operation: &'static str,
        attempts: u32,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid round document: {0}")]
    InvalidRound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LotteryError {
    pub fn invalid_round(msg: impl Into<String>) -> Self {
        Self::InvalidRound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Contention { .. } => true,
            Self::Core(err) => err.is_transient(),
            _ => false,
        }
    }
}
