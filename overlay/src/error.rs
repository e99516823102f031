//! Overlay error types

use meridian_core::OutPoint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverlayError {
    /// Message rejected; `score` is the misbehavior penalty for the sending
    /// peer (0 means reject without penalty).
    #[error("validation failed: {reason}")]
    Validation { reason: String, score: u32 },

    #[error("duplicate {0}")]
    Duplicate(&'static str),

    /// The operation cannot run yet; the caller retries next tick.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    #[error("unknown voter {0}")]
    UnknownVoter(OutPoint),

    #[error("chain unavailable")]
    ChainUnavailable,

    #[error(transparent)]
    Crypto(#[from] meridian_crypto::CryptoError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

impl OverlayError {
    pub fn validation(reason: impl Into<String>, score: u32) -> Self {
        OverlayError::Validation {
            reason: reason.into(),
            score,
        }
    }

    /// Misbehavior score to apply to the peer that sent the message
    pub fn peer_score(&self) -> u32 {
        match self {
            OverlayError::Validation { score, .. } => *score,
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;
