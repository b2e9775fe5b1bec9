//! Typed errors for the store client and the mail transport.
//!
//! Handlers collapse all of these into coarse HTTP categories; the
//! variants exist so internal callers can branch (the importer treats
//! `Duplicate` as a skip, the alert loop logs `Mail` and moves on).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store returned status {0}")]
    Status(u16),
    #[error("duplicate record for session")]
    Duplicate,
    #[error("response decode failed: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport(_) => true,
            UpstreamError::Status(code) => *code >= 500,
            UpstreamError::Auth(_) | UpstreamError::Duplicate | UpstreamError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected server reply: {0}")]
    Protocol(String),
}
