use thiserror::Error;

use crate::message::DisconnectReason;

/// A peer broke the protocol. Carries the reason the peer is dropped with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {detail}")]
pub struct P2pError {
    pub reason: DisconnectReason,
    pub detail: String,
}

impl P2pError {
    pub fn new(reason: DisconnectReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into() }
    }

    pub fn bad_message(detail: impl Into<String>) -> Self {
        Self::new(DisconnectReason::BadProtocol, detail)
    }

    /// Sequencing, linkage or clock violations in sync data.
    pub fn traitor(detail: impl Into<String>) -> Self {
        Self::new(DisconnectReason::BadProtocol, format!("traitor peer: {}", detail.into()))
    }
}

pub type P2pResult<T> = Result<T, P2pError>;
