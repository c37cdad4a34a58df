// Error taxonomy shared by every bearer component
//
// Framing and reassembly failures abort only the current PDU exchange.
// `Link` failures come from the underlying link collaborator and are the
// only errors that force a bearer into `Closed`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the underlying link collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Link lost: {0}")]
    LinkLost(String),
    #[error("Not connected")]
    NotConnected,
}

/// Errors surfaced by bearers and bearer sessions
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BearerError {
    /// Frame or PDU type the bearer does not recognize or carry
    #[error("PDU type not supported by this bearer")]
    PduTypeNotSupported,
    /// Operation attempted while the bearer is not open
    #[error("Bearer closed")]
    Closed,
    /// Frame header inconsistent with its payload or with the assembly in progress
    #[error("Malformed frame")]
    MalformedFrame,
    /// Reassembled length exceeds the declared or configured maximum
    #[error("Assembly overflow")]
    AssemblyOverflow,
    /// Failure reported by the link collaborator
    #[error("Link failure: {0}")]
    Link(#[from] LinkError),
}

impl BearerError {
    /// Whether this error means the underlying link is gone
    pub fn is_link_failure(&self) -> bool {
        matches!(self, BearerError::Link(_))
    }
}
