//! Underlying link collaborator
//!
//! The BLE stack (scanning, connecting, characteristic discovery) lives outside
//! this crate. Platform code adapts its GATT or advertising primitives to the
//! `Link` trait; bearers only ever talk to this shape.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::LinkError;

/// Inbound notification stream of one link connection
pub type LinkEvents = mpsc::Receiver<LinkEvent>;

/// Notifications pushed by the link on its own execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw frame received from the peer
    Frame(Vec<u8>),
    /// Link went away underneath the bearer
    Disconnected(LinkError),
}

/// Platform link abstraction
///
/// Implementers own the physical connection. `connect` is called once per
/// bearer open and must return a fresh event stream for that connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Link: Send + Sync {
    /// Establish the connection and start delivering inbound events
    async fn connect(&self) -> Result<LinkEvents, LinkError>;

    /// Hand one frame to the link for transmission
    async fn write_frame(&self, frame: &[u8]) -> Result<(), LinkError>;

    /// Release the connection (best effort)
    async fn disconnect(&self);

    /// Negotiated maximum frame payload (MTU-derived)
    fn max_payload_size(&self) -> usize;
}
