//! Provisioning bearers
//!
//! This module provides the transport abstraction that carries Bluetooth Mesh
//! provisioning PDUs over an MTU-constrained BLE link. It includes:
//!
//! - **framer**: segmentation and reassembly (SAR) of PDUs into bearer frames
//! - **error**: the bearer error taxonomy
//! - **link**: the consumed link collaborator contract
//! - **gatt** / **advertising**: concrete bearer variants
//! - **provisioning**: bearer specialization restricted to provisioning traffic
//! - **loopback**: in-memory link pair for tests and simulation
//!
//! Platform code (Kotlin/Swift) supplies the actual BLE link; everything here is
//! testable without radio hardware.

pub mod advertising;
pub mod base;
pub mod error;
pub mod framer;
pub mod gatt;
pub mod link;
pub mod loopback;
pub mod provisioning;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use advertising::{AdvertisingBearer, ADV_MAX_FRAME_SIZE};
pub use base::{BearerBase, FramePolicy};
pub use error::{BearerError, LinkError};
pub use framer::{
    Frame, FrameHeader, LogicalPdu, PduFramer, PduType, Reassembly, SegmentationAssembly,
    SegmentationRole, Segments, HEADER_SIZE, MIN_FRAME_SIZE,
};
pub use gatt::{GattBearer, GattCharacteristic, GattService, MAX_CHARACTERISTIC_SIZE};
pub use link::{Link, LinkEvent, LinkEvents};
pub use loopback::LoopbackLink;
pub use provisioning::{CloseReason, LinkControl, ProvisioningBearer};

/// Bearer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BearerState {
    /// No link; initial and terminal state
    Closed,
    /// Link connection in progress
    Opening,
    /// Link established, frames may flow
    Open,
    /// Link being released
    Closing,
}

impl fmt::Display for BearerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BearerState::Closed => write!(f, "Closed"),
            BearerState::Opening => write!(f, "Opening"),
            BearerState::Open => write!(f, "Open"),
            BearerState::Closing => write!(f, "Closing"),
        }
    }
}

/// Concrete transport behind a bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BearerKind {
    /// Connection-oriented GATT (PB-GATT)
    Gatt,
    /// Connectionless advertising (PB-ADV)
    Advertising,
}

impl fmt::Display for BearerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BearerKind::Gatt => write!(f, "PB-GATT"),
            BearerKind::Advertising => write!(f, "PB-ADV"),
        }
    }
}

/// Transport contract every bearer variant implements
///
/// `receive` and `link_lost` are driven from the link's notification context;
/// `send` runs on the caller's. The two directions share no state.
#[async_trait]
pub trait Bearer: Send + Sync {
    /// Transport variant
    fn kind(&self) -> BearerKind;

    /// Current lifecycle state
    fn state(&self) -> BearerState;

    /// Frame size negotiated at the last successful open
    fn max_frame_size(&self) -> usize;

    /// Connect the link and move to `Open`
    ///
    /// # Panics
    ///
    /// Panics when called while the bearer is `Opening` or `Closing`; callers
    /// must serialize lifecycle operations.
    async fn open(&self) -> Result<(), BearerError>;

    /// Segment `pdu` and hand every frame to the link, in order
    async fn send(&self, pdu: &LogicalPdu) -> Result<(), BearerError>;

    /// Release the link; always ends in `Closed`
    async fn close(&self);

    /// Feed one inbound frame; yields a PDU once reassembly completes
    fn receive(&self, frame: &[u8]) -> Result<Option<LogicalPdu>, BearerError>;

    /// Link collaborator reported loss of the connection
    fn link_lost(&self, error: LinkError);

    /// Inbound event stream of the current connection, if not yet taken
    fn take_link_events(&self) -> Option<LinkEvents>;
}
