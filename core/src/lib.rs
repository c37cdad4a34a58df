// meshbearer — Bluetooth Mesh provisioning bearers
//
// Carries provisioning PDUs over MTU-constrained BLE links: segmentation and
// reassembly, GATT and advertising bearer variants, and a session layer that
// owns the bearer lifecycle and delivers events to one listener.
//
// The BLE stack itself is out of scope; platforms plug in through `Link`.

pub mod bearer;
pub mod config;
pub mod logging;
pub mod session;

pub use bearer::{
    AdvertisingBearer, Bearer, BearerError, BearerKind, BearerState, CloseReason, Frame,
    GattBearer, GattService, Link, LinkControl, LinkError, LinkEvent, LinkEvents, LogicalPdu,
    LoopbackLink, PduFramer, PduType, ProvisioningBearer, Reassembly, SegmentationAssembly,
    SegmentationRole,
};
pub use config::{BearerConfig, ConfigError};
pub use session::{BearerEvent, BearerSession};
