//! GATT bearer (PB-GATT)
//!
//! Frames travel as writes to the Data In characteristic and notifications on
//! Data Out. GATT write/notify is ordered per characteristic, so this bearer
//! carries fully segmented PDUs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::base::{BearerBase, FramePolicy};
use super::error::{BearerError, LinkError};
use super::framer::LogicalPdu;
use super::link::{Link, LinkEvents};
use super::{Bearer, BearerKind, BearerState};
use crate::config::{BearerConfig, ConfigError};

/// Maximum GATT characteristic write size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// ATT opcode and handle overhead subtracted from the MTU
pub const ATT_HEADER_SIZE: usize = 3;

/// Mesh GATT services a bearer can run over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattService {
    /// Mesh Provisioning Service, exposed by unprovisioned devices
    Provisioning,
    /// Mesh Proxy Service, exposed by provisioned proxy nodes
    Proxy,
}

impl GattService {
    /// Get service UUID (short form)
    pub fn uuid(&self) -> u16 {
        match self {
            GattService::Provisioning => 0x1827,
            GattService::Proxy => 0x1828,
        }
    }

    /// Characteristic UUID for a direction of this service
    pub fn characteristic_uuid(&self, characteristic: GattCharacteristic) -> u16 {
        match (self, characteristic) {
            (GattService::Provisioning, GattCharacteristic::DataIn) => 0x2ADB,
            (GattService::Provisioning, GattCharacteristic::DataOut) => 0x2ADC,
            (GattService::Proxy, GattCharacteristic::DataIn) => 0x2ADD,
            (GattService::Proxy, GattCharacteristic::DataOut) => 0x2ADE,
        }
    }
}

/// GATT characteristic roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattCharacteristic {
    /// Written by the client (write without response)
    DataIn,
    /// Notified by the server
    DataOut,
}

/// Frame payload available for a negotiated ATT MTU
pub fn payload_for_mtu(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(ATT_HEADER_SIZE)
}

/// Connection-oriented bearer over a GATT link
pub struct GattBearer {
    base: BearerBase,
    service: GattService,
}

impl GattBearer {
    /// Create a GATT bearer on the Mesh Provisioning Service
    pub fn new(link: Arc<dyn Link>, config: BearerConfig) -> Result<Self, ConfigError> {
        Self::with_service(link, config, GattService::Provisioning)
    }

    /// Create a GATT bearer on a specific mesh service
    pub fn with_service(
        link: Arc<dyn Link>,
        config: BearerConfig,
        service: GattService,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = FramePolicy {
            segmentation: true,
            frame_size_cap: MAX_CHARACTERISTIC_SIZE,
        };
        Ok(Self {
            base: BearerBase::new(BearerKind::Gatt, link, &config, policy),
            service,
        })
    }

    pub fn service(&self) -> GattService {
        self.service
    }

    pub fn base(&self) -> &BearerBase {
        &self.base
    }
}

#[async_trait]
impl Bearer for GattBearer {
    fn kind(&self) -> BearerKind {
        BearerKind::Gatt
    }

    fn state(&self) -> BearerState {
        self.base.state()
    }

    fn max_frame_size(&self) -> usize {
        self.base.max_frame_size()
    }

    async fn open(&self) -> Result<(), BearerError> {
        tracing::debug!(
            "Opening GATT bearer on service {:#06x} (data in {:#06x}, data out {:#06x})",
            self.service.uuid(),
            self.service.characteristic_uuid(GattCharacteristic::DataIn),
            self.service.characteristic_uuid(GattCharacteristic::DataOut)
        );
        self.base.open().await
    }

    async fn send(&self, pdu: &LogicalPdu) -> Result<(), BearerError> {
        self.base.send(pdu).await
    }

    async fn close(&self) {
        self.base.close().await
    }

    fn receive(&self, frame: &[u8]) -> Result<Option<LogicalPdu>, BearerError> {
        self.base.receive(frame)
    }

    fn link_lost(&self, error: LinkError) {
        self.base.link_lost(error)
    }

    fn take_link_events(&self) -> Option<LinkEvents> {
        self.base.take_link_events()
    }
}
