//! Provisioning bearer
//!
//! Wraps any bearer and narrows it to provisioning traffic: only the
//! `Provisioning` and `LinkControl` discriminators pass in either direction.
//! Link-control PDUs open, acknowledge and close a provisioning link:
//!
//! ```text
//! Open  : 0x00 | device uuid (16 bytes)
//! Ack   : 0x01
//! Close : 0x02 | reason (1 byte)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::error::{BearerError, LinkError};
use super::framer::{FrameHeader, LogicalPdu, PduType};
use super::link::LinkEvents;
use super::{Bearer, BearerKind, BearerState};

const OPCODE_OPEN: u8 = 0x00;
const OPCODE_ACK: u8 = 0x01;
const OPCODE_CLOSE: u8 = 0x02;

/// Why a provisioning link was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// Provisioning completed
    Success = 0x00,
    /// Peer stopped responding
    Timeout = 0x01,
    /// Provisioning failed
    Fail = 0x02,
}

impl CloseReason {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(CloseReason::Success),
            0x01 => Some(CloseReason::Timeout),
            0x02 => Some(CloseReason::Fail),
            _ => None,
        }
    }
}

/// Link establishment control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkControl {
    /// Request a link to the unprovisioned device with this UUID
    Open(Uuid),
    /// Link open acknowledged
    Ack,
    /// Tear the link down
    Close(CloseReason),
}

impl LinkControl {
    /// Encode as a `LinkControl` PDU
    pub fn to_pdu(&self) -> LogicalPdu {
        let mut data = Vec::with_capacity(17);
        match self {
            LinkControl::Open(device) => {
                data.push(OPCODE_OPEN);
                data.extend_from_slice(device.as_bytes());
            }
            LinkControl::Ack => data.push(OPCODE_ACK),
            LinkControl::Close(reason) => {
                data.push(OPCODE_CLOSE);
                data.push(*reason as u8);
            }
        }
        LogicalPdu::new(PduType::LinkControl, data)
    }

    /// Decode a `LinkControl` PDU
    pub fn parse(pdu: &LogicalPdu) -> Result<Self, BearerError> {
        if pdu.pdu_type() != PduType::LinkControl {
            return Err(BearerError::PduTypeNotSupported);
        }
        let (&opcode, params) = pdu
            .as_bytes()
            .split_first()
            .ok_or(BearerError::MalformedFrame)?;

        match (opcode, params.len()) {
            (OPCODE_OPEN, 16) => {
                let uuid = Uuid::from_slice(params).map_err(|_| BearerError::MalformedFrame)?;
                Ok(LinkControl::Open(uuid))
            }
            (OPCODE_ACK, 0) => Ok(LinkControl::Ack),
            (OPCODE_CLOSE, 1) => CloseReason::from_byte(params[0])
                .map(LinkControl::Close)
                .ok_or(BearerError::MalformedFrame),
            _ => Err(BearerError::MalformedFrame),
        }
    }
}

/// Bearer restricted to provisioning and link-control PDUs
pub struct ProvisioningBearer<B: Bearer> {
    inner: B,
}

impl<B: Bearer> ProvisioningBearer<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Whether PDUs of `pdu_type` may cross this bearer
    pub fn accepts(pdu_type: PduType) -> bool {
        matches!(pdu_type, PduType::Provisioning | PduType::LinkControl)
    }

    /// Send a link-control message
    pub async fn send_link_control(&self, message: LinkControl) -> Result<(), BearerError> {
        debug!("{} provisioning bearer sending {:?}", self.inner.kind(), message);
        self.inner.send(&message.to_pdu()).await
    }
}

#[async_trait]
impl<B: Bearer> Bearer for ProvisioningBearer<B> {
    fn kind(&self) -> BearerKind {
        self.inner.kind()
    }

    fn state(&self) -> BearerState {
        self.inner.state()
    }

    fn max_frame_size(&self) -> usize {
        self.inner.max_frame_size()
    }

    async fn open(&self) -> Result<(), BearerError> {
        self.inner.open().await
    }

    async fn send(&self, pdu: &LogicalPdu) -> Result<(), BearerError> {
        if self.inner.state() != BearerState::Open {
            return Err(BearerError::Closed);
        }
        if !Self::accepts(pdu.pdu_type()) {
            debug!("Provisioning bearer refusing outbound {} PDU", pdu.pdu_type());
            return Err(BearerError::PduTypeNotSupported);
        }
        if pdu.pdu_type() == PduType::LinkControl {
            LinkControl::parse(pdu)?;
        }
        self.inner.send(pdu).await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn receive(&self, frame: &[u8]) -> Result<Option<LogicalPdu>, BearerError> {
        // Filtered frames never reach reassembly
        if self.inner.state() == BearerState::Open {
            if let Some(&byte) = frame.first() {
                let header = FrameHeader::from_byte(byte)?;
                if !Self::accepts(header.pdu_type) {
                    debug!("Provisioning bearer refusing inbound {} frame", header.pdu_type);
                    return Err(BearerError::PduTypeNotSupported);
                }
            }
        }

        let pdu = self.inner.receive(frame)?;
        if let Some(pdu) = &pdu {
            if pdu.pdu_type() == PduType::LinkControl {
                LinkControl::parse(pdu)?;
            }
        }
        Ok(pdu)
    }

    fn link_lost(&self, error: LinkError) {
        self.inner.link_lost(error)
    }

    fn take_link_events(&self) -> Option<LinkEvents> {
        self.inner.take_link_events()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bearer::framer::{Frame, SegmentationRole};
    use crate::bearer::gatt::GattBearer;
    use crate::bearer::link::Link;
    use crate::bearer::loopback::LoopbackLink;
    use crate::config::BearerConfig;

    async fn open_bearer() -> (ProvisioningBearer<GattBearer>, LoopbackLink) {
        let (link, peer) = LoopbackLink::pair(20);
        let gatt = GattBearer::new(Arc::new(link), BearerConfig::default()).expect("Bearer");
        let bearer = ProvisioningBearer::new(gatt);
        bearer.open().await.expect("Open");
        (bearer, peer)
    }

    #[test]
    fn test_link_control_encoding() {
        let device = Uuid::from_bytes([0xAB; 16]);
        let open = LinkControl::Open(device).to_pdu();
        assert_eq!(open.pdu_type(), PduType::LinkControl);
        assert_eq!(open.len(), 17);
        assert_eq!(open.as_bytes()[0], 0x00);

        assert_eq!(LinkControl::Ack.to_pdu().as_bytes(), &[0x01]);
        assert_eq!(
            LinkControl::Close(CloseReason::Timeout).to_pdu().as_bytes(),
            &[0x02, 0x01]
        );

        assert_eq!(LinkControl::parse(&open), Ok(LinkControl::Open(device)));
    }

    #[test]
    fn test_link_control_parse_rejects_garbage() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00, 1, 2],
            vec![0x01, 0x00],
            vec![0x02, 0x09],
            vec![0x07],
        ];
        for data in cases {
            let pdu = LogicalPdu::new(PduType::LinkControl, data.clone());
            assert_eq!(
                LinkControl::parse(&pdu),
                Err(BearerError::MalformedFrame),
                "data {:02x?}",
                data
            );
        }

        let wrong_type = LogicalPdu::provisioning(vec![0x01]);
        assert_eq!(LinkControl::parse(&wrong_type), Err(BearerError::PduTypeNotSupported));
    }

    #[test]
    fn test_accepts_only_provisioning_types() {
        type Pb = ProvisioningBearer<GattBearer>;
        assert!(Pb::accepts(PduType::Provisioning));
        assert!(Pb::accepts(PduType::LinkControl));
        assert!(!Pb::accepts(PduType::NetworkPdu));
        assert!(!Pb::accepts(PduType::MeshBeacon));
        assert!(!Pb::accepts(PduType::ProxyConfiguration));
    }

    #[tokio::test]
    async fn test_send_rejects_foreign_type_without_writing() {
        let (bearer, _peer) = open_bearer().await;
        assert_eq!(bearer.inner().base().max_frame_size(), 20);

        let result = bearer
            .send(&LogicalPdu::new(PduType::NetworkPdu, vec![1, 2, 3]))
            .await;
        assert_eq!(result, Err(BearerError::PduTypeNotSupported));
        assert_eq!(bearer.state(), BearerState::Open);
    }

    #[tokio::test]
    async fn test_send_when_closed_reports_closed_first() {
        let (link, _peer) = LoopbackLink::pair(20);
        let gatt = GattBearer::new(Arc::new(link), BearerConfig::default()).expect("Bearer");
        let bearer = ProvisioningBearer::new(gatt);

        let result = bearer
            .send(&LogicalPdu::new(PduType::MeshBeacon, vec![1]))
            .await;
        assert_eq!(result, Err(BearerError::Closed));
    }

    #[tokio::test]
    async fn test_receive_rejects_foreign_frames() {
        let (bearer, _peer) = open_bearer().await;

        let beacon = Frame::new(SegmentationRole::Single, PduType::MeshBeacon, vec![1, 2]);
        assert_eq!(
            bearer.receive(&beacon.to_bytes()),
            Err(BearerError::PduTypeNotSupported)
        );

        // Unknown discriminator
        assert_eq!(bearer.receive(&[0x3F, 1]), Err(BearerError::PduTypeNotSupported));
    }

    #[tokio::test]
    async fn test_foreign_frame_leaves_assembly_intact() {
        let (bearer, _peer) = open_bearer().await;

        let first = Frame::new(SegmentationRole::First, PduType::Provisioning, vec![0, 4, 1, 2]);
        assert_eq!(bearer.receive(&first.to_bytes()), Ok(None));

        let network = Frame::new(SegmentationRole::Single, PduType::NetworkPdu, vec![9]);
        assert!(bearer.receive(&network.to_bytes()).is_err());

        let last = Frame::new(SegmentationRole::Last, PduType::Provisioning, vec![3, 4]);
        let pdu = bearer.receive(&last.to_bytes()).expect("Receive").expect("PDU");
        assert_eq!(pdu.as_bytes(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_receive_validates_link_control() {
        let (bearer, _peer) = open_bearer().await;

        let ack = Frame::new(SegmentationRole::Single, PduType::LinkControl, vec![0x01]);
        let pdu = bearer.receive(&ack.to_bytes()).expect("Receive").expect("PDU");
        assert_eq!(LinkControl::parse(&pdu), Ok(LinkControl::Ack));

        let bogus = Frame::new(SegmentationRole::Single, PduType::LinkControl, vec![0x05]);
        assert_eq!(bearer.receive(&bogus.to_bytes()), Err(BearerError::MalformedFrame));
        assert_eq!(bearer.state(), BearerState::Open);
    }

    #[tokio::test]
    async fn test_send_link_control_reaches_peer() {
        let (bearer, peer) = open_bearer().await;
        let mut inbound = peer.connect().await.expect("Peer connect");

        bearer
            .send_link_control(LinkControl::Close(CloseReason::Success))
            .await
            .expect("Send");

        match inbound.recv().await {
            Some(crate::bearer::LinkEvent::Frame(bytes)) => {
                assert_eq!(bytes, vec![0x04, 0x02, 0x00]);
            }
            other => panic!("Unexpected link event {:?}", other),
        }
    }
}
