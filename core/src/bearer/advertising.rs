// Advertising bearer (PB-ADV)
//
// Advertising delivery is unordered and the frame header has no room for a
// sequence number, so this bearer never segments: every PDU must fit one
// `Single` frame. Anything else is rejected with `PduTypeNotSupported`
// before a byte reaches the link.

use std::sync::Arc;

use async_trait::async_trait;

use super::base::{BearerBase, FramePolicy};
use super::error::{BearerError, LinkError};
use super::framer::{LogicalPdu, HEADER_SIZE};
use super::link::{Link, LinkEvents};
use super::{Bearer, BearerKind, BearerState};
use crate::config::{BearerConfig, ConfigError};

/// Largest frame carried in one advertising PDU
pub const ADV_MAX_FRAME_SIZE: usize = 24;

/// Connectionless bearer over an advertising link
pub struct AdvertisingBearer {
    base: BearerBase,
}

impl AdvertisingBearer {
    /// Create a new advertising bearer
    pub fn new(link: Arc<dyn Link>, config: BearerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = FramePolicy {
            segmentation: false,
            frame_size_cap: ADV_MAX_FRAME_SIZE,
        };
        Ok(Self {
            base: BearerBase::new(BearerKind::Advertising, link, &config, policy),
        })
    }

    /// Largest PDU this bearer can carry once open
    pub fn max_pdu_len(&self) -> usize {
        self.base.max_frame_size().saturating_sub(HEADER_SIZE)
    }

    pub fn base(&self) -> &BearerBase {
        &self.base
    }
}

#[async_trait]
impl Bearer for AdvertisingBearer {
    fn kind(&self) -> BearerKind {
        BearerKind::Advertising
    }

    fn state(&self) -> BearerState {
        self.base.state()
    }

    fn max_frame_size(&self) -> usize {
        self.base.max_frame_size()
    }

    async fn open(&self) -> Result<(), BearerError> {
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
