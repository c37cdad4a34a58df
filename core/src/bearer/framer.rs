//! Segmentation and reassembly of provisioning PDUs
//!
//! Every frame starts with a one byte header: the segmentation role in the two
//! most significant bits and the bearer PDU type discriminator in the low six
//! bits. A `First` frame carries the total PDU length as a big-endian `u16`
//! ahead of the PDU bytes.
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! +-------+-----------------------+
//! | role  |     discriminator     |   payload...
//! +-------+-----------------------+
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::BearerError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 1;

/// Size of the total-length prefix carried by `First` frames
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Smallest frame size that can carry a segmented PDU
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + LENGTH_PREFIX_SIZE;

/// Default upper bound for a reassembled PDU
pub const DEFAULT_MAX_PDU_LEN: u16 = 512;

const ROLE_SHIFT: u8 = 6;
const DISCRIMINATOR_MASK: u8 = 0x3F;

/// Segmentation role of a frame (two bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentationRole {
    /// Complete PDU in one frame
    Single = 0b00,
    /// First segment, carries the total length
    First = 0b01,
    /// Middle segment
    Continuation = 0b10,
    /// Final segment
    Last = 0b11,
}

impl SegmentationRole {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => SegmentationRole::Single,
            0b01 => SegmentationRole::First,
            0b10 => SegmentationRole::Continuation,
            _ => SegmentationRole::Last,
        }
    }
}

/// Bearer-level PDU type discriminator (six bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PduType {
    /// Mesh network PDU
    NetworkPdu = 0x00,
    /// Mesh beacon
    MeshBeacon = 0x01,
    /// Proxy configuration message
    ProxyConfiguration = 0x02,
    /// Provisioning PDU (invite, capabilities, public key, confirmation...)
    Provisioning = 0x03,
    /// Link establishment control (open, ack, close)
    LinkControl = 0x04,
}

impl PduType {
    /// Get the numeric discriminator
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Parse a six bit discriminator
    pub fn from_value(value: u8) -> Result<Self, BearerError> {
        match value {
            0x00 => Ok(PduType::NetworkPdu),
            0x01 => Ok(PduType::MeshBeacon),
            0x02 => Ok(PduType::ProxyConfiguration),
            0x03 => Ok(PduType::Provisioning),
            0x04 => Ok(PduType::LinkControl),
            _ => Err(BearerError::PduTypeNotSupported),
        }
    }
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PduType::NetworkPdu => write!(f, "network"),
            PduType::MeshBeacon => write!(f, "beacon"),
            PduType::ProxyConfiguration => write!(f, "proxy-config"),
            PduType::Provisioning => write!(f, "provisioning"),
            PduType::LinkControl => write!(f, "link-control"),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub role: SegmentationRole,
    pub pdu_type: PduType,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(role: SegmentationRole, pdu_type: PduType) -> Self {
        Self { role, pdu_type }
    }

    /// Serialize to the header byte
    pub fn to_byte(&self) -> u8 {
        ((self.role as u8) << ROLE_SHIFT) | (self.pdu_type.value() & DISCRIMINATOR_MASK)
    }

    /// Deserialize from the header byte
    pub fn from_byte(byte: u8) -> Result<Self, BearerError> {
        let role = SegmentationRole::from_bits(byte >> ROLE_SHIFT);
        let pdu_type = PduType::from_value(byte & DISCRIMINATOR_MASK)?;
        Ok(Self { role, pdu_type })
    }
}

/// One bearer-sized frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from its parts
    pub fn new(role: SegmentationRole, pdu_type: PduType, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader::new(role, pdu_type),
            payload,
        }
    }

    pub fn header(&self) -> FrameHeader {
        self.header
    }

    pub fn role(&self) -> SegmentationRole {
        self.header.role
    }

    pub fn pdu_type(&self) -> PduType {
        self.header.pdu_type
    }

    /// Payload after the header byte (includes the length prefix of `First` frames)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.push(self.header.to_byte());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decode from wire bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, BearerError> {
        let (&header_byte, payload) = bytes.split_first().ok_or(BearerError::MalformedFrame)?;
        let header = FrameHeader::from_byte(header_byte)?;

        match header.role {
            SegmentationRole::First if payload.len() < LENGTH_PREFIX_SIZE => {
                return Err(BearerError::MalformedFrame)
            }
            SegmentationRole::Continuation | SegmentationRole::Last if payload.is_empty() => {
                return Err(BearerError::MalformedFrame)
            }
            _ => {}
        }

        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// A complete provisioning-layer message
///
/// Immutable once built; cloning shares the underlying bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct LogicalPdu {
    pdu_type: PduType,
    data: Arc<[u8]>,
}

impl LogicalPdu {
    /// Create a PDU of the given bearer type
    pub fn new(pdu_type: PduType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            pdu_type,
            data: Arc::from(data.into()),
        }
    }

    /// Create a provisioning PDU
    pub fn provisioning(data: impl Into<Vec<u8>>) -> Self {
        Self::new(PduType::Provisioning, data)
    }

    pub fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for LogicalPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalPdu")
            .field("pdu_type", &self.pdu_type)
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

/// Reassembly state for one multi-frame PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationAssembly {
    pdu_type: PduType,
    declared_len: u16,
    buffer: Vec<u8>,
}

impl SegmentationAssembly {
    pub fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    /// Total length announced by the `First` frame
    pub fn declared_len(&self) -> u16 {
        self.declared_len
    }

    /// Bytes accumulated so far
    pub fn received_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Outcome of feeding one frame into reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More frames needed; carries the updated assembly
    Incomplete(SegmentationAssembly),
    /// A full PDU was reconstructed
    Complete(LogicalPdu),
    /// The exchange failed; any assembly is discarded
    Error(BearerError),
}

/// Splits PDUs into frames and rebuilds them
#[derive(Debug, Clone, Copy)]
pub struct PduFramer {
    max_pdu_len: u16,
}

impl Default for PduFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PDU_LEN)
    }
}

impl PduFramer {
    /// Create a framer that refuses PDUs longer than `max_pdu_len`
    pub fn new(max_pdu_len: u16) -> Self {
        Self { max_pdu_len }
    }

    pub fn max_pdu_len(&self) -> u16 {
        self.max_pdu_len
    }

    /// Number of frames `segment` produces for a PDU of `pdu_len` bytes
    ///
    /// Zero when `max_frame_size` is below `MIN_FRAME_SIZE`, where `segment`
    /// refuses to produce frames at all.
    pub fn frame_count(pdu_len: usize, max_frame_size: usize) -> usize {
        if max_frame_size < MIN_FRAME_SIZE {
            return 0;
        }
        let single_capacity = max_frame_size - HEADER_SIZE;
        if pdu_len <= single_capacity {
            return 1;
        }
        let remaining = pdu_len - (max_frame_size - MIN_FRAME_SIZE);
        1 + (remaining + single_capacity - 1) / single_capacity
    }

    /// Split a PDU into frames of at most `max_frame_size` bytes
    pub fn segment<'a>(
        &self,
        pdu: &'a LogicalPdu,
        max_frame_size: usize,
    ) -> Result<Segments<'a>, BearerError> {
        if max_frame_size < MIN_FRAME_SIZE {
            return Err(BearerError::MalformedFrame);
        }
        if pdu.len() > self.max_pdu_len as usize {
            return Err(BearerError::AssemblyOverflow);
        }

        Ok(Segments {
            pdu_type: pdu.pdu_type(),
            data: pdu.as_bytes(),
            max_frame_size,
            offset: 0,
            remaining_frames: Self::frame_count(pdu.len(), max_frame_size),
        })
    }

    /// Feed one frame into the reassembly state
    pub fn reassemble(&self, state: Option<SegmentationAssembly>, frame: Frame) -> Reassembly {
        let pdu_type = frame.pdu_type();

        match frame.role() {
            SegmentationRole::Single => {
                if let Some(stale) = state {
                    debug!(
                        "Single frame discards stale assembly ({}/{} bytes)",
                        stale.received_len(),
                        stale.declared_len
                    );
                }
                if frame.payload().len() > self.max_pdu_len as usize {
                    return Reassembly::Error(BearerError::AssemblyOverflow);
                }
                Reassembly::Complete(LogicalPdu::new(pdu_type, frame.into_payload()))
            }
            SegmentationRole::First => {
                if let Some(stale) = state {
                    debug!(
                        "First frame replaces stale assembly ({}/{} bytes)",
                        stale.received_len(),
                        stale.declared_len
                    );
                }
                let payload = frame.into_payload();
                if payload.len() < LENGTH_PREFIX_SIZE {
                    return Reassembly::Error(BearerError::MalformedFrame);
                }
                let declared_len = u16::from_be_bytes([payload[0], payload[1]]);
                if declared_len > self.max_pdu_len {
                    return Reassembly::Error(BearerError::AssemblyOverflow);
                }
                let data = &payload[LENGTH_PREFIX_SIZE..];
                if declared_len == 0 || data.len() >= declared_len as usize {
                    return Reassembly::Error(BearerError::MalformedFrame);
                }

                let mut buffer = Vec::with_capacity(declared_len as usize);
                buffer.extend_from_slice(data);
                Reassembly::Incomplete(SegmentationAssembly {
                    pdu_type,
                    declared_len,
                    buffer,
                })
            }
            role @ (SegmentationRole::Continuation | SegmentationRole::Last) => {
                let Some(mut assembly) = state else {
                    return Reassembly::Error(BearerError::MalformedFrame);
                };
                if assembly.pdu_type != pdu_type {
                    return Reassembly::Error(BearerError::MalformedFrame);
                }

                let declared = assembly.declared_len as usize;
                let received = assembly.buffer.len() + frame.payload().len();
                if received > declared {
                    return Reassembly::Error(BearerError::AssemblyOverflow);
                }
                assembly.buffer.extend_from_slice(frame.payload());

                match role {
                    // A continuation that fills the PDU should have been marked last
                    SegmentationRole::Continuation if received == declared => {
                        Reassembly::Error(BearerError::MalformedFrame)
                    }
                    SegmentationRole::Continuation => Reassembly::Incomplete(assembly),
                    _ if received < declared => Reassembly::Error(BearerError::MalformedFrame),
                    _ => Reassembly::Complete(LogicalPdu::new(pdu_type, assembly.buffer)),
                }
            }
        }
    }
}

/// Lazy, ordered frames of one PDU
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    pdu_type: PduType,
    data: &'a [u8],
    max_frame_size: usize,
    offset: usize,
    remaining_frames: usize,
}

impl Iterator for Segments<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.remaining_frames == 0 {
            return None;
        }
        let total = PduFramer::frame_count(self.data.len(), self.max_frame_size);
        let is_first = self.remaining_frames == total;
        self.remaining_frames -= 1;

        if is_first && total == 1 {
            self.offset = self.data.len();
            return Some(Frame::new(
                SegmentationRole::Single,
                self.pdu_type,
                self.data.to_vec(),
            ));
        }

        if is_first {
            let take = self.max_frame_size - MIN_FRAME_SIZE;
            let mut payload = Vec::with_capacity(self.max_frame_size - HEADER_SIZE);
            payload.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            payload.extend_from_slice(&self.data[..take]);
            self.offset = take;
            return Some(Frame::new(SegmentationRole::First, self.pdu_type, payload));
        }

        let take = (self.data.len() - self.offset).min(self.max_frame_size - HEADER_SIZE);
        let chunk = self.data[self.offset..self.offset + take].to_vec();
        self.offset += take;
        let role = if self.remaining_frames == 0 {
            SegmentationRole::Last
        } else {
            SegmentationRole::Continuation
        };
        Some(Frame::new(role, self.pdu_type, chunk))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining_frames, Some(self.remaining_frames))
    }
}

impl ExactSizeIterator for Segments<'_> {}
