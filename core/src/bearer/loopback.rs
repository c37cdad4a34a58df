//! In-memory link pair
//!
//! Two `LoopbackLink` ends share one wire: frames written by one side arrive
//! as `LinkEvent::Frame` on the other side's event stream. Used by tests and by
//! the CLI simulator in place of a radio. Writes can be paused, failed, or the
//! wire severed to exercise the bearer's failure paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::error::LinkError;
use super::link::{Link, LinkEvent, LinkEvents};

/// Default per-side inbound queue depth
pub const DEFAULT_LOOPBACK_CAPACITY: usize = 64;

struct Wire {
    max_payload_size: usize,
    capacity: usize,
    inbound: Mutex<[Option<mpsc::Sender<LinkEvent>>; 2]>,
    written: [AtomicUsize; 2],
    paused: watch::Sender<bool>,
    fail_writes: AtomicBool,
}

/// One end of an in-memory link
#[derive(Clone)]
pub struct LoopbackLink {
    side: usize,
    wire: Arc<Wire>,
}

impl LoopbackLink {
    /// Create two connected ends offering `max_payload_size` byte frames
    pub fn pair(max_payload_size: usize) -> (Self, Self) {
        Self::with_capacity(max_payload_size, DEFAULT_LOOPBACK_CAPACITY)
    }

    /// Create a pair with a specific inbound queue depth per side
    pub fn with_capacity(max_payload_size: usize, capacity: usize) -> (Self, Self) {
        let (paused, _) = watch::channel(false);
        let wire = Arc::new(Wire {
            max_payload_size,
            capacity,
            inbound: Mutex::new([None, None]),
            written: [AtomicUsize::new(0), AtomicUsize::new(0)],
            paused,
            fail_writes: AtomicBool::new(false),
        });
        (
            Self {
                side: 0,
                wire: wire.clone(),
            },
            Self { side: 1, wire },
        )
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    /// Whether this end currently holds a connection
    pub fn is_connected(&self) -> bool {
        self.wire.inbound.lock()[self.side].is_some()
    }

    /// Frames this end has handed to the wire
    pub fn frames_written(&self) -> usize {
        self.wire.written[self.side].load(Ordering::Acquire)
    }

    /// Hold every write on the wire until `resume_writes`
    pub fn pause_writes(&self) {
        self.wire.paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.wire.paused.send_replace(false);
    }

    /// Make every subsequent write on the wire fail
    pub fn fail_writes(&self, fail: bool) {
        self.wire.fail_writes.store(fail, Ordering::Release);
    }

    /// Drop the wire underneath both ends, as a supervision timeout would
    pub fn sever(&self, reason: &str) {
        let senders: Vec<mpsc::Sender<LinkEvent>> =
            self.wire.inbound.lock().iter_mut().filter_map(Option::take).collect();
        for sender in senders {
            let _ = sender.try_send(LinkEvent::Disconnected(LinkError::LinkLost(
                reason.to_string(),
            )));
        }
        debug!("Loopback wire severed: {}", reason);
    }

    /// Deliver raw bytes to this end as if the peer had written them
    pub async fn inject(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let sender = self.wire.inbound.lock()[self.side]
            .clone()
            .ok_or(LinkError::NotConnected)?;
        sender
            .send(LinkEvent::Frame(bytes.to_vec()))
            .await
            .map_err(|_| LinkError::NotConnected)
    }
}

#[async_trait]
impl Link for LoopbackLink {
    async fn connect(&self) -> Result<LinkEvents, LinkError> {
        let (tx, rx) = mpsc::channel(self.wire.capacity);
        self.wire.inbound.lock()[self.side] = Some(tx);
        debug!("Loopback side {} connected", self.side);
        Ok(rx)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        let mut paused = self.wire.paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;

        if self.wire.fail_writes.load(Ordering::Acquire) {
            return Err(LinkError::WriteFailed("loopback write rejected".to_string()));
        }

        let sender = {
            let inbound = self.wire.inbound.lock();
            if inbound[self.side].is_none() {
                return Err(LinkError::NotConnected);
            }
            inbound[self.peer()].clone()
        };
        let sender =
            sender.ok_or_else(|| LinkError::WriteFailed("peer not connected".to_string()))?;

        sender
            .send(LinkEvent::Frame(frame.to_vec()))
            .await
            .map_err(|_| LinkError::WriteFailed("peer went away".to_string()))?;
        self.wire.written[self.side].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn disconnect(&self) {
        let peer = {
            let mut inbound = self.wire.inbound.lock();
            if inbound[self.side].take().is_none() {
                return;
            }
            inbound[self.peer()].clone()
        };
        if let Some(peer) = peer {
            let _ = peer.try_send(LinkEvent::Disconnected(LinkError::LinkLost(
                "peer disconnected".to_string(),
            )));
        }
        debug!("Loopback side {} disconnected", self.side);
    }

    fn max_payload_size(&self) -> usize {
        self.wire.max_payload_size
    }
}
