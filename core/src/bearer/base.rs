//! State and SAR plumbing shared by the bearer variants
//!
//! Lifecycle state is published through a `watch` channel so a pending link
//! write can race against the bearer leaving `Open`. Inbound reassembly state
//! sits behind its own lock; the outbound path never touches it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::{BearerError, LinkError};
use super::framer::{
    Frame, LogicalPdu, PduFramer, Reassembly, SegmentationAssembly, SegmentationRole,
    MIN_FRAME_SIZE,
};
use super::link::{Link, LinkEvents};
use super::{BearerKind, BearerState};
use crate::config::BearerConfig;

/// Per-variant framing capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePolicy {
    /// Whether PDUs may span more than one frame
    pub segmentation: bool,
    /// Upper bound on the frame size regardless of what the link offers
    pub frame_size_cap: usize,
}

/// Shared bearer implementation wrapped by `GattBearer` and `AdvertisingBearer`
pub struct BearerBase {
    kind: BearerKind,
    link: Arc<dyn Link>,
    framer: PduFramer,
    policy: FramePolicy,
    frame_size_override: Option<usize>,
    state: watch::Sender<BearerState>,
    max_frame_size: AtomicUsize,
    assembly: Mutex<Option<SegmentationAssembly>>,
    events: Mutex<Option<LinkEvents>>,
}

impl BearerBase {
    /// Create a closed bearer over `link`
    pub fn new(
        kind: BearerKind,
        link: Arc<dyn Link>,
        config: &BearerConfig,
        policy: FramePolicy,
    ) -> Self {
        let (state, _) = watch::channel(BearerState::Closed);
        Self {
            kind,
            link,
            framer: PduFramer::new(config.max_pdu_len),
            policy,
            frame_size_override: config.frame_size_override,
            state,
            max_frame_size: AtomicUsize::new(0),
            assembly: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> BearerKind {
        self.kind
    }

    pub fn policy(&self) -> FramePolicy {
        self.policy
    }

    pub fn state(&self) -> BearerState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes
    pub fn watch_state(&self) -> watch::Receiver<BearerState> {
        self.state.subscribe()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.load(Ordering::Acquire)
    }

    /// Bytes currently held by an in-flight reassembly
    pub fn pending_reassembly(&self) -> Option<usize> {
        self.assembly.lock().as_ref().map(SegmentationAssembly::received_len)
    }

    fn set_state(&self, state: BearerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{} bearer {} -> {}", self.kind, previous, state);
        }
    }

    fn negotiated_frame_size(&self) -> usize {
        let offered = self.link.max_payload_size().min(self.policy.frame_size_cap);
        match self.frame_size_override {
            Some(cap) => offered.min(cap),
            None => offered,
        }
    }

    fn discard_inbound(&self) {
        if let Some(stale) = self.assembly.lock().take() {
            debug!(
                "{} bearer discarding assembly ({}/{} bytes)",
                self.kind,
                stale.received_len(),
                stale.declared_len()
            );
        }
        self.events.lock().take();
    }

    /// Connect the link and move to `Open`
    ///
    /// # Panics
    ///
    /// Panics when a lifecycle transition is already in progress.
    pub async fn open(&self) -> Result<(), BearerError> {
        let mut previous = BearerState::Closed;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == BearerState::Closed {
                *state = BearerState::Opening;
                true
            } else {
                false
            }
        });

        match previous {
            BearerState::Open => return Ok(()),
            BearerState::Opening | BearerState::Closing => panic!(
                "{} bearer open() called while {}; lifecycle calls must be serialized",
                self.kind, previous
            ),
            BearerState::Closed => {}
        }

        let events = match self.link.connect().await {
            Ok(events) => events,
            Err(e) => {
                warn!("{} bearer link connect failed: {}", self.kind, e);
                self.set_state(BearerState::Closed);
                return Err(e.into());
            }
        };

        if self.state() != BearerState::Opening {
            // Closed underneath us while connecting
            self.link.disconnect().await;
            return Err(BearerError::Closed);
        }

        let frame_size = self.negotiated_frame_size();
        if frame_size < MIN_FRAME_SIZE {
            warn!("{} bearer link offers unusable frame size {}", self.kind, frame_size);
            self.link.disconnect().await;
            self.set_state(BearerState::Closed);
            return Err(LinkError::ConnectionFailed(format!(
                "negotiated frame size {} below minimum {}",
                frame_size, MIN_FRAME_SIZE
            ))
            .into());
        }

        self.max_frame_size.store(frame_size, Ordering::Release);
        *self.assembly.lock() = None;
        *self.events.lock() = Some(events);
        self.set_state(BearerState::Open);
        info!("{} bearer open (frame size {})", self.kind, frame_size);
        Ok(())
    }

    /// Segment and write one PDU
    pub async fn send(&self, pdu: &LogicalPdu) -> Result<(), BearerError> {
        if self.state() != BearerState::Open {
            return Err(BearerError::Closed);
        }

        let max_frame_size = self.max_frame_size();
        if !self.policy.segmentation && PduFramer::frame_count(pdu.len(), max_frame_size) > 1 {
            debug!(
                "{} bearer cannot segment {} byte PDU into {} byte frames",
                self.kind,
                pdu.len(),
                max_frame_size
            );
            return Err(BearerError::PduTypeNotSupported);
        }

        let frames = self.framer.segment(pdu, max_frame_size)?;
        let total = frames.len();
        let mut state_rx = self.state.subscribe();

        for (index, frame) in frames.enumerate() {
            let bytes = frame.to_bytes();
            let written = tokio::select! {
                biased;
                _ = left_open(&mut state_rx) => {
                    debug!("{} bearer left Open during send ({}/{} frames)", self.kind, index, total);
                    return Err(BearerError::Closed);
                }
                result = self.link.write_frame(&bytes) => result,
            };

            if let Err(e) = written {
                warn!("{} bearer frame write failed: {}", self.kind, e);
                self.discard_inbound();
                self.set_state(BearerState::Closed);
                self.link.disconnect().await;
                return Err(e.into());
            }
            debug!(
                "{} bearer wrote {:?} frame {}/{} ({} bytes)",
                self.kind,
                frame.role(),
                index + 1,
                total,
                bytes.len()
            );
        }

        Ok(())
    }

    /// Release the link; always ends in `Closed`
    pub async fn close(&self) {
        let previous = self.state.send_replace(BearerState::Closing);
        self.discard_inbound();
        if previous != BearerState::Closed {
            self.link.disconnect().await;
        }
        self.set_state(BearerState::Closed);
        info!("{} bearer closed", self.kind);
    }

    /// Feed one inbound frame through reassembly
    pub fn receive(&self, bytes: &[u8]) -> Result<Option<LogicalPdu>, BearerError> {
        // Checked under the lock so a concurrent close cannot slip in between
        let mut assembly = self.assembly.lock();
        let state = self.state();
        if state != BearerState::Open {
            debug!("{} bearer dropping frame while {}", self.kind, state);
            return Ok(None);
        }

        let frame = match Frame::parse(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                assembly.take();
                return Err(e);
            }
        };

        if !self.policy.segmentation && frame.role() != SegmentationRole::Single {
            assembly.take();
            return Err(BearerError::PduTypeNotSupported);
        }

        match self.framer.reassemble(assembly.take(), frame) {
            Reassembly::Incomplete(progress) => {
                *assembly = Some(progress);
                Ok(None)
            }
            Reassembly::Complete(pdu) => {
                debug!("{} bearer reassembled {} byte {} PDU", self.kind, pdu.len(), pdu.pdu_type());
                Ok(Some(pdu))
            }
            Reassembly::Error(e) => {
                debug!("{} bearer reassembly failed: {}", self.kind, e);
                Err(e)
            }
        }
    }

    /// Forced transition to `Closed` after the link went away
    pub fn link_lost(&self, error: LinkError) {
        warn!("{} bearer lost link: {}", self.kind, error);
        self.discard_inbound();
        self.set_state(BearerState::Closed);
    }

    pub fn take_link_events(&self) -> Option<LinkEvents> {
        self.events.lock().take()
    }
}

async fn left_open(state_rx: &mut watch::Receiver<BearerState>) {
    let _ = state_rx.wait_for(|state| *state != BearerState::Open).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::link::MockLink;
    use crate::bearer::PduType;
    use tokio::sync::mpsc;

    const POLICY: FramePolicy = FramePolicy {
        segmentation: true,
        frame_size_cap: 512,
    };

    fn connected_mock(payload: usize) -> MockLink {
        let mut link = MockLink::new();
        link.expect_connect().returning(|| {
            let (_tx, rx) = mpsc::channel(8);
            Ok(rx)
        });
        link.expect_max_payload_size().return_const(payload);
        link.expect_disconnect().returning(|| ());
        link
    }

    #[tokio::test]
    async fn test_send_while_closed_writes_nothing() {
        let mut link = MockLink::new();
        link.expect_write_frame().times(0);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        let result = base.send(&LogicalPdu::provisioning(vec![1, 2, 3])).await;
        assert_eq!(result, Err(BearerError::Closed));
    }

    #[tokio::test]
    async fn test_open_send_writes_every_frame() {
        let mut link = connected_mock(20);
        link.expect_write_frame()
            .times(3)
            .returning(|frame| {
                assert!(frame.len() <= 20);
                Ok(())
            });
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        base.open().await.expect("Open");
        assert_eq!(base.state(), BearerState::Open);
        assert_eq!(base.max_frame_size(), 20);

        base.send(&LogicalPdu::provisioning(vec![0x42; 40]))
            .await
            .expect("Send");
    }

    #[tokio::test]
    async fn test_open_is_noop_when_already_open() {
        let mut link = MockLink::new();
        link.expect_connect().times(1).returning(|| {
            let (_tx, rx) = mpsc::channel(8);
            Ok(rx)
        });
        link.expect_max_payload_size().return_const(20usize);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        base.open().await.expect("First open");
        base.open().await.expect("Second open is a no-op");
        assert_eq!(base.state(), BearerState::Open);
    }

    #[tokio::test]
    #[should_panic(expected = "lifecycle calls must be serialized")]
    async fn test_open_during_transition_panics() {
        let link = MockLink::new();
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);
        base.state.send_replace(BearerState::Opening);

        let _ = base.open().await;
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_closed() {
        let mut link = MockLink::new();
        link.expect_connect()
            .returning(|| Err(LinkError::ConnectionFailed("out of range".to_string())));
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        let result = base.open().await;
        assert_eq!(
            result,
            Err(BearerError::Link(LinkError::ConnectionFailed(
                "out of range".to_string()
            )))
        );
        assert_eq!(base.state(), BearerState::Closed);
    }

    #[tokio::test]
    async fn test_open_rejects_unusable_frame_size() {
        let link = connected_mock(2);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        let result = base.open().await;
        assert!(matches!(result, Err(BearerError::Link(_))));
        assert_eq!(base.state(), BearerState::Closed);
    }

    #[tokio::test]
    async fn test_frame_size_override_caps_link_payload() {
        let link = connected_mock(185);
        let config = BearerConfig::default().with_frame_size_override(64);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &config, POLICY);

        base.open().await.expect("Open");
        assert_eq!(base.max_frame_size(), 64);
    }

    #[tokio::test]
    async fn test_write_failure_forces_closed() {
        let mut link = connected_mock(20);
        link.expect_write_frame()
            .times(1)
            .returning(|_| Err(LinkError::WriteFailed("gatt error 133".to_string())));
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        base.open().await.expect("Open");
        let result = base.send(&LogicalPdu::provisioning(vec![0x42; 40])).await;

        assert!(matches!(result, Err(BearerError::Link(LinkError::WriteFailed(_)))));
        assert_eq!(base.state(), BearerState::Closed);
    }

    #[tokio::test]
    async fn test_write_failure_releases_link() {
        let mut link = MockLink::new();
        link.expect_connect().returning(|| {
            let (_tx, rx) = mpsc::channel(8);
            Ok(rx)
        });
        link.expect_max_payload_size().return_const(20usize);
        link.expect_write_frame()
            .returning(|_| Err(LinkError::WriteFailed("gatt error 133".to_string())));
        link.expect_disconnect().times(1).returning(|| ());
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        base.open().await.expect("Open");
        assert!(base.send(&LogicalPdu::provisioning(vec![1, 2, 3])).await.is_err());

        // Already released; close must not disconnect a second time
        base.close().await;
        assert_eq!(base.state(), BearerState::Closed);
    }

    #[tokio::test]
    async fn test_send_in_closing_state_fails_closed() {
        let mut link = connected_mock(20);
        link.expect_write_frame().times(0);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        base.open().await.expect("Open");
        base.state.send_replace(BearerState::Closing);

        let result = base.send(&LogicalPdu::provisioning(vec![1])).await;
        assert_eq!(result, Err(BearerError::Closed));
    }

    #[tokio::test]
    async fn test_unsegmented_policy_rejects_before_writing() {
        let mut link = connected_mock(24);
        link.expect_write_frame().times(0);
        let policy = FramePolicy {
            segmentation: false,
            frame_size_cap: 24,
        };
        let base = BearerBase::new(BearerKind::Advertising, Arc::new(link), &BearerConfig::default(), policy);

        base.open().await.expect("Open");
        let result = base.send(&LogicalPdu::provisioning(vec![0; 24])).await;
        assert_eq!(result, Err(BearerError::PduTypeNotSupported));
        assert_eq!(base.state(), BearerState::Open);
    }

    #[tokio::test]
    async fn test_receive_reassembles_and_close_discards() {
        let link = connected_mock(20);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);
        base.open().await.expect("Open");

        let first = Frame::new(SegmentationRole::First, PduType::Provisioning, vec![0x00, 4, 1, 2]);
        assert_eq!(base.receive(&first.to_bytes()), Ok(None));
        assert_eq!(base.pending_reassembly(), Some(2));

        base.close().await;
        assert_eq!(base.state(), BearerState::Closed);
        assert_eq!(base.pending_reassembly(), None);

        let last = Frame::new(SegmentationRole::Last, PduType::Provisioning, vec![3, 4]);
        assert_eq!(base.receive(&last.to_bytes()), Ok(None));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_leaves_no_assembly_behind_concurrent_receive() {
        use std::sync::atomic::AtomicBool;

        for _ in 0..20 {
            let link = connected_mock(20);
            let base = Arc::new(BearerBase::new(
                BearerKind::Gatt,
                Arc::new(link),
                &BearerConfig::default(),
                POLICY,
            ));
            base.open().await.expect("Open");

            let stop = Arc::new(AtomicBool::new(false));
            let feeder = {
                let base = base.clone();
                let stop = stop.clone();
                tokio::task::spawn_blocking(move || {
                    let first =
                        Frame::new(SegmentationRole::First, PduType::Provisioning, vec![0x00, 4, 1, 2])
                            .to_bytes();
                    while !stop.load(Ordering::Acquire) {
                        let _ = base.receive(&first);
                    }
                })
            };

            tokio::task::yield_now().await;
            base.close().await;
            assert_eq!(base.pending_reassembly(), None);

            stop.store(true, Ordering::Release);
            feeder.await.expect("Feeder");
            assert_eq!(base.pending_reassembly(), None);
        }
    }

    #[tokio::test]
    async fn test_receive_error_discards_assembly_and_stays_open() {
        let link = connected_mock(20);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);
        base.open().await.expect("Open");

        let first = Frame::new(SegmentationRole::First, PduType::Provisioning, vec![0x00, 4, 1, 2]);
        base.receive(&first.to_bytes()).expect("First frame");

        assert_eq!(base.receive(&[]), Err(BearerError::MalformedFrame));
        assert_eq!(base.pending_reassembly(), None);
        assert_eq!(base.state(), BearerState::Open);
    }

    #[tokio::test]
    async fn test_link_lost_forces_closed() {
        let link = connected_mock(20);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);
        base.open().await.expect("Open");
        assert!(base.take_link_events().is_some());

        base.link_lost(LinkError::LinkLost("supervision timeout".to_string()));
        assert_eq!(base.state(), BearerState::Closed);
        assert!(base.take_link_events().is_none());
    }

    #[tokio::test]
    async fn test_close_from_closed_still_ends_closed() {
        let mut link = MockLink::new();
        link.expect_disconnect().times(0);
        let base = BearerBase::new(BearerKind::Gatt, Arc::new(link), &BearerConfig::default(), POLICY);

        let mut state_rx = base.watch_state();
        base.close().await;
        assert_eq!(base.state(), BearerState::Closed);
        assert!(state_rx.has_changed().expect("Sender alive"));
    }
}
