//! Bearer session — lifecycle, listener delivery and the inbound pump
//!
//! A session owns one bearer for the lifetime of a provisioning attempt. It
//! serializes outbound PDUs, runs a pump task that feeds inbound frames into
//! the bearer, and reports everything to a single registered listener over a
//! bounded channel. After `close()` returns no further event is delivered
//! until the session is opened again.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bearer::{
    Bearer, BearerError, BearerState, LinkError, LinkEvent, LinkEvents, LogicalPdu,
};
use crate::config::{BearerConfig, ConfigError};

/// Notification delivered to the session listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerEvent {
    /// Lifecycle transition, with the failure that caused it if any
    StateChanged {
        state: BearerState,
        cause: Option<BearerError>,
    },
    /// A complete PDU arrived from the peer
    PduReceived(LogicalPdu),
    /// An inbound exchange was aborted; the bearer stays open
    ExchangeFailed(BearerError),
}

impl BearerEvent {
    fn state(state: BearerState) -> Self {
        BearerEvent::StateChanged { state, cause: None }
    }
}

struct Delivery {
    listener: Option<mpsc::Sender<BearerEvent>>,
    active: bool,
}

impl Delivery {
    /// Deliver, waiting for room in the listener channel
    async fn send(&self, event: BearerEvent) {
        if !self.active {
            return;
        }
        if let Some(listener) = &self.listener {
            if listener.send(event).await.is_err() {
                debug!("Session listener went away");
            }
        }
    }

    /// Deliver only if the listener has room right now
    fn try_send(&self, event: BearerEvent) {
        if !self.active {
            return;
        }
        if let Some(listener) = &self.listener {
            match listener.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!("Session listener full, dropping {:?}", event);
                }
                Err(TrySendError::Closed(_)) => debug!("Session listener went away"),
            }
        }
    }
}

struct SessionShared<B> {
    bearer: B,
    delivery: tokio::sync::Mutex<Delivery>,
}

impl<B: Bearer> SessionShared<B> {
    async fn emit(&self, event: BearerEvent) {
        self.delivery.lock().await.send(event).await;
    }

    /// Force the session closed after the link went away
    ///
    /// Only the pump may wait for listener room; the send path must never
    /// park `close()` behind a slow listener.
    async fn link_failed(&self, error: LinkError, wait_for_listener: bool) {
        let mut delivery = self.delivery.lock().await;
        if !delivery.active {
            return;
        }

        self.bearer.link_lost(error.clone());
        let event = BearerEvent::StateChanged {
            state: BearerState::Closed,
            cause: Some(BearerError::Link(error)),
        };
        if wait_for_listener {
            delivery.send(event).await;
        } else {
            delivery.try_send(event);
        }
        delivery.active = false;
    }
}

async fn run_pump<B: Bearer>(shared: Arc<SessionShared<B>>, mut events: LinkEvents) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Frame(bytes) => match shared.bearer.receive(&bytes) {
                Ok(Some(pdu)) => shared.emit(BearerEvent::PduReceived(pdu)).await,
                Ok(None) => {}
                Err(e) => {
                    debug!("Inbound exchange failed: {}", e);
                    shared.emit(BearerEvent::ExchangeFailed(e)).await;
                }
            },
            LinkEvent::Disconnected(error) => {
                shared.link_failed(error, true).await;
                return;
            }
        }
    }

    // The bearer released the link itself; whoever closed it reports why
    if shared.bearer.state() == BearerState::Closed {
        return;
    }
    shared
        .link_failed(LinkError::LinkLost("link event stream ended".to_string()), true)
        .await;
}

/// Owner-facing handle around one bearer
pub struct BearerSession<B: Bearer + 'static> {
    shared: Arc<SessionShared<B>>,
    lifecycle: tokio::sync::Mutex<()>,
    send_queue: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
    listener_capacity: usize,
}

impl<B: Bearer + 'static> BearerSession<B> {
    /// Create a closed session around `bearer`
    pub fn new(bearer: B, config: &BearerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(SessionShared {
                bearer,
                delivery: tokio::sync::Mutex::new(Delivery {
                    listener: None,
                    active: false,
                }),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            send_queue: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
            listener_capacity: config.listener_capacity,
        })
    }

    pub fn bearer(&self) -> &B {
        &self.shared.bearer
    }

    pub fn state(&self) -> BearerState {
        self.shared.bearer.state()
    }

    /// Register the listener, replacing any previous one
    ///
    /// The previous receiver sees its channel end once it has drained.
    pub async fn subscribe(&self) -> mpsc::Receiver<BearerEvent> {
        let (tx, rx) = mpsc::channel(self.listener_capacity);
        self.shared.delivery.lock().await.listener = Some(tx);
        rx
    }

    async fn stop_pump(&self) {
        let handle = self.pump.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Open the bearer and start the inbound pump
    ///
    /// A no-op when already open. A failed open reports
    /// `StateChanged { Closed, cause }` and returns the error.
    ///
    /// Lifecycle events never wait for listener room. A listener that is
    /// `listener_capacity` events behind misses them; `state()` stays current.
    pub async fn open(&self) -> Result<(), BearerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shared.bearer.state() == BearerState::Open {
            return Ok(());
        }
        self.stop_pump().await;

        {
            let mut delivery = self.shared.delivery.lock().await;
            delivery.active = true;
            delivery.try_send(BearerEvent::state(BearerState::Opening));
        }

        if let Err(e) = self.shared.bearer.open().await {
            warn!("{} session failed to open: {}", self.shared.bearer.kind(), e);
            let mut delivery = self.shared.delivery.lock().await;
            delivery.try_send(BearerEvent::StateChanged {
                state: BearerState::Closed,
                cause: Some(e.clone()),
            });
            delivery.active = false;
            return Err(e);
        }

        let events = self.shared.bearer.take_link_events();
        {
            let delivery = self.shared.delivery.lock().await;
            if !delivery.active || self.shared.bearer.state() != BearerState::Open {
                // Link failed before the pump could start; Closed already reported
                return Err(BearerError::Closed);
            }
            delivery.try_send(BearerEvent::state(BearerState::Open));
        }

        if let Some(events) = events {
            let shared = self.shared.clone();
            *self.pump.lock() = Some(tokio::spawn(run_pump(shared, events)));
        }
        info!(
            "{} session open (frame size {})",
            self.shared.bearer.kind(),
            self.shared.bearer.max_frame_size()
        );
        Ok(())
    }

    /// Send one PDU; concurrent callers are served in arrival order
    pub async fn send(&self, pdu: &LogicalPdu) -> Result<(), BearerError> {
        let _turn = self.send_queue.lock().await;
        match self.shared.bearer.send(pdu).await {
            Err(BearerError::Link(error)) => {
                self.shared.link_failed(error.clone(), false).await;
                Err(BearerError::Link(error))
            }
            result => result,
        }
    }

    /// Close the bearer; no event is delivered after this returns
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_pump().await;

        let mut delivery = self.shared.delivery.lock().await;
        if !delivery.active && self.shared.bearer.state() == BearerState::Closed {
            return;
        }

        delivery.try_send(BearerEvent::state(BearerState::Closing));
        self.shared.bearer.close().await;
        delivery.try_send(BearerEvent::state(BearerState::Closed));
        delivery.active = false;
        info!("{} session closed", self.shared.bearer.kind());
    }
}

impl<B: Bearer + 'static> Drop for BearerSession<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().take() {
            handle.abort();
        }
    }
}
