//! Signaling subscription
//!
//! Each peer connection keeps one control connection to the rendezvous
//! service. It registers the local address with `setId` and then turns every
//! inbound `create` request into a [`CreateRequest`] for the responder side
//! of the handshake.

use crate::channel::ErrorHandler;
use crate::protocol::{ChannelConfig, ControlMessage};
use crate::transport::{Connector, DuplexConnection, DuplexSink, Frame, Route, TransportEvent};
use crate::Error;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingState {
    /// Not started
    Unregistered,
    /// Control connection opening
    Registering,
    /// `setId` sent; inbound requests are dispatched
    Registered,
    /// Control connection gone
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingState::Unregistered => "unregistered",
            SignalingState::Registering => "registering",
            SignalingState::Registered => "registered",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Inbound request to open a channel back to `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Address of the requesting peer
    pub address: String,
    /// Requested channel parameters
    pub config: ChannelConfig,
}

/// Callback for inbound channel requests
pub type CreateHandler = Arc<dyn Fn(CreateRequest) + Send + Sync>;

/// Control connection registered under one local address
pub struct SignalingSubscription {
    id: Uuid,
    address: String,
    state: watch::Sender<SignalingState>,
    sink: Mutex<Option<Arc<dyn DuplexSink>>>,
    close_requested: AtomicBool,
    shutdown: Notify,
}

impl fmt::Debug for SignalingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingSubscription")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl SignalingSubscription {
    /// Create an unregistered subscription for `address`
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(SignalingState::Unregistered);
        Arc::new(Self {
            id: Uuid::new_v4(),
            address: address.into(),
            state,
            sink: Mutex::new(None),
            close_requested: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Open the control connection and start dispatching requests
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        self: &Arc<Self>,
        connector: Arc<dyn Connector>,
        on_create: CreateHandler,
        on_error: ErrorHandler,
    ) {
        self.state.send_replace(SignalingState::Registering);
        tokio::spawn(Arc::clone(self).run(connector, on_create, on_error));
    }

    /// Address this subscription registers under
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current lifecycle state
    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    /// Wait until the subscription reaches `target` or a later state
    pub async fn wait_for(&self, target: SignalingState) -> SignalingState {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(|state| *state >= target).await.map(|state| *state);
        reached.unwrap_or(SignalingState::Closed)
    }

    /// Close the control connection
    pub async fn close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();

        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            if let Err(e) = sink.close().await {
                debug!("Signaling connection {} close failed: {}", self.id, e);
            }
        }
        self.state.send_replace(SignalingState::Closed);
    }

    async fn run(
        self: Arc<Self>,
        connector: Arc<dyn Connector>,
        on_create: CreateHandler,
        on_error: ErrorHandler,
    ) {
        debug!("Opening signaling connection {} for {}", self.id, self.address);

        let connected = tokio::select! {
            result = connector.connect(Route::Signaling) => result,
            _ = self.shutdown.notified() => {
                self.state.send_replace(SignalingState::Closed);
                return;
            }
        };

        let DuplexConnection { sink, mut events } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                error!("Signaling connection for {} failed: {}", self.address, e);
                on_error(&e);
                self.state.send_replace(SignalingState::Closed);
                return;
            }
        };

        let attached = {
            let mut slot = self.sink.lock();
            if self.close_requested.load(Ordering::SeqCst) {
                false
            } else {
                *slot = Some(Arc::clone(&sink));
                true
            }
        };
        if !attached {
            let _ = sink.close().await;
            self.state.send_replace(SignalingState::Closed);
            return;
        }

        match ControlMessage::set_id(self.address.clone()).to_text() {
            Ok(text) => match sink.send(Frame::Text(text)).await {
                Ok(()) => {
                    info!("Registered signaling subscription as {}", self.address);
                    self.state.send_replace(SignalingState::Registered);
                }
                Err(e) => {
                    error!("Failed to register {}: {}", self.address, e);
                    on_error(&e);
                }
            },
            Err(e) => on_error(&e),
        }

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.shutdown.notified() => break,
            };

            match event {
                Some(TransportEvent::Message(Frame::Text(text))) => {
                    self.dispatch(&text, &on_create)
                }
                Some(TransportEvent::Message(Frame::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame on signaling connection", data.len());
                }
                Some(TransportEvent::Error(message)) => {
                    error!("Signaling connection {} error: {}", self.id, message);
                    on_error(&Error::Transport(message));
                }
                Some(TransportEvent::Closed) | None => {
                    warn!("Signaling connection for {} closed", self.address);
                    break;
                }
            }
        }

        self.sink.lock().take();
        self.state.send_replace(SignalingState::Closed);
    }

    fn dispatch(&self, text: &str, on_create: &CreateHandler) {
        match ControlMessage::from_text(text) {
            Ok(ControlMessage::Create { address, config }) => {
                debug!(
                    "Inbound channel request '{}' from {} on {}",
                    config.label, address, self.address
                );
                on_create(CreateRequest { address, config });
            }
            Ok(other) => debug!("Ignoring '{}' control message", other.kind()),
            Err(e) => debug!("Ignoring undecodable control frame: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRendezvous;
    use crate::protocol::READY_TOKEN;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn handlers() -> (
        CreateHandler,
        ErrorHandler,
        mpsc::UnboundedReceiver<CreateRequest>,
        mpsc::UnboundedReceiver<Error>,
    ) {
        let (create_tx, create_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let on_create: CreateHandler = Arc::new(move |request| {
            let _ = create_tx.send(request);
        });
        let on_error: ErrorHandler = Arc::new(move |error: &Error| {
            let _ = error_tx.send(error.clone());
        });
        (on_create, on_error, create_rx, error_rx)
    }

    #[tokio::test]
    async fn test_registers_with_set_id() {
        let rendezvous = MockRendezvous::new();
        let (on_create, on_error, _create_rx, _error_rx) = handlers();

        let subscription = SignalingSubscription::new("pc.alice");
        assert_eq!(subscription.state(), SignalingState::Unregistered);
        subscription.start(rendezvous.clone(), on_create, on_error);
        assert_eq!(subscription.state(), SignalingState::Registering);

        let registered = subscription.wait_for(SignalingState::Registered);
        let state = timeout(Duration::from_secs(2), registered)
            .await
            .unwrap();
        assert_eq!(state, SignalingState::Registered);
        assert!(rendezvous.is_registered("pc.alice"));

        let frames = rendezvous.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].route, Route::Signaling);
        assert_eq!(frames[0].text, r#"["setId","pc.alice"]"#);
    }

    #[tokio::test]
    async fn test_dispatches_create_and_ignores_other_kinds() {
        let (on_create, _on_error, mut create_rx, _error_rx) = handlers();
        let subscription = SignalingSubscription::new("pc.alice");

        subscription.dispatch(r#"["hello","world"]"#, &on_create);
        subscription.dispatch(READY_TOKEN, &on_create);
        subscription.dispatch(r#"["create","pc.bob",{"label":"x","reliable":false}]"#, &on_create);

        let request = create_rx.try_recv().unwrap();
        assert_eq!(request.address, "pc.bob");
        assert_eq!(request.config, ChannelConfig::new("x").with_reliable(false));
        assert!(create_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_without_retry() {
        let rendezvous = MockRendezvous::new();
        rendezvous.refuse_connections(true);
        let (on_create, on_error, _create_rx, mut error_rx) = handlers();

        let subscription = SignalingSubscription::new("pc.alice");
        subscription.start(rendezvous.clone(), on_create, on_error);

        let error = timeout(Duration::from_secs(2), error_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(error.is_transport_error());
        assert_eq!(
            subscription.wait_for(SignalingState::Closed).await,
            SignalingState::Closed
        );
        assert_eq!(rendezvous.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_registration() {
        let rendezvous = MockRendezvous::new();
        let (on_create, on_error, _create_rx, mut error_rx) = handlers();

        let subscription = SignalingSubscription::new("pc.alice");
        subscription.start(rendezvous.clone(), on_create, on_error);
        subscription.wait_for(SignalingState::Registered).await;

        rendezvous.inject_error(&Route::Signaling, "relay hiccup");
        let error = timeout(Duration::from_secs(2), error_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.to_string(), "Transport error: relay hiccup");
        assert_eq!(subscription.state(), SignalingState::Registered);
    }

    #[tokio::test]
    async fn test_close_while_connecting_leaves_nothing_open() {
        let rendezvous = MockRendezvous::new();
        let (on_create, on_error, _create_rx, _error_rx) = handlers();

        let subscription = SignalingSubscription::new("pc.alice");
        subscription.start(rendezvous.clone(), on_create, on_error);
        subscription.close().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscription.state(), SignalingState::Closed);
        assert_eq!(rendezvous.open_connection_count(), 0);
        assert!(!rendezvous.is_registered("pc.alice"));
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let rendezvous = MockRendezvous::new();
        let (on_create, on_error, _create_rx, _error_rx) = handlers();

        let subscription = SignalingSubscription::new("pc.alice");
        subscription.start(rendezvous.clone(), on_create, on_error);
        subscription.wait_for(SignalingState::Registered).await;

        subscription.close().await;
        assert_eq!(subscription.state(), SignalingState::Closed);
        assert!(!rendezvous.is_registered("pc.alice"));
    }
}
