//! Polyfilled peer connection
//!
//! [`PeerConnection`] wraps a native session negotiator. Accepting a local
//! description binds the local identity and subscribes to inbound channel
//! requests; accepting a remote description binds the default target for
//! [`PeerConnection::create_data_channel`]. The wrapped negotiator sees every
//! description unchanged.

use crate::channel::{DataChannel, ErrorHandler, ReadyState};
use crate::config::PolyfillConfig;
use crate::handshake;
use crate::protocol::ChannelConfig;
use crate::sdp::{PeerIdentity, SessionDescription};
use crate::signaling::{CreateHandler, SignalingState, SignalingSubscription};
use crate::transport::Connector;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum label length in bytes
pub const MAX_LABEL_LEN: usize = 65535;

/// Connection ready state, sourced from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Callback for inbound channels
pub type DataChannelHandler = Arc<dyn Fn(DataChannel) + Send + Sync>;

/// Native session negotiation calls wrapped by the polyfill
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    /// Accept the local description
    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    /// Accept the remote description
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;
}

/// Negotiator for hosts without a native session object; accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedNegotiator;

#[async_trait]
impl SessionNegotiator for DetachedNegotiator {
    async fn set_local_description(&self, _description: &SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, _description: &SessionDescription) -> Result<()> {
        Ok(())
    }
}

/// Options for [`PeerConnection::create_data_channel`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelInit {
    /// Delivery guarantee (reliable when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
}

impl DataChannelInit {
    pub fn reliable(reliable: bool) -> Self {
        Self {
            reliable: Some(reliable),
        }
    }
}

pub(crate) struct ConnectionInner {
    id: Uuid,
    config: Arc<PolyfillConfig>,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
    local: Mutex<Option<PeerIdentity>>,
    remote_address: Mutex<Option<String>>,
    subscription: Mutex<Option<Arc<SignalingSubscription>>>,
    channels: Mutex<Vec<DataChannel>>,
    on_datachannel: Mutex<Option<DataChannelHandler>>,
    on_error: Mutex<Option<ErrorHandler>>,
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        *self.state.lock() == ConnectionState::Closed
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub(crate) fn track(&self, channel: DataChannel) {
        let mut channels = self.channels.lock();
        channels.retain(|c| c.ready_state() != ReadyState::Closed);
        channels.push(channel);
    }

    pub(crate) fn announce_channel(&self, channel: DataChannel) {
        info!(
            "Connection {} received data channel '{}'",
            self.id,
            channel.label()
        );
        let handler = self.on_datachannel.lock().clone();
        match handler {
            Some(handler) => handler(channel),
            None => debug!("No datachannel observer on connection {}", self.id),
        }
    }

    pub(crate) fn report_error(&self, error: &Error) {
        let handler = self.on_error.lock().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

/// Peer connection with polyfilled data channels
pub struct PeerConnection {
    inner: Arc<ConnectionInner>,
    negotiator: Arc<dyn SessionNegotiator>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.inner.id)
            .field("ready_state", &self.ready_state())
            .field("local_address", &self.local_address())
            .field("remote_address", &self.remote_address())
            .finish()
    }
}

impl PeerConnection {
    /// Wrap `negotiator`, opening dedicated connections through `connector`
    pub fn new(
        config: Arc<PolyfillConfig>,
        connector: Arc<dyn Connector>,
        negotiator: Arc<dyn SessionNegotiator>,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            config,
            connector,
            state: Mutex::new(ConnectionState::Connecting),
            local: Mutex::new(None),
            remote_address: Mutex::new(None),
            subscription: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            on_datachannel: Mutex::new(None),
            on_error: Mutex::new(None),
        });
        debug!("Created peer connection {}", inner.id);
        Self { inner, negotiator }
    }

    /// Unique id of this connection (used in log lines)
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn ready_state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Update the ready state reported by the host. `Closed` is terminal;
    /// use [`PeerConnection::close`] to also tear down channels.
    pub fn set_ready_state(&self, next: ConnectionState) {
        let mut state = self.inner.state.lock();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// Local peer identity, once bound
    pub fn local_identity(&self) -> Option<PeerIdentity> {
        self.inner.local.lock().clone()
    }

    /// Routable local address, once bound
    pub fn local_address(&self) -> Option<String> {
        self.inner
            .local
            .lock()
            .as_ref()
            .map(|id| self.inner.config.address_for(id.as_str()))
    }

    /// Routable remote address, once bound
    pub fn remote_address(&self) -> Option<String> {
        self.inner.remote_address.lock().clone()
    }

    /// Current signaling subscription state
    pub fn signaling_state(&self) -> SignalingState {
        self.inner
            .subscription
            .lock()
            .as_ref()
            .map_or(SignalingState::Unregistered, |s| s.state())
    }

    /// Wait until the signaling subscription reaches `target` or a later state
    pub async fn wait_for_signaling(&self, target: SignalingState) -> SignalingState {
        let subscription = self.inner.subscription.lock().clone();
        match subscription {
            Some(subscription) => subscription.wait_for(target).await,
            None => SignalingState::Unregistered,
        }
    }

    /// Set the inbound channel observer, replacing any previous one
    pub fn on_datachannel<F>(&self, handler: F)
    where
        F: Fn(DataChannel) + Send + Sync + 'static,
    {
        *self.inner.on_datachannel.lock() = Some(Arc::new(handler));
    }

    /// Set the signaling error observer, replacing any previous one
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.inner.on_error.lock() = Some(Arc::new(handler));
    }

    /// Accept the local description
    ///
    /// Binds the local identity from the origin line, then forwards the
    /// description to the wrapped negotiator.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedDescription`] if the description has no origin line;
    /// the negotiator is not called in that case.
    pub async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        let id = description.peer_identity()?;
        self.bind_local_identity(id)?;
        self.negotiator.set_local_description(description).await
    }

    /// Accept the remote description
    ///
    /// Binds the remote identity from the origin line, then forwards the
    /// description to the wrapped negotiator.
    pub async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let id = description.peer_identity()?;
        self.bind_remote_identity(id);
        self.negotiator.set_remote_description(description).await
    }

    /// Bind the local identity and subscribe to inbound channel requests
    ///
    /// Re-binding the identity of a live subscription is a no-op.
    pub fn bind_local_identity(&self, id: PeerIdentity) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::InvalidState(
                "cannot bind identity on a closed connection".to_string(),
            ));
        }

        let address = self.inner.config.address_for(id.as_str());
        let subscription = {
            let mut slot = self.inner.subscription.lock();
            if let Some(existing) = slot.as_ref() {
                if existing.address() == address && existing.state() != SignalingState::Closed {
                    debug!("Local identity {} already bound", address);
                    return Ok(());
                }
            }
            let subscription = SignalingSubscription::new(address.clone());
            if let Some(previous) = slot.replace(Arc::clone(&subscription)) {
                tokio::spawn(async move { previous.close().await });
            }
            subscription
        };
        *self.inner.local.lock() = Some(id);

        let weak = Arc::downgrade(&self.inner);
        let on_create: CreateHandler = Arc::new(move |request| {
            if let Some(inner) = weak.upgrade() {
                handshake::accept(&inner, request);
            }
        });
        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        let on_error: ErrorHandler = Arc::new(move |error: &Error| {
            if let Some(inner) = weak.upgrade() {
                inner.report_error(error);
            }
        });

        info!("Connection {} bound local address {}", self.inner.id, address);
        subscription.start(self.inner.connector(), on_create, on_error);
        Ok(())
    }

    /// Bind the default target of outbound channel requests
    pub fn bind_remote_identity(&self, id: PeerIdentity) {
        let address = self.inner.config.address_for(id.as_str());
        info!("Connection {} bound remote address {}", self.inner.id, address);
        *self.inner.remote_address.lock() = Some(address);
    }

    /// Open a data channel to the bound remote peer
    ///
    /// Returns immediately with a channel in the `Connecting` state. The open
    /// observer fires once the remote end acknowledges.
    ///
    /// # Errors
    ///
    /// - [`Error::NoPeerBound`] if no remote identity is bound
    /// - [`Error::InvalidState`] if the connection is closed
    /// - [`Error::NoLocalIdentity`] if no local identity is bound
    /// - [`Error::InvalidConfig`] if the label is longer than 65535 bytes
    pub fn create_data_channel(&self, label: &str, init: DataChannelInit) -> Result<DataChannel> {
        let Some(remote_address) = self.remote_address() else {
            warn!("Connection {}: peer identity is not defined", self.inner.id);
            return Err(Error::NoPeerBound);
        };

        if self.inner.is_closed() {
            return Err(Error::InvalidState(
                "cannot create a data channel on a closed connection".to_string(),
            ));
        }

        let local_address = self.local_address().ok_or(Error::NoLocalIdentity)?;

        if label.len() > MAX_LABEL_LEN {
            return Err(Error::InvalidConfig(format!(
                "label is {} bytes, maximum is {}",
                label.len(),
                MAX_LABEL_LEN
            )));
        }

        let config = ChannelConfig {
            label: label.to_string(),
            reliable: init.reliable,
        };
        Ok(handshake::initiate(
            &self.inner,
            config,
            local_address,
            remote_address,
        ))
    }

    /// Channels owned by this connection that are not closed
    pub fn channels(&self) -> Vec<DataChannel> {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|c| c.ready_state() != ReadyState::Closed)
            .cloned()
            .collect()
    }

    /// Close the connection
    ///
    /// Every owned channel is forced to `Closed` without close notifications,
    /// and the signaling subscription is dropped.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        info!("Closing peer connection {}", self.inner.id);

        let channels = std::mem::take(&mut *self.inner.channels.lock());
        for channel in channels {
            if let Some(sink) = channel.force_closed() {
                if let Err(e) = sink.close().await {
                    debug!("Closing channel '{}' failed: {}", channel.label(), e);
                }
            }
        }

        let subscription = self.inner.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.close().await;
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        let channels = std::mem::take(&mut *self.inner.channels.lock());
        let sinks: Vec<_> = channels.iter().filter_map(|c| c.force_closed()).collect();
        let subscription = self.inner.subscription.lock().take();

        if sinks.is_empty() && subscription.is_none() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for sink in sinks {
                    if let Err(e) = sink.close().await {
                        debug!("Closing dropped channel failed: {}", e);
                    }
                }
                if let Some(subscription) = subscription {
                    subscription.close().await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRendezvous;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNegotiator {
        local: AtomicUsize,
        remote: AtomicUsize,
    }

    #[async_trait]
    impl SessionNegotiator for CountingNegotiator {
        async fn set_local_description(&self, _description: &SessionDescription) -> Result<()> {
            self.local.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn set_remote_description(&self, _description: &SessionDescription) -> Result<()> {
            self.remote.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connection(rendezvous: &Arc<MockRendezvous>) -> (PeerConnection, Arc<CountingNegotiator>) {
        let negotiator = Arc::new(CountingNegotiator {
            local: AtomicUsize::new(0),
            remote: AtomicUsize::new(0),
        });
        let pc = PeerConnection::new(
            Arc::new(PolyfillConfig::default()),
            rendezvous.clone(),
            negotiator.clone(),
        );
        (pc, negotiator)
    }

    #[tokio::test]
    async fn test_descriptions_are_forwarded() {
        let rendezvous = MockRendezvous::new();
        let (pc, negotiator) = connection(&rendezvous);

        pc.set_local_description(&SessionDescription::offer("v=0\r\no=alice\r\n"))
            .await
            .unwrap();
        pc.set_remote_description(&SessionDescription::answer("v=0\r\no=bob\r\n"))
            .await
            .unwrap();

        assert_eq!(negotiator.local.load(Ordering::SeqCst), 1);
        assert_eq!(negotiator.remote.load(Ordering::SeqCst), 1);
        assert_eq!(pc.local_address().as_deref(), Some("pc.alice"));
        assert_eq!(pc.remote_address().as_deref(), Some("pc.bob"));
    }

    #[tokio::test]
    async fn test_malformed_description_skips_negotiator() {
        let rendezvous = MockRendezvous::new();
        let (pc, negotiator) = connection(&rendezvous);

        let err = pc
            .set_remote_description(&SessionDescription::answer("v=0\r\ns=-\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedDescription(_)));
        assert_eq!(negotiator.remote.load(Ordering::SeqCst), 0);
        assert!(pc.remote_address().is_none());
    }

    #[tokio::test]
    async fn test_no_peer_bound_opens_nothing() {
        let rendezvous = MockRendezvous::new();
        let (pc, _) = connection(&rendezvous);

        let err = pc
            .create_data_channel("chat", DataChannelInit::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoPeerBound));
        tokio::task::yield_now().await;
        assert_eq!(rendezvous.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_requires_local_identity() {
        let rendezvous = MockRendezvous::new();
        let (pc, _) = connection(&rendezvous);
        pc.bind_remote_identity(PeerIdentity::from("alice"));

        let err = pc
            .create_data_channel("chat", DataChannelInit::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoLocalIdentity));
    }

    #[tokio::test]
    async fn test_rejects_oversized_label() {
        let rendezvous = MockRendezvous::new();
        let (pc, _) = connection(&rendezvous);
        pc.bind_local_identity(PeerIdentity::from("bob")).unwrap();
        pc.bind_remote_identity(PeerIdentity::from("alice"));

        let label = "x".repeat(MAX_LABEL_LEN + 1);
        let err = pc
            .create_data_channel(&label, DataChannelInit::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_channels() {
        let rendezvous = MockRendezvous::new();
        let (pc, _) = connection(&rendezvous);
        pc.bind_local_identity(PeerIdentity::from("bob")).unwrap();
        pc.bind_remote_identity(PeerIdentity::from("alice"));
        pc.close().await;

        assert_eq!(pc.ready_state(), ConnectionState::Closed);
        let err = pc
            .create_data_channel("chat", DataChannelInit::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(pc.bind_local_identity(PeerIdentity::from("bob")).is_err());
    }

    #[tokio::test]
    async fn test_rebinding_same_identity_is_noop() {
        let rendezvous = MockRendezvous::new();
        let (pc, _) = connection(&rendezvous);

        pc.bind_local_identity(PeerIdentity::from("alice")).unwrap();
        pc.wait_for_signaling(SignalingState::Registered).await;
        pc.bind_local_identity(PeerIdentity::from("alice")).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(rendezvous.connection_count(), 1);
        assert_eq!(pc.signaling_state(), SignalingState::Registered);
    }

    #[tokio::test]
    async fn test_rebinding_new_identity_resubscribes() {
        let rendezvous = MockRendezvous::new();
        let (pc, _) = connection(&rendezvous);

        pc.bind_local_identity(PeerIdentity::from("alice")).unwrap();
        pc.wait_for_signaling(SignalingState::Registered).await;
        pc.bind_local_identity(PeerIdentity::from("carol")).unwrap();
        pc.wait_for_signaling(SignalingState::Registered).await;

        assert!(rendezvous.is_registered("pc.carol"));
        assert_eq!(pc.local_address().as_deref(), Some("pc.carol"));
    }

    #[test]
    fn test_closed_is_terminal() {
        let rendezvous = MockRendezvous::new();
        let (pc, _) = connection(&rendezvous);
        pc.set_ready_state(ConnectionState::Open);
        assert_eq!(pc.ready_state(), ConnectionState::Open);
        *pc.inner.state.lock() = ConnectionState::Closed;
        pc.set_ready_state(ConnectionState::Open);
        assert_eq!(pc.ready_state(), ConnectionState::Closed);
    }
}
