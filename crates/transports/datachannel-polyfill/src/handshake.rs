//! Channel establishment handshake
//!
//! ```text
//! initiator channel conn          rendezvous            responder
//!   ── ["create", from, config] ──▶  routes to  ──▶  signaling subscription
//!                                                      opens new channel conn
//!   ◀──────────── "ready" ───────── pairs conns ◀──── sends ready token
//!   open, pass-through                                 open, pass-through
//! ```
//!
//! Each side runs one driver task per channel. The driver owns the receiving
//! half of the dedicated connection and stops when the connection closes or
//! the channel is closed locally.

use crate::channel::{DataChannel, ReadyState};
use crate::connection::ConnectionInner;
use crate::protocol::{is_ready_token, ChannelConfig, ControlMessage, READY_TOKEN};
use crate::signaling::CreateRequest;
use crate::transport::{Connector, DuplexConnection, Frame, Route, TransportEvent};
use crate::Error;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Initiator waiting for the ready token
    AwaitingReady,
    /// Frames go to the application
    PassThrough,
}

/// Start the initiator side: open a connection routed to `remote_address`
/// and ask the peer there to open a channel back to `local_address`.
pub(crate) fn initiate(
    connection: &Arc<ConnectionInner>,
    config: ChannelConfig,
    local_address: String,
    remote_address: String,
) -> DataChannel {
    let channel = DataChannel::new(&config, Arc::downgrade(connection));
    connection.track(channel.clone());

    debug!(
        "Creating data channel '{}' ({}) to {}",
        channel.label(),
        channel.id(),
        remote_address
    );

    let request = ControlMessage::create(local_address, config);
    tokio::spawn(run_initiator(
        connection.connector(),
        channel.clone(),
        Route::Peer(remote_address),
        request,
    ));

    channel
}

/// Responder side: handle an inbound `create` request
pub(crate) fn accept(connection: &Arc<ConnectionInner>, request: CreateRequest) {
    if connection.is_closed() {
        debug!(
            "Ignoring channel request '{}' from {}: connection closed",
            request.config.label, request.address
        );
        return;
    }

    let channel = DataChannel::new(&request.config, Arc::downgrade(connection));
    connection.track(channel.clone());

    tokio::spawn(run_responder(
        connection.connector(),
        channel,
        Route::Peer(request.address),
        Arc::downgrade(connection),
    ));
}

async fn run_initiator(
    connector: Arc<dyn Connector>,
    channel: DataChannel,
    route: Route,
    request: ControlMessage,
) {
    let Some(events) = open(connector, &channel, route).await else {
        return;
    };

    match request.to_text() {
        Ok(text) => {
            if let Err(e) = channel.send_control(Frame::Text(text)).await {
                channel.report_error(&e);
            }
        }
        Err(e) => channel.report_error(&e),
    }

    drive(channel, events, Phase::AwaitingReady).await;
}

async fn run_responder(
    connector: Arc<dyn Connector>,
    channel: DataChannel,
    route: Route,
    connection: Weak<ConnectionInner>,
) {
    let Some(events) = open(connector, &channel, route).await else {
        return;
    };

    channel.advance(ReadyState::Open);
    if let Err(e) = channel.send_control(Frame::from(READY_TOKEN)).await {
        channel.report_error(&e);
    }

    if let Some(connection) = connection.upgrade() {
        connection.announce_channel(channel.clone());
    }

    drive(channel, events, Phase::PassThrough).await;
}

/// Open the dedicated connection of `channel`. Connect failures go to the
/// error observer and leave the channel connecting.
async fn open(
    connector: Arc<dyn Connector>,
    channel: &DataChannel,
    route: Route,
) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
    let connected = tokio::select! {
        result = connector.connect(route) => result,
        _ = channel.shutdown_signal() => {
            debug!("Data channel '{}' closed before its connection opened", channel.label());
            return None;
        }
    };

    match connected {
        Ok(DuplexConnection { sink, events }) => {
            if !channel.attach(Arc::clone(&sink)) {
                let _ = sink.close().await;
                return None;
            }
            Some(events)
        }
        Err(e) => {
            channel.report_error(&e);
            None
        }
    }
}

async fn drive(
    channel: DataChannel,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut phase: Phase,
) {
    loop {
        if channel.shutdown_requested() {
            break;
        }

        let event = tokio::select! {
            event = events.recv() => event,
            _ = channel.shutdown_signal() => break,
        };

        match event {
            Some(TransportEvent::Message(frame)) => match phase {
                Phase::AwaitingReady => {
                    if !matches!(frame.as_text(), Some(text) if is_ready_token(text)) {
                        debug!(
                            "Ignoring frame on '{}' while waiting for ready",
                            channel.label()
                        );
                        continue;
                    }
                    if channel.connection_closed() {
                        continue;
                    }
                    phase = Phase::PassThrough;
                    if channel.advance(ReadyState::Open) {
                        info!("Data channel '{}' open", channel.label());
                        channel.notify_open();
                    }
                }
                Phase::PassThrough => channel.deliver(frame),
            },
            Some(TransportEvent::Error(message)) => {
                channel.report_error(&Error::Transport(message));
            }
            Some(TransportEvent::Closed) | None => {
                channel.handle_transport_closed();
                break;
            }
        }
    }

    debug!("Driver for data channel '{}' stopped", channel.label());
}
