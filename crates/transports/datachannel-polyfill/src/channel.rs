//! Polyfilled data channel
//!
//! A [`DataChannel`] owns exactly one dedicated duplex connection. The same
//! connection first carries the establishment handshake and then, once the
//! channel is open, application frames in both directions.

use crate::connection::ConnectionInner;
use crate::protocol::ChannelConfig;
use crate::transport::{DuplexSink, Frame};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Data channel ready state
///
/// Transitions only move forward: `Connecting → Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    /// Dedicated connection opening or handshake in progress
    Connecting,
    /// Handshake complete, frames pass through
    Open,
    /// Closing (only ever set from outside the polyfill)
    Closing,
    /// Closed
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Callback for the open event
pub type OpenHandler = Arc<dyn Fn() + Send + Sync>;

/// Callback for incoming application frames
pub type MessageHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Callback for the close event
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Callback for transport errors
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Default)]
struct ChannelObservers {
    on_open: Mutex<Option<OpenHandler>>,
    on_message: Mutex<Option<MessageHandler>>,
    on_close: Mutex<Option<CloseHandler>>,
    on_error: Mutex<Option<ErrorHandler>>,
}

/// Channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChannelStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Messages sent count
    pub messages_sent: u64,
    /// Messages received count
    pub messages_received: u64,
}

pub(crate) struct ChannelInner {
    id: Uuid,
    label: String,
    reliable: bool,
    state: Mutex<ReadyState>,
    sink: Mutex<Option<Arc<dyn DuplexSink>>>,
    observers: ChannelObservers,
    connection: Weak<ConnectionInner>,
    close_requested: AtomicBool,
    shutdown: Notify,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Data channel emulated over a dedicated duplex connection
///
/// Cheap to clone; all clones refer to the same channel.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("reliable", &self.inner.reliable)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl DataChannel {
    pub(crate) fn new(config: &ChannelConfig, connection: Weak<ConnectionInner>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: Uuid::new_v4(),
                label: config.label.clone(),
                reliable: config.is_reliable(),
                state: Mutex::new(ReadyState::Connecting),
                sink: Mutex::new(None),
                observers: ChannelObservers::default(),
                connection,
                close_requested: AtomicBool::new(false),
                shutdown: Notify::new(),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
            }),
        }
    }

    /// Unique id of this channel (used in log lines)
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Channel label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether delivery is reliable
    pub fn reliable(&self) -> bool {
        self.inner.reliable
    }

    /// Current ready state
    pub fn ready_state(&self) -> ReadyState {
        *self.inner.state.lock()
    }

    /// Check if channel is open
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Get channel statistics
    pub fn stats(&self) -> DataChannelStats {
        DataChannelStats {
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Set the open observer, replacing any previous one
    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.observers.on_open.lock() = Some(Arc::new(handler));
    }

    /// Set the message observer, replacing any previous one
    ///
    /// Frames that arrive while no observer is set are dropped.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        *self.inner.observers.on_message.lock() = Some(Arc::new(handler));
    }

    /// Set the close observer, replacing any previous one
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.observers.on_close.lock() = Some(Arc::new(handler));
    }

    /// Set the error observer, replacing any previous one
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.inner.observers.on_error.lock() = Some(Arc::new(handler));
    }

    /// Send a frame to the remote end
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the channel is open. Frames are
    /// never buffered while the handshake is in progress.
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        let frame = frame.into();

        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(Error::InvalidState(format!(
                "Data channel '{}' is not open (state: {})",
                self.inner.label, state
            )));
        }

        let sink = self.inner.sink.lock().clone().ok_or_else(|| {
            Error::InvalidState(format!(
                "Data channel '{}' has no open connection",
                self.inner.label
            ))
        })?;

        let len = frame.len();
        sink.send(frame).await?;

        self.inner.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
        debug!("Sent {} bytes on data channel '{}'", len, self.inner.label);

        Ok(())
    }

    /// Send a text frame
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::Text(text.into())).await
    }

    /// Send a binary frame
    pub async fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<()> {
        self.send(Frame::Binary(data.into())).await
    }

    /// Close the channel and its dedicated connection
    ///
    /// A pending handshake is abandoned without notifying the remote end.
    pub async fn close(&self) -> Result<()> {
        let sink = self.request_shutdown();
        self.handle_transport_closed();

        if let Some(sink) = sink {
            sink.close().await?;
        }
        Ok(())
    }

    // Crate-internal hooks used by the handshake and the owning connection.

    /// Stop the driver and detach the sink
    pub(crate) fn request_shutdown(&self) -> Option<Arc<dyn DuplexSink>> {
        self.inner.close_requested.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
        self.inner.sink.lock().take()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::SeqCst)
    }

    pub(crate) async fn shutdown_signal(&self) {
        self.inner.shutdown.notified().await
    }

    /// Store the sink of a freshly opened connection. Returns false when the
    /// channel was closed while the connection was opening.
    pub(crate) fn attach(&self, sink: Arc<dyn DuplexSink>) -> bool {
        // Checked under the sink lock so a concurrent shutdown either sees
        // the sink or is seen here.
        let mut slot = self.inner.sink.lock();
        if self.shutdown_requested() {
            return false;
        }
        *slot = Some(sink);
        true
    }

    /// Send a handshake frame regardless of ready state
    pub(crate) async fn send_control(&self, frame: Frame) -> Result<()> {
        let sink = self.inner.sink.lock().clone().ok_or_else(|| {
            Error::InvalidState(format!(
                "Data channel '{}' has no open connection",
                self.inner.label
            ))
        })?;
        sink.send(frame).await
    }

    /// Move the ready state forward. Returns false if `next` is not ahead.
    pub(crate) fn advance(&self, next: ReadyState) -> bool {
        let mut state = self.inner.state.lock();
        if next <= *state {
            return false;
        }
        *state = next;
        true
    }

    /// Whether the owning connection is closed or gone
    pub(crate) fn connection_closed(&self) -> bool {
        self.inner
            .connection
            .upgrade()
            .map_or(true, |connection| connection.is_closed())
    }

    pub(crate) fn notify_open(&self) {
        let handler = self.inner.observers.on_open.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn deliver(&self, frame: Frame) {
        self.inner
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);

        let handler = self.inner.observers.on_message.lock().clone();
        match handler {
            Some(handler) => handler(frame),
            None => debug!(
                "Dropped {} byte frame on data channel '{}' (no observer)",
                frame.len(),
                self.inner.label
            ),
        }
    }

    pub(crate) fn report_error(&self, error: &Error) {
        warn!("Data channel '{}' error: {}", self.inner.label, error);
        let handler = self.inner.observers.on_error.lock().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Dedicated connection went away
    ///
    /// Moves to `Closed` unless this channel is already closing or closed.
    /// The close observer is skipped when the owning connection is closed.
    pub(crate) fn handle_transport_closed(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state >= ReadyState::Closing {
                return;
            }
            *state = ReadyState::Closed;
        }

        debug!("Data channel '{}' closed", self.inner.label);
        if self.connection_closed() {
            return;
        }
        let handler = self.inner.observers.on_close.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Teardown by the owning connection: closed without notification
    pub(crate) fn force_closed(&self) -> Option<Arc<dyn DuplexSink>> {
        let sink = self.request_shutdown();
        *self.inner.state.lock() = ReadyState::Closed;
        sink
    }
}
