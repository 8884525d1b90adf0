//! Duplex transport abstraction
//!
//! Every data channel and every signaling subscription runs over its own
//! dedicated duplex connection to the rendezvous service. [`Connector`] opens
//! those connections so the protocol logic can run over WebSockets in
//! production and over the in-memory rendezvous in tests.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Unit of data on a duplex connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(t) => Some(t),
            Frame::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Frame::Text(_) => None,
            Frame::Binary(b) => Some(b),
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<Bytes> for Frame {
    fn from(data: Bytes) -> Self {
        Frame::Binary(data)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Frame::Binary(Bytes::from(data))
    }
}

/// Where a dedicated connection is routed by the rendezvous service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Control connection of a signaling subscription
    Signaling,
    /// Channel connection addressed to a peer
    Peer(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Signaling => f.write_str("signaling"),
            Route::Peer(address) => write!(f, "peer:{}", address),
        }
    }
}

/// Events raised by an open duplex connection, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Frame received from the rendezvous service
    Message(Frame),
    /// Transport-level fault; the connection may still be usable
    Error(String),
    /// Connection closed (by either side); no further events follow
    Closed,
}

/// Sending half of a duplex connection
#[async_trait]
pub trait DuplexSink: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// An open duplex connection
pub struct DuplexConnection {
    /// Sending half
    pub sink: Arc<dyn DuplexSink>,
    /// Receiving half
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl fmt::Debug for DuplexConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexConnection").finish_non_exhaustive()
    }
}

/// Opens dedicated connections to the rendezvous service
///
/// A successful `connect` is the connection's "open" event. An `Err` is a
/// connection error before open.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, route: Route) -> Result<DuplexConnection>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    async fn connect(&self, route: Route) -> Result<DuplexConnection> {
        (**self).connect(route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let text = Frame::from("hi");
        assert_eq!(text.as_text(), Some("hi"));
        assert_eq!(text.len(), 2);

        let binary = Frame::from(vec![1u8, 2, 3]);
        assert_eq!(binary.as_binary(), Some(&[1u8, 2, 3][..]));
        assert!(binary.as_text().is_none());
        assert!(!binary.is_empty());
    }

    #[test]
    fn test_route_display() {
        assert_eq!(Route::Signaling.to_string(), "signaling");
        assert_eq!(Route::Peer("pc.alice".to_string()).to_string(), "peer:pc.alice");
    }
}
