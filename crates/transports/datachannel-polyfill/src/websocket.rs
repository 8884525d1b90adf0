//! WebSocket duplex transport
//!
//! Every dedicated connection is a separate WebSocket to the rendezvous
//! service. Channel connections carry their target address in the `peer`
//! query parameter; the signaling connection dials the bare URL.

use crate::config::PolyfillConfig;
use crate::transport::{Connector, DuplexConnection, DuplexSink, Frame, Route, TransportEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Query parameter naming the target of a channel connection
pub const PEER_QUERY_PARAM: &str = "peer";

/// Opens dedicated WebSocket connections to the rendezvous service
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for the rendezvous URL in `config`
    pub fn new(config: &PolyfillConfig) -> Result<Self> {
        config.validate()?;
        let url = Url::parse(&config.rendezvous_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid rendezvous URL: {}", e)))?;
        Ok(Self {
            url,
            connect_timeout: config.connect_timeout(),
        })
    }

    /// URL dialed for `route`
    pub fn url_for(&self, route: &Route) -> Url {
        let mut url = self.url.clone();
        if let Route::Peer(address) = route {
            url.query_pairs_mut().append_pair(PEER_QUERY_PARAM, address);
        }
        url
    }

    /// Sender task: writes queued messages to the socket
    async fn sender_task(
        id: Uuid,
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message on {}: {}", id, e);
                break;
            }
            if closing {
                break;
            }
        }

        let _ = write.close().await;
        debug!("Sender task for {} terminated", id);
    }

    /// Receiver task: turns socket messages into transport events
    async fn receiver_task(
        id: Uuid,
        mut read: futures::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        while let Some(msg_result) = read.next().await {
            let event = match msg_result {
                Ok(Message::Text(text)) => TransportEvent::Message(Frame::Text(text)),
                Ok(Message::Binary(data)) => {
                    TransportEvent::Message(Frame::Binary(Bytes::from(data)))
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection {} closed by peer", id);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket error on {}: {}", id, e);
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            };
            if events.send(event).is_err() {
                break;
            }
        }

        let _ = events.send(TransportEvent::Closed);
        debug!("Receiver task for {} terminated", id);
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, route: Route) -> Result<DuplexConnection> {
        let id = Uuid::new_v4();
        let url = self.url_for(&route);
        debug!("Opening WebSocket {} to {} ({})", id, url, route);

        let connecting = connect_async(url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "Timed out after {:?} connecting to {}",
                    self.connect_timeout, url
                ))
            })?
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("WebSocket {} open ({})", id, route);

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(id, write, rx));
        tokio::spawn(Self::receiver_task(id, read, events_tx));

        Ok(DuplexConnection {
            sink: std::sync::Arc::new(WebSocketSink { id, tx }),
            events: events_rx,
        })
    }
}

/// Sending half of a WebSocket connection
struct WebSocketSink {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl DuplexSink for WebSocketSink {
    async fn send(&self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.tx
            .send(msg)
            .map_err(|_| Error::Transport(format!("WebSocket {} is closed", self.id)))
    }

    async fn close(&self) -> Result<()> {
        // Already closed is fine
        let _ = self.tx.send(Message::Close(None));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_route_uses_bare_url() {
        let config = PolyfillConfig::with_rendezvous_url("ws://relay.local:8080/dcpf");
        let connector = WebSocketConnector::new(&config).unwrap();
        assert_eq!(
            connector.url_for(&Route::Signaling).as_str(),
            "ws://relay.local:8080/dcpf"
        );
    }

    #[test]
    fn test_peer_route_adds_query() {
        let config = PolyfillConfig::with_rendezvous_url("wss://relay.local/dcpf?v=1");
        let connector = WebSocketConnector::new(&config).unwrap();
        let url = connector.url_for(&Route::Peer("pc.alice".to_string()));
        assert_eq!(url.as_str(), "wss://relay.local/dcpf?v=1&peer=pc.alice");
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = WebSocketConnector::new(&PolyfillConfig::with_rendezvous_url("http://relay"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_fault() {
        let config = PolyfillConfig {
            rendezvous_url: "ws://127.0.0.1:1".to_string(),
            connect_timeout_secs: 2,
            ..Default::default()
        };
        let connector = WebSocketConnector::new(&config).unwrap();
        let err = connector.connect(Route::Signaling).await.unwrap_err();
        assert!(err.is_transport_error());
    }
}
