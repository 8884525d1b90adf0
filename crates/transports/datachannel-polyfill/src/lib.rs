//! Data channel polyfill
//!
//! Emulates WebRTC-style data channels for hosts that can negotiate peer
//! sessions but lack native data channel support. Each channel runs over its
//! own WebSocket connection to a rendezvous relay, which routes control
//! messages between peers by the identity carried in their session
//! descriptions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  probe / install  (native? polyfill? unsupported?)       │
//! │  ↓ Polyfill                                              │
//! │  PeerConnection (wraps the host SessionNegotiator)       │
//! │  ├─ set_local_description  → SignalingSubscription       │
//! │  │     setId(prefix + id), inbound "create" requests     │
//! │  ├─ set_remote_description → default channel target      │
//! │  └─ DataChannel (one dedicated connection each)          │
//! │       "create" ──▶ relay ──▶ peer, "ready" ◀── peer      │
//! │     ↓                                                    │
//! │  Connector (WebSocketConnector / MockRendezvous)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use datachannel_polyfill::{extract_id, PolyfillConfig};
//!
//! let config = PolyfillConfig::default();
//! assert!(config.validate().is_ok());
//!
//! let id = extract_id("v=0\r\no=alice\r\n").unwrap();
//! assert_eq!(config.address_for(id.as_str()), "pc.alice");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use datachannel_polyfill::{
//!     DataChannelInit, DetachedNegotiator, Polyfill, PolyfillConfig, SessionDescription,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> datachannel_polyfill::Result<()> {
//! let polyfill = Polyfill::new(PolyfillConfig::default())?;
//! let pc = polyfill.peer_connection(Arc::new(DetachedNegotiator));
//!
//! pc.set_local_description(&SessionDescription::offer("v=0\r\no=bob\r\n")).await?;
//! pc.set_remote_description(&SessionDescription::answer("v=0\r\no=alice\r\n")).await?;
//!
//! let channel = pc.create_data_channel("chat", DataChannelInit::default())?;
//! channel.on_open(|| println!("open"));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

// Public modules
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod probe;
pub mod protocol;
pub mod sdp;
pub mod signaling;
pub mod transport;
pub mod websocket;

#[cfg(feature = "native")]
pub mod native;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Internal modules
mod handshake;

// Re-exports for public API
pub use channel::{DataChannel, DataChannelStats, ReadyState};
pub use config::PolyfillConfig;
pub use connection::{
    ConnectionState, DataChannelInit, DetachedNegotiator, PeerConnection, SessionNegotiator,
};
pub use error::{Error, Result};
pub use probe::{install, probe, Installation, NativeHost, Polyfill, ProbeConnection, Support};
pub use sdp::{extract_id, PeerIdentity, SdpType, SessionDescription};
pub use signaling::SignalingState;
pub use transport::{Connector, Frame, Route};
pub use websocket::WebSocketConnector;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
