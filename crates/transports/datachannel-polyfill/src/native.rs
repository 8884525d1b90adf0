//! Native host backed by webrtc-rs
//!
//! [`WebRtcHost`] lets [`crate::probe`] test a real peer connection, and the
//! [`SessionNegotiator`] impl lets a polyfilled [`crate::PeerConnection`]
//! wrap an `RTCPeerConnection` for description handling.

use crate::config::PolyfillConfig;
use crate::connection::SessionNegotiator;
use crate::probe::{NativeHost, ProbeConnection};
use crate::sdp::{SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::debug;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Host that opens probe connections through webrtc-rs
#[derive(Debug, Clone)]
pub struct WebRtcHost {
    stun_server: String,
}

impl WebRtcHost {
    pub fn new(config: &PolyfillConfig) -> Self {
        Self {
            stun_server: config.stun_server.clone(),
        }
    }
}

#[async_trait]
impl NativeHost for WebRtcHost {
    async fn open_probe_connection(&self) -> Result<Box<dyn ProbeConnection>> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| Error::Native(format!("Failed to create peer connection: {}", e)))?;

        Ok(Box::new(WebRtcProbe { peer_connection }))
    }
}

struct WebRtcProbe {
    peer_connection: RTCPeerConnection,
}

#[async_trait]
impl ProbeConnection for WebRtcProbe {
    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.peer_connection
            .create_data_channel(label, None)
            .await
            .map(|_| ())
            .map_err(|e| Error::Native(format!("Failed to create data channel: {}", e)))
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            debug!("Closing probe connection failed: {}", e);
        }
    }
}

fn to_native(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp.clone();
    let native = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
    };
    native.map_err(|e| Error::Native(format!("Failed to parse description: {}", e)))
}

#[async_trait]
impl SessionNegotiator for RTCPeerConnection {
    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        let native = to_native(description)?;
        RTCPeerConnection::set_local_description(self, native)
            .await
            .map_err(|e| Error::Native(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let native = to_native(description)?;
        RTCPeerConnection::set_remote_description(self, native)
            .await
            .map_err(|e| Error::Native(format!("Failed to set remote description: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{probe, Support};

    #[tokio::test]
    async fn test_webrtc_host_supports_data_channels() {
        let host = WebRtcHost::new(&PolyfillConfig::default());
        assert_eq!(probe(Some(&host)).await, Support::Native);
    }

    #[test]
    fn test_description_conversion_keeps_type() {
        let sdp = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let native = to_native(&SessionDescription::answer(sdp)).unwrap();
        assert_eq!(native.sdp, sdp);
    }
}
