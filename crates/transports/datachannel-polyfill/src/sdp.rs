//! Session descriptions and peer identity extraction

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Peer identity carried by this description
    pub fn peer_identity(&self) -> Result<PeerIdentity> {
        extract_id(&self.sdp)
    }
}

/// Opaque name of one endpoint in the rendezvous namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Extract the peer identity from the first origin (`o=`) line of an SDP.
///
/// The identity is the whole line after `o=`, line terminator excluded.
pub fn extract_id(sdp: &str) -> Result<PeerIdentity> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=").filter(|rest| !rest.is_empty()))
        .map(PeerIdentity::new)
        .ok_or_else(|| {
            Error::MalformedDescription("session description has no origin (o=) line".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_origin_line() {
        let sdp = "v=0\no=- 123 2 IN IP4 0.0.0.0\ns=-\nt=0 0\n";
        let id = extract_id(sdp).unwrap();
        assert_eq!(id.as_str(), "- 123 2 IN IP4 0.0.0.0");
    }

    #[test]
    fn test_extract_strips_crlf() {
        let sdp = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n";
        let id = extract_id(sdp).unwrap();
        assert_eq!(id.as_str(), "- 4611731400430051336 2 IN IP4 127.0.0.1");
    }

    #[test]
    fn test_first_origin_wins() {
        let sdp = "v=0\no=first\no=second\n";
        assert_eq!(extract_id(sdp).unwrap().as_str(), "first");
    }

    #[test]
    fn test_empty_origin_is_skipped() {
        let sdp = "o=\no=alice\n";
        assert_eq!(extract_id(sdp).unwrap().as_str(), "alice");
    }

    #[test]
    fn test_origin_must_start_the_line() {
        let sdp = "v=0\na=o=fake\n";
        assert!(matches!(
            extract_id(sdp),
            Err(Error::MalformedDescription(_))
        ));
    }

    #[test]
    fn test_missing_origin_is_malformed() {
        assert!(matches!(
            extract_id("v=0\ns=-\n"),
            Err(Error::MalformedDescription(_))
        ));
    }

    #[test]
    fn test_description_serde_shape() {
        let desc = SessionDescription::offer("v=0\no=alice\n");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(desc.peer_identity().unwrap(), PeerIdentity::from("alice"));
    }
}
