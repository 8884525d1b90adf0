//! Control message wire format
//!
//! Control messages travel as text frames holding a JSON array whose first
//! element is the message kind:
//!
//! ```text
//! ["setId", "pc.alice"]
//! ["create", "pc.bob", {"label": "chat", "reliable": true}]
//! ```
//!
//! The ready acknowledgment is not a tuple: it is the bare text frame
//! [`READY_TOKEN`], sent by the responder and matched verbatim by the
//! initiator.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Text frame that switches both ends of a channel to pass-through
pub const READY_TOKEN: &str = "ready";

/// Kind tag of the registration message
pub const KIND_SET_ID: &str = "setId";

/// Kind tag of the channel creation request
pub const KIND_CREATE: &str = "create";

/// Channel parameters carried by a `create` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Application-chosen channel name
    #[serde(default)]
    pub label: String,

    /// Delivery guarantee; omitted on the wire when the caller left it unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
}

impl ChannelConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            reliable: None,
        }
    }

    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = Some(reliable);
        self
    }

    /// Effective delivery guarantee (reliable unless stated otherwise)
    pub fn is_reliable(&self) -> bool {
        self.reliable.unwrap_or(true)
    }
}

/// Control message exchanged with the rendezvous service
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Register the sending connection under `address`
    SetId { address: String },

    /// Ask the peer at the routed address to open a channel back to `address`
    Create {
        address: String,
        config: ChannelConfig,
    },

    /// Any kind this version does not act upon
    Other { kind: String, args: Vec<Value> },
}

impl ControlMessage {
    pub fn set_id(address: impl Into<String>) -> Self {
        ControlMessage::SetId {
            address: address.into(),
        }
    }

    pub fn create(address: impl Into<String>, config: ChannelConfig) -> Self {
        ControlMessage::Create {
            address: address.into(),
            config,
        }
    }

    /// Kind tag of this message
    pub fn kind(&self) -> &str {
        match self {
            ControlMessage::SetId { .. } => KIND_SET_ID,
            ControlMessage::Create { .. } => KIND_CREATE,
            ControlMessage::Other { kind, .. } => kind,
        }
    }

    /// Encode as a JSON array text frame
    pub fn to_text(&self) -> Result<String> {
        let value = match self {
            ControlMessage::SetId { address } => json!([KIND_SET_ID, address]),
            ControlMessage::Create { address, config } => json!([KIND_CREATE, address, config]),
            ControlMessage::Other { kind, args } => {
                let mut tuple = Vec::with_capacity(args.len() + 1);
                tuple.push(Value::String(kind.clone()));
                tuple.extend(args.iter().cloned());
                Value::Array(tuple)
            }
        };
        Ok(serde_json::to_string(&value)?)
    }

    /// Decode a JSON array text frame
    pub fn from_text(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(mut tuple) = value else {
            return Err(Error::Protocol(format!(
                "control message is not an array: {}",
                text
            )));
        };
        if tuple.is_empty() {
            return Err(Error::Protocol("control message is empty".to_string()));
        }
        let kind = match tuple.remove(0) {
            Value::String(kind) => kind,
            other => {
                return Err(Error::Protocol(format!(
                    "control message kind is not a string: {}",
                    other
                )))
            }
        };
        let mut args = tuple.into_iter();

        match kind.as_str() {
            KIND_SET_ID => Ok(ControlMessage::SetId {
                address: string_arg(args.next(), KIND_SET_ID)?,
            }),
            KIND_CREATE => {
                let address = string_arg(args.next(), KIND_CREATE)?;
                let config = match args.next() {
                    Some(value) => serde_json::from_value(value)?,
                    None => {
                        return Err(Error::Protocol(
                            "create message is missing its channel config".to_string(),
                        ))
                    }
                };
                Ok(ControlMessage::Create { address, config })
            }
            _ => Ok(ControlMessage::Other {
                kind,
                args: args.collect(),
            }),
        }
    }
}

fn string_arg(value: Option<Value>, kind: &str) -> Result<String> {
    match value {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::Protocol(format!(
            "{} address must be a string, got {}",
            kind, other
        ))),
        None => Err(Error::Protocol(format!("{} message is missing its address", kind))),
    }
}

/// Whether a text frame is the ready acknowledgment
pub fn is_ready_token(text: &str) -> bool {
    text == READY_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_id_wire_format() {
        let text = ControlMessage::set_id("pc.alice").to_text().unwrap();
        assert_eq!(text, r#"["setId","pc.alice"]"#);
    }

    #[test]
    fn test_create_wire_format() {
        let msg = ControlMessage::create("pc.bob", ChannelConfig::new("chat").with_reliable(true));
        assert_eq!(
            msg.to_text().unwrap(),
            r#"["create","pc.bob",{"label":"chat","reliable":true}]"#
        );
    }

    #[test]
    fn test_create_omits_unset_reliable() {
        let msg = ControlMessage::create("pc.bob", ChannelConfig::new("chat"));
        assert_eq!(msg.to_text().unwrap(), r#"["create","pc.bob",{"label":"chat"}]"#);
    }

    #[test]
    fn test_parse_create_keeps_unreliable() {
        let msg = ControlMessage::from_text(r#"["create","pc.bob",{"label":"x","reliable":false}]"#)
            .unwrap();
        match msg {
            ControlMessage::Create { address, config } => {
                assert_eq!(address, "pc.bob");
                assert_eq!(config.label, "x");
                assert!(!config.is_reliable());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_reliable_defaults_to_true() {
        let msg = ControlMessage::from_text(r#"["create","pc.bob",{"label":"x"}]"#).unwrap();
        let ControlMessage::Create { config, .. } = msg else {
            panic!("expected create");
        };
        assert!(config.is_reliable());
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let msg = ControlMessage::from_text(r#"["ready","pc.bob"]"#).unwrap();
        assert_eq!(msg.kind(), "ready");
        assert!(matches!(msg, ControlMessage::Other { ref args, .. } if args.len() == 1));
    }

    #[test]
    fn test_rejects_non_array() {
        assert!(matches!(
            ControlMessage::from_text(r#"{"kind":"setId"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::from_text("[]"),
            Err(Error::Protocol(_))
        ));
        assert!(ControlMessage::from_text("ready").is_err());
    }

    #[test]
    fn test_rejects_create_without_config() {
        assert!(ControlMessage::from_text(r#"["create","pc.bob"]"#).is_err());
        assert!(ControlMessage::from_text(r#"["setId",42]"#).is_err());
    }

    #[test]
    fn test_ready_token() {
        assert!(is_ready_token("ready"));
        assert!(!is_ready_token(r#"["ready","pc.bob"]"#));
    }
}
