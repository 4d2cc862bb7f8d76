//! Wire-level data types routed by the hub: messages, forward requests and
//! subscription requests.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An opaque payload addressed to a username within a service.
///
/// `sender` and `sender_service` identify the originator when the message was
/// relayed from another connection; both are empty for messages injected by
/// the server side. Header keys prefixed `notif.` feed push-notification
/// synthesis; the `notif.uniqush.` prefix is reserved for values the hub
/// itself produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,

    #[serde(
        default,
        rename = "senderService",
        skip_serializing_if = "String::is_empty"
    )]
    pub sender_service: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,

    /// Raw payload bytes; crosses JSON as base64.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Size in bytes of the payload; reported to the push backend.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// The `title` header, when the sender supplied one.
    pub fn title(&self) -> Option<&str> {
        self.header.get("title").map(String::as_str)
    }
}

/// A relay instruction from one connection towards another user, possibly in
/// another service. Evaluated by the forward-request hook before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub receiver: String,

    #[serde(default, rename = "receiverService")]
    pub receiver_service: String,

    /// Requested time-to-live for the cached copy; clamped by the forward
    /// hook's max TTL before dispatch.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,

    pub msg: Message,
}

/// A request to register or drop push delivery points for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub service: String,
    pub username: String,
    /// True to subscribe, false to unsubscribe.
    pub subscribe: bool,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Serde adapter: `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde adapter: `Vec<u8>` as standard base64.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
