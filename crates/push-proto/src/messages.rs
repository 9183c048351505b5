//! Client protocol frames.
//!
//! Every websocket frame carries one JSON object. Inbound frames are parsed
//! leniently into [`ClientMessage`] so the connection can tell a malformed
//! frame (close) from a recognized-but-invalid payload (401 reply). Outbound
//! frames are built as [`ServerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;
use crate::types::{ChannelId, Headers, Notification, Uaid, Version};

/// A `{channelID, version}` pair in a simplepush notification batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleUpdate {
    /// Channel the version belongs to.
    #[serde(rename = "channelID")]
    pub channel_id: ChannelId,
    /// Monotonic channel version.
    pub version: u64,
}

impl SimpleUpdate {
    /// Create a new update.
    #[must_use]
    pub const fn new(channel_id: ChannelId, version: u64) -> Self {
        Self {
            channel_id,
            version,
        }
    }
}

/// One entry of an `ack` frame. Fields are optional because clients send
/// incomplete entries, which are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckUpdate {
    /// Raw channel id as sent.
    pub channel_id: Option<String>,
    /// Acknowledged version.
    pub version: Option<Version>,
}

impl AckUpdate {
    /// Create a complete ack entry.
    #[must_use]
    pub fn new(channel_id: ChannelId, version: impl Into<Version>) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            version: Some(version.into()),
        }
    }

    fn from_value(value: &Value) -> Self {
        let channel_id = value
            .get("channelID")
            .and_then(Value::as_str)
            .map(str::to_string);
        let version = value
            .get("version")
            .and_then(|v| serde_json::from_value::<Version>(v.clone()).ok());
        Self {
            channel_id,
            version,
        }
    }
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Handshake; must be the first frame.
    Hello {
        /// Uaid offered by a returning client.
        uaid: Option<String>,
        /// Request webpush mode.
        use_webpush: bool,
    },
    /// Subscribe a new channel.
    Register {
        /// Raw channel id as sent.
        channel_id: Option<String>,
    },
    /// Drop a channel.
    Unregister {
        /// Raw channel id as sent.
        channel_id: Option<String>,
        /// The original frame, echoed back in the reply.
        raw: Map<String, Value>,
    },
    /// Acknowledge delivered notifications.
    Ack {
        /// Acknowledged entries.
        updates: Vec<AckUpdate>,
    },
    /// Keepalive, the empty object `{}`.
    Ping,
    /// A `messageType` this node does not know.
    Unknown(String),
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object or carries no
    /// `messageType`.
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(ProtoError::Decoding("frame is not a JSON object".into()));
        };

        if map.is_empty() {
            return Ok(Self::Ping);
        }

        let kind = match map.get("messageType") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => return Ok(Self::Unknown(other.to_string())),
            None => return Err(ProtoError::MissingField("messageType")),
        };

        let channel_id = || {
            map.get("channelID")
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let msg = match kind.as_str() {
            "hello" => Self::Hello {
                uaid: map.get("uaid").and_then(Value::as_str).map(str::to_string),
                use_webpush: map
                    .get("use_webpush")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "register" => Self::Register {
                channel_id: channel_id(),
            },
            "unregister" => Self::Unregister {
                channel_id: channel_id(),
                raw: map.clone(),
            },
            "ack" => Self::Ack {
                updates: map
                    .get("updates")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().map(AckUpdate::from_value).collect())
                    .unwrap_or_default(),
            },
            _ => Self::Unknown(kind),
        };
        Ok(msg)
    }
}

/// Value of the `messageType` field on replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Hello reply.
    Hello,
    /// Register reply.
    Register,
    /// Unregister reply.
    Unregister,
    /// Notification delivery.
    Notification,
    /// Ack (never replied to, but named for error replies).
    Ack,
}

/// Frames sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Successful hello.
    Hello {
        /// Always [`MessageType::Hello`].
        #[serde(rename = "messageType")]
        message_type: MessageType,
        /// The uaid bound to this connection.
        uaid: Uaid,
        /// Status code.
        status: u16,
        /// Present only for webpush connections.
        #[serde(skip_serializing_if = "Option::is_none")]
        use_webpush: Option<bool>,
    },
    /// Status-only reply, used for errors.
    Status {
        /// Type of the frame being answered.
        #[serde(rename = "messageType")]
        message_type: MessageType,
        /// Optional reason string.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Status code.
        status: u16,
    },
    /// Successful register.
    Registered {
        /// Always [`MessageType::Register`].
        #[serde(rename = "messageType")]
        message_type: MessageType,
        /// The channel id exactly as the client sent it.
        #[serde(rename = "channelID")]
        channel_id: String,
        /// Endpoint application servers push to.
        #[serde(rename = "pushEndpoint")]
        push_endpoint: String,
        /// Status code.
        status: u16,
    },
    /// Echo of the client's frame with a `status` added.
    Echo(Map<String, Value>),
    /// Simplepush batch of channel versions.
    Updates {
        /// Always [`MessageType::Notification`].
        #[serde(rename = "messageType")]
        message_type: MessageType,
        /// Channel versions.
        updates: Vec<SimpleUpdate>,
    },
    /// Single webpush notification.
    Message {
        /// Always [`MessageType::Notification`].
        #[serde(rename = "messageType")]
        message_type: MessageType,
        /// Target channel.
        #[serde(rename = "channelID")]
        channel_id: ChannelId,
        /// Message id.
        version: Version,
        /// Payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        /// Payload headers.
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
    },
    /// Reply to a ping: the empty object.
    Pong {},
}

impl ServerMessage {
    /// Successful hello reply.
    #[must_use]
    pub fn hello(uaid: Uaid, webpush: bool) -> Self {
        Self::Hello {
            message_type: MessageType::Hello,
            uaid,
            status: 200,
            use_webpush: webpush.then_some(true),
        }
    }

    /// Status reply without a reason.
    #[must_use]
    pub const fn status(message_type: MessageType, status: u16) -> Self {
        Self::Status {
            message_type,
            reason: None,
            status,
        }
    }

    /// Status reply with a reason.
    #[must_use]
    pub fn error(message_type: MessageType, reason: impl Into<String>, status: u16) -> Self {
        Self::Status {
            message_type,
            reason: Some(reason.into()),
            status,
        }
    }

    /// Successful register reply.
    #[must_use]
    pub fn registered(channel_id: impl Into<String>, push_endpoint: impl Into<String>) -> Self {
        Self::Registered {
            message_type: MessageType::Register,
            channel_id: channel_id.into(),
            push_endpoint: push_endpoint.into(),
            status: 200,
        }
    }

    /// Echo a frame back with the given status.
    #[must_use]
    pub fn echo(mut raw: Map<String, Value>, status: u16) -> Self {
        raw.insert("status".into(), Value::from(status));
        Self::Echo(raw)
    }

    /// Simplepush notification batch.
    #[must_use]
    pub const fn updates(updates: Vec<SimpleUpdate>) -> Self {
        Self::Updates {
            message_type: MessageType::Notification,
            updates,
        }
    }

    /// Webpush notification frame.
    #[must_use]
    pub fn message(notification: &Notification) -> Self {
        Self::Message {
            message_type: MessageType::Notification,
            channel_id: notification.channel_id,
            version: notification.version.clone(),
            data: notification.data.clone(),
            headers: notification.headers.clone(),
        }
    }

    /// Ping reply.
    #[must_use]
    pub const fn pong() -> Self {
        Self::Pong {}
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }
}
