//! Core types for the push protocol.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;

/// Opaque per-installation client identifier.
///
/// Stable across reconnects. Rendered as 32 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Uaid(Uuid);

impl Uaid {
    /// Mint a new random `Uaid`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a `Uaid` from either the dashed or the plain hex form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtoError::Validation(format!("invalid uaid: {e}")))
    }

    /// Resolve the uaid a client offered in its hello.
    ///
    /// A well-formed value is kept; an absent or malformed one is replaced
    /// with a freshly minted identifier.
    #[must_use]
    pub fn from_client(offered: Option<&str>) -> Self {
        offered
            .and_then(|s| Self::parse(s).ok())
            .unwrap_or_default()
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for Uaid {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for Uaid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<Uaid> for String {
    fn from(uaid: Uaid) -> Self {
        uaid.to_string()
    }
}

impl TryFrom<String> for Uaid {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for Uaid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of one subscription channel within a [`Uaid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Create a new random `ChannelId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a `ChannelId` from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtoError::Validation(format!("invalid channel ID: {e}")))
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ChannelId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Notification version.
///
/// Simplepush clients see a monotonic integer per channel; webpush clients
/// see an opaque message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Version {
    /// Integer version (simplepush).
    Simple(u64),
    /// Message identifier (webpush).
    Message(String),
}

impl Version {
    /// Integer view of this version, accepting numeric strings.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Simple(v) => Some(*v),
            Self::Message(s) => s.parse().ok(),
        }
    }

    /// Message-id view of this version.
    #[must_use]
    pub fn as_message_id(&self) -> String {
        self.to_string()
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Self::Simple(v)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::Message(s.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(v) => write!(f, "{v}"),
            Self::Message(s) => write!(f, "{s}"),
        }
    }
}

/// Notification headers (webpush encryption metadata and similar).
pub type Headers = HashMap<String, String>;

/// A notification addressed to one channel. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Target channel.
    #[serde(rename = "channelID")]
    pub channel_id: ChannelId,
    /// Version or message id.
    pub version: Version,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Payload headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    /// Time to live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl Notification {
    /// Create a payload-less notification.
    #[must_use]
    pub fn new(channel_id: ChannelId, version: impl Into<Version>) -> Self {
        Self {
            channel_id,
            version: version.into(),
            data: None,
            headers: None,
            ttl: None,
        }
    }

    /// Attach a payload and its headers.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<String>, headers: Headers) -> Self {
        self.data = Some(data.into());
        self.headers = Some(headers);
        self
    }

    /// Set the time to live.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Protocol variant chosen by a client at hello time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    /// Legacy mode: one monotonic version per channel.
    #[default]
    SimplePush,
    /// Multiple individually addressable stored messages per channel.
    WebPush,
}

impl ProtocolMode {
    /// Select the mode from the hello `use_webpush` flag.
    #[must_use]
    pub const fn from_use_webpush(use_webpush: bool) -> Self {
        if use_webpush {
            Self::WebPush
        } else {
            Self::SimplePush
        }
    }

    /// Check if this is webpush mode.
    #[must_use]
    pub const fn is_webpush(&self) -> bool {
        matches!(self, Self::WebPush)
    }

    /// Router type recorded in the registry.
    #[must_use]
    pub const fn router_type(&self) -> &'static str {
        match self {
            Self::SimplePush => "simplepush",
            Self::WebPush => "webpush",
        }
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.router_type())
    }
}
