//! # push-proto
//!
//! Protocol definitions shared by the push connection node: identifiers,
//! notifications, and the JSON frames exchanged with clients.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtoError;
pub use messages::{AckUpdate, ClientMessage, MessageType, ServerMessage, SimpleUpdate};
pub use types::{ChannelId, Headers, Notification, ProtocolMode, Uaid, Version};
