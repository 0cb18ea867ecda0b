//! Wire protocol types for courier events and the client transport boundary.

mod adapter;
mod event;

pub use adapter::{ClientAdapter, TransportError};
pub use event::Event;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field names carried by events on the wire.
pub mod fields {
    /// Event type (mandatory).
    pub const EVENT: &str = "p_event";
    /// Creation time in seconds since the epoch.
    pub const TIME: &str = "p_time";
    /// Routing subject of a data event.
    pub const SUBJECT: &str = "p_subject";
    /// Session id, client-supplied on join or assigned by the server.
    pub const ID: &str = "p_id";
    /// Per-connection delivery sequence number.
    pub const SEQ: &str = "p_seq";
    /// Subscription id stamped on multicast deliveries.
    pub const SUBSCRIPTION_ID: &str = "p_sid";
    /// Optional client label stamped on multicast deliveries.
    pub const SUBSCRIPTION_LABEL: &str = "p_label";
    /// Refresh wait hint in milliseconds.
    pub const WAIT: &str = "p_wait";
    /// Refresh URL.
    pub const URL: &str = "p_url";
    /// Requested transport mode.
    pub const MODE: &str = "p_mode";
    /// Requested wire format.
    pub const FORMAT: &str = "p_format";
    /// Sender session id on peer-to-peer messages.
    pub const FROM: &str = "p_from";
    /// Recipient session id on peer-to-peer messages.
    pub const TO: &str = "p_to";
    /// When `"true"`, drop the event for sessions that are not online.
    pub const ONLINE_ONLY: &str = "p_online";
}

/// Event type values.
pub mod kinds {
    pub const JOIN: &str = "join";
    pub const LISTEN: &str = "listen";
    pub const JOIN_LISTEN: &str = "join-listen";
    pub const LEAVE: &str = "leave";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PUBLISH: &str = "publish";
    pub const DATA: &str = "data";
    pub const HEARTBEAT: &str = "hb";
    pub const REFRESH: &str = "refresh";
    pub const REFRESH_ACK: &str = "refresh-ack";
    pub const ABORT: &str = "abort";
    pub const LISTEN_ACK: &str = "listen-ack";
    pub const JOIN_LISTEN_ACK: &str = "join-listen-ack";
}

/// Errors raised while interpreting protocol values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// An event was built from fields without an event type.
    #[error("missing field {}", fields::EVENT)]
    MissingEventType,
    /// Transport mode string is not one of stream/pull/poll.
    #[error("unknown mode: {0}")]
    UnknownMode(String),
    /// Wire format string is not recognized.
    #[error("unknown format: {0}")]
    UnknownFormat(String),
}

/// Delivery mode of a subscriber connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Long-lived response; events are pushed as they arrive.
    #[default]
    Stream,
    /// Each request blocks for one batch, then asks the client to refresh.
    Pull,
    /// Each request returns immediately with whatever is queued.
    Poll,
}

impl Mode {
    /// Return the mode as its wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Stream => "stream",
            Mode::Pull => "pull",
            Mode::Poll => "poll",
        }
    }

    /// True for the request/response modes.
    pub fn is_refreshing(&self) -> bool {
        matches!(self, Mode::Pull | Mode::Poll)
    }
}

impl FromStr for Mode {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "stream" => Ok(Mode::Stream),
            "pull" => Ok(Mode::Pull),
            "poll" => Ok(Mode::Poll),
            other => Err(ProtocolError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding the client asked responses to be rendered in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /// Inline JavaScript callbacks.
    Js,
    /// Lenient XML.
    #[default]
    Xml,
    /// XML with escaped attribute values.
    XmlStrict,
    /// JSON objects.
    Json,
}

impl WireFormat {
    /// Return the format as its wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Js => "js",
            WireFormat::Xml => "xml",
            WireFormat::XmlStrict => "xml-strict",
            WireFormat::Json => "json",
        }
    }
}

impl FromStr for WireFormat {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "js" => Ok(WireFormat::Js),
            "xml" => Ok(WireFormat::Xml),
            "xml-strict" => Ok(WireFormat::XmlStrict),
            "json" => Ok(WireFormat::Json),
            other => Err(ProtocolError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
