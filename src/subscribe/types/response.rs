use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::Value;
use serde_with::serde_as;
use strum_macros::Display;

use crate::PRESENCE_SUFFIX;
use crate::Result;
use crate::serde_helpers::{TimetokenFromAny, deserialize_with_warnings};
use crate::types::{State, Timetoken};

/// Resume point of the long-poll stream.
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Cursor {
    #[serde(rename = "t")]
    #[serde_as(as = "TimetokenFromAny")]
    pub timetoken: Timetoken,
    #[serde(rename = "r", default)]
    pub region: u32,
}

impl Cursor {
    #[must_use]
    pub const fn new(timetoken: Timetoken, region: u32) -> Self {
        Self { timetoken, region }
    }
}

/// Body of a subscribe response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubscribeEnvelope {
    #[serde(rename = "t")]
    pub cursor: Cursor,
    #[serde(rename = "m", default)]
    pub messages: Vec<EnvelopeItem>,
}

/// One entry of the `m` array.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EnvelopeItem {
    #[serde(rename = "a", default)]
    _shard: Option<IgnoredAny>,
    #[serde(rename = "f", default)]
    _flags: Option<IgnoredAny>,
    #[serde(rename = "k", default)]
    _subscribe_key: Option<IgnoredAny>,
    #[serde(rename = "o", default)]
    _origination: Option<IgnoredAny>,
    #[serde(rename = "c")]
    pub channel: String,
    #[serde(rename = "b", default)]
    pub subscription_match: Option<String>,
    #[serde(rename = "d", default)]
    pub payload: Value,
    #[serde(rename = "e", default)]
    pub message_type: Option<u8>,
    #[serde(rename = "i", default)]
    pub publisher: Option<String>,
    #[serde(rename = "u", default)]
    pub user_metadata: Option<Value>,
    #[serde(rename = "p", default)]
    pub publish: Cursor,
}

impl EnvelopeItem {
    fn is_presence(&self) -> bool {
        self.channel.ends_with(PRESENCE_SUFFIX)
            || self
                .subscription_match
                .as_deref()
                .is_some_and(|name| name.ends_with(PRESENCE_SUFFIX))
    }

    /// A `b` equal to the channel carries no extra information.
    fn subscription(&self) -> Option<String> {
        self.subscription_match
            .as_ref()
            .filter(|name| **name != self.channel)
            .cloned()
    }
}

/// Type tag of a non-presence stream entry.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum MessageKind {
    #[default]
    Message,
    Signal,
    Object,
    MessageAction,
    File,
}

impl MessageKind {
    /// Maps the `e` field; unknown codes are treated as plain messages.
    #[must_use]
    pub const fn from_code(code: Option<u8>) -> Self {
        match code {
            Some(1) => Self::Signal,
            Some(2) => Self::Object,
            Some(3) => Self::MessageAction,
            Some(4) => Self::File,
            _ => Self::Message,
        }
    }
}

/// A message, signal or other non-presence entry delivered on a channel.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct PnMessage {
    pub channel: String,
    /// Channel group or wildcard that matched, when it differs from `channel`.
    pub subscription: Option<String>,
    pub payload: Value,
    pub timetoken: Timetoken,
    pub publisher: Option<String>,
    pub user_metadata: Option<Value>,
    pub kind: MessageKind,
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PresenceEvent {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A presence event decoded from a `-pnpres` stream.
///
/// `channel` and `subscription` have the presence suffix removed.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PnPresence {
    pub event: PresenceEvent,
    pub uuid: Option<String>,
    pub occupancy: u32,
    pub state: Option<State>,
    pub channel: String,
    pub subscription: Option<String>,
    /// Server time of the event, in seconds.
    pub timestamp: i64,
    pub timetoken: Timetoken,
    /// Set on interval events when the occupant lists were too large to inline.
    pub here_now_refresh: bool,
    pub join: Vec<String>,
    pub leave: Vec<String>,
    pub timeout: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PresencePayload {
    #[serde(default)]
    action: PresenceEvent,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    occupancy: u32,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    state: Option<State>,
    #[serde(default)]
    here_now_refresh: bool,
    #[serde(default)]
    join: Vec<String>,
    #[serde(default)]
    leave: Vec<String>,
    #[serde(default)]
    timeout: Vec<String>,
}

/// Decoded stream entry.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(PnMessage),
    Signal(PnMessage),
    Presence(PnPresence),
}

impl TryFrom<EnvelopeItem> for StreamEvent {
    type Error = crate::error::Error;

    fn try_from(item: EnvelopeItem) -> Result<Self> {
        if item.is_presence() {
            let subscription = item.subscription().map(|name| strip_presence(&name));
            let payload: PresencePayload = deserialize_with_warnings(item.payload)?;

            return Ok(Self::Presence(PnPresence {
                event: payload.action,
                uuid: payload.uuid,
                occupancy: payload.occupancy,
                state: payload.state,
                channel: strip_presence(&item.channel),
                subscription,
                timestamp: payload.timestamp,
                timetoken: item.publish.timetoken,
                here_now_refresh: payload.here_now_refresh,
                join: payload.join,
                leave: payload.leave,
                timeout: payload.timeout,
            }));
        }

        let kind = MessageKind::from_code(item.message_type);
        let subscription = item.subscription();
        let message = PnMessage {
            channel: item.channel,
            subscription,
            payload: item.payload,
            timetoken: item.publish.timetoken,
            publisher: item.publisher,
            user_metadata: item.user_metadata,
            kind,
        };

        Ok(match kind {
            MessageKind::Signal => Self::Signal(message),
            _ => Self::Message(message),
        })
    }
}

fn strip_presence(name: &str) -> String {
    name.strip_suffix(PRESENCE_SUFFIX).unwrap_or(name).to_owned()
}

/// Body of heartbeat and leave responses.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PresenceResponse {
    pub status: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub action: Option<String>,
}
