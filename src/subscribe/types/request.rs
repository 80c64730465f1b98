use bon::Builder;
use serde::Serialize;

use crate::types::{State, Timetoken};

/// What a caller wants added to the subscription set.
///
/// ```
/// use pubsub_client_sdk::subscribe::types::Subscription;
///
/// let subscription = Subscription::builder()
///     .channels(vec!["news".to_owned()])
///     .with_presence(true)
///     .build();
///
/// assert!(subscription.channel_groups.is_empty());
/// ```
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Builder)]
pub struct Subscription {
    #[builder(default)]
    pub channels: Vec<String>,
    #[builder(default)]
    pub channel_groups: Vec<String>,
    /// Resume point used once the catch-up poll has completed.
    pub timetoken: Option<Timetoken>,
    /// Replaces the configured filter expression for subsequent polls.
    #[builder(into)]
    pub filter_expression: Option<String>,
    /// Also subscribe to the `-pnpres` stream of every named entity.
    #[builder(default)]
    pub with_presence: bool,
    /// Presence state attached to every named entity.
    pub state: Option<State>,
}

impl Subscription {
    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.channel_groups.is_empty()
    }
}

/// Query string of a long-poll subscribe call.
#[derive(Debug, Serialize)]
pub(crate) struct SubscribeQuery<'a> {
    pub uuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<&'a str>,
    pub tt: Timetoken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tr: Option<u32>,
    #[serde(rename = "channel-group", skip_serializing_if = "Option::is_none")]
    pub channel_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u32>,
    #[serde(rename = "filter-expr", skip_serializing_if = "Option::is_none")]
    pub filter_expr: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Query string of a presence heartbeat call.
#[derive(Debug, Serialize)]
pub(crate) struct HeartbeatQuery<'a> {
    pub uuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u32>,
    #[serde(rename = "channel-group", skip_serializing_if = "Option::is_none")]
    pub channel_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Query string of a presence leave call.
#[derive(Debug, Serialize)]
pub(crate) struct LeaveQuery<'a> {
    pub uuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<&'a str>,
    #[serde(rename = "channel-group", skip_serializing_if = "Option::is_none")]
    pub channel_group: Option<String>,
}

/// Query string of the time call.
#[derive(Debug, Serialize)]
pub(crate) struct TimeQuery<'a> {
    pub uuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<&'a str>,
}

/// Everything one long-poll needs, captured from the managers before the call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PollRequest {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
    pub timetoken: Timetoken,
    pub region: Option<u32>,
    pub filter_expression: Option<String>,
    pub state: State,
}

/// Entities announced by a heartbeat or removed by a leave.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PresenceRequest {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
    pub state: State,
}

impl PresenceRequest {
    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.channel_groups.is_empty()
    }
}

/// Comma-joined group list, `None` when there are no groups.
pub(crate) fn join_groups(groups: &[String]) -> Option<String> {
    (!groups.is_empty()).then(|| groups.join(","))
}

/// Serialized state payload, `None` when no entity carries state.
pub(crate) fn encode_state(state: &State) -> Option<String> {
    if state.is_empty() {
        return None;
    }
    serde_json::to_string(state).ok()
}
