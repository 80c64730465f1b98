use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;
use secrecy::SecretString;
use strum_macros::Display;
use uuid::Uuid;

const DEFAULT_HEARTBEAT_SKIP_TOLERANCE: Duration = Duration::from_secs(10);
const DEFAULT_LINEAR_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_MAX_EXPONENTIAL_BACKOFF: Duration = Duration::from_secs(32);
const DEFAULT_SUBSCRIBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(310);
const DEFAULT_NON_SUBSCRIBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MESSAGE_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_REQUEST_MESSAGE_COUNT_THRESHOLD: usize = 100;

/// Smallest exponential step, also the delay before the first probe.
pub(crate) const MIN_EXPONENTIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Backoff strategy used after the long-poll loop loses connectivity.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum ReconnectionPolicy {
    /// Never retry automatically; the caller has to invoke `reconnect`.
    None,
    /// Probe every `linear_interval`.
    Linear,
    /// Probe after `min(2^attempt - 1, max_exponential_backoff)` seconds.
    #[default]
    Exponential,
}

/// Which heartbeat outcomes are announced to listeners.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum HeartbeatNotifications {
    None,
    #[default]
    Failures,
    All,
}

fn default_uuid() -> String {
    format!("pn-{}", Uuid::new_v4())
}

/// Configuration for [`crate::subscribe::Client`].
///
/// ```
/// use std::time::Duration;
///
/// use pubsub_client_sdk::config::{Config, ReconnectionPolicy};
///
/// let config = Config::builder()
///     .subscribe_key("demo")
///     .presence_timeout(120)
///     .reconnection_policy(ReconnectionPolicy::Linear)
///     .linear_interval(Duration::from_secs(5))
///     .build();
///
/// assert_eq!(config.heartbeat_period(), Some(Duration::from_secs(59)));
/// ```
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// Subscribe key placed in every request path.
    #[builder(into)]
    pub(crate) subscribe_key: String,
    /// Identity of this client as seen by presence. Defaults to a random `pn-` prefixed UUID.
    #[builder(into, default = default_uuid())]
    pub(crate) uuid: String,
    /// Optional authorization key sent as the `auth` query parameter.
    pub(crate) auth_key: Option<SecretString>,
    /// Seconds the server keeps this client present without a heartbeat. Zero disables presence.
    #[builder(default)]
    pub(crate) presence_timeout: u32,
    /// Seconds between heartbeats. Zero derives it from `presence_timeout`.
    #[builder(default)]
    pub(crate) heartbeat_interval: u32,
    /// A coupled heartbeat is postponed when the last poll left more slack than this.
    #[builder(default = DEFAULT_HEARTBEAT_SKIP_TOLERANCE)]
    pub(crate) heartbeat_skip_tolerance: Duration,
    #[builder(default)]
    pub(crate) heartbeat_notifications: HeartbeatNotifications,
    /// Default server-side filter applied to subscribe calls.
    #[builder(into)]
    pub(crate) filter_expression: Option<String>,
    #[builder(default)]
    pub(crate) reconnection_policy: ReconnectionPolicy,
    /// Reconnection probes allowed before giving up. `-1` means unlimited.
    #[builder(default = -1)]
    pub(crate) maximum_reconnection_retries: i32,
    #[builder(default = DEFAULT_LINEAR_INTERVAL)]
    pub(crate) linear_interval: Duration,
    #[builder(default = DEFAULT_MAX_EXPONENTIAL_BACKOFF)]
    pub(crate) max_exponential_backoff: Duration,
    /// Must stay above the server's long-poll hold time.
    #[builder(default = DEFAULT_SUBSCRIBE_REQUEST_TIMEOUT)]
    pub(crate) subscribe_request_timeout: Duration,
    #[builder(default = DEFAULT_NON_SUBSCRIBE_REQUEST_TIMEOUT)]
    pub(crate) non_subscribe_request_timeout: Duration,
    /// Capacity of the internal queue between the poll loop and the delivery worker.
    #[builder(default = DEFAULT_MESSAGE_QUEUE_CAPACITY)]
    pub(crate) message_queue_capacity: usize,
    /// A poll returning at least this many messages is reported to listeners. Zero disables.
    #[builder(default = DEFAULT_REQUEST_MESSAGE_COUNT_THRESHOLD)]
    pub(crate) request_message_count_threshold: usize,
    /// Skip the leave call when unsubscribing.
    #[builder(default)]
    pub(crate) suppress_leave_events: bool,
}

impl Config {
    /// Effective heartbeat period, `None` when heartbeating is disabled.
    #[must_use]
    pub fn heartbeat_period(&self) -> Option<Duration> {
        if self.heartbeat_interval > 0 {
            return Some(Duration::from_secs(u64::from(self.heartbeat_interval)));
        }
        if self.presence_timeout > 0 {
            let secs = (self.presence_timeout / 2).saturating_sub(1).max(1);
            return Some(Duration::from_secs(u64::from(secs)));
        }
        None
    }

    /// Retry ceiling, `None` when unlimited.
    #[must_use]
    pub fn max_retries(&self) -> Option<u32> {
        u32::try_from(self.maximum_reconnection_retries).ok()
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn subscribe_key(&self) -> &str {
        &self.subscribe_key
    }

    #[must_use]
    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        self.reconnection_policy
    }
}

/// Delay schedule for reconnection probes.
///
/// The exponential schedule yields `2^m - 1` seconds for the current multiplier `m`
/// (starting at 1) and bumps `m` afterwards. Once a step would exceed the cap, the cap
/// is returned and `m` starts over at 1.
#[derive(Debug, Clone)]
pub struct PolicyBackoff {
    policy: ReconnectionPolicy,
    linear_interval: Duration,
    max_backoff: Duration,
    multiplier: u32,
}

impl PolicyBackoff {
    #[must_use]
    pub fn new(policy: ReconnectionPolicy, linear_interval: Duration, max_backoff: Duration) -> Self {
        Self {
            policy,
            linear_interval,
            max_backoff,
            multiplier: 1,
        }
    }

    /// Delay before the first probe of a reconnection run.
    #[must_use]
    pub fn initial_delay(&self) -> Option<Duration> {
        match self.policy {
            ReconnectionPolicy::None => None,
            ReconnectionPolicy::Linear => Some(self.linear_interval),
            ReconnectionPolicy::Exponential => Some(MIN_EXPONENTIAL_BACKOFF.min(self.max_backoff)),
        }
    }

    #[must_use]
    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }
}

impl From<&Config> for PolicyBackoff {
    fn from(config: &Config) -> Self {
        Self::new(
            config.reconnection_policy,
            config.linear_interval,
            config.max_exponential_backoff,
        )
    }
}

impl Backoff for PolicyBackoff {
    fn reset(&mut self) {
        self.multiplier = 1;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        match self.policy {
            ReconnectionPolicy::None => None,
            ReconnectionPolicy::Linear => Some(self.linear_interval),
            ReconnectionPolicy::Exponential => {
                let secs = 2_u64
                    .checked_pow(self.multiplier)
                    .map_or(u64::MAX, |step| step - 1);
                let interval = Duration::from_secs(secs);

                if interval > self.max_backoff {
                    self.multiplier = 1;
                    Some(self.max_backoff)
                } else {
                    self.multiplier = self.multiplier.saturating_add(1);
                    Some(interval)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::builder().subscribe_key("demo").build()
    }

    #[test]
    fn exponential_sequence_caps_and_restarts() {
        let mut backoff = PolicyBackoff::new(
            ReconnectionPolicy::Exponential,
            DEFAULT_LINEAR_INTERVAL,
            DEFAULT_MAX_EXPONENTIAL_BACKOFF,
        );

        let secs: Vec<u64> = (0..8)
            .map(|_| backoff.next_backoff().unwrap().as_secs())
            .collect();

        assert_eq!(secs, vec![1, 3, 7, 15, 31, 32, 1, 3]);
    }

    #[test]
    fn reset_restarts_multiplier() {
        let mut backoff = PolicyBackoff::from(&config());
        let _first = backoff.next_backoff();
        let _second = backoff.next_backoff();
        assert_eq!(backoff.multiplier(), 3);

        backoff.reset();

        assert_eq!(backoff.multiplier(), 1);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn linear_is_constant() {
        let mut backoff = PolicyBackoff::new(
            ReconnectionPolicy::Linear,
            Duration::from_millis(250),
            DEFAULT_MAX_EXPONENTIAL_BACKOFF,
        );

        assert_eq!(backoff.initial_delay(), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn none_policy_never_schedules() {
        let mut backoff = PolicyBackoff::new(
            ReconnectionPolicy::None,
            DEFAULT_LINEAR_INTERVAL,
            DEFAULT_MAX_EXPONENTIAL_BACKOFF,
        );

        assert_eq!(backoff.initial_delay(), None);
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn heartbeat_period_derivation() {
        assert_eq!(config().heartbeat_period(), None);

        let derived = Config::builder()
            .subscribe_key("demo")
            .presence_timeout(300)
            .build();
        assert_eq!(derived.heartbeat_period(), Some(Duration::from_secs(149)));

        let explicit = Config::builder()
            .subscribe_key("demo")
            .presence_timeout(300)
            .heartbeat_interval(20)
            .build();
        assert_eq!(explicit.heartbeat_period(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn negative_retries_mean_unlimited() {
        assert_eq!(config().max_retries(), None);

        let limited = Config::builder()
            .subscribe_key("demo")
            .maximum_reconnection_retries(2)
            .build();
        assert_eq!(limited.max_retries(), Some(2));
    }

    #[test]
    fn default_uuid_is_prefixed() {
        assert!(config().uuid().starts_with("pn-"));
    }
}
