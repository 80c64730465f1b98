use std::sync::Arc;

use reqwest::Client as ReqwestClient;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use super::heartbeat::{HeartbeatManager, HeartbeatMode};
use super::listener::{Dispatcher, Listener, ListenerId, ListenerManager};
use super::state::StateManager;
use super::subscription::{Phase, SubscriptionManager};
use super::types::{Cursor, OperationType, Subscription};
use crate::Result;
use crate::api::Api;
use crate::config::Config;
use crate::error::Error;
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{State, Timetoken};

/// Client for the long-poll subscribe stream.
///
/// Membership calls are synchronous: they update the subscription set and return, while
/// the poll loop, heartbeat and reconnection run as background tasks. Events are delivered
/// to every registered [`Listener`].
///
/// The client must be created inside a Tokio runtime. Dropping the last clone cancels all
/// background work, like [`Client::destroy`].
///
/// # Example
///
/// ```no_run
/// use pubsub_client_sdk::config::Config;
/// use pubsub_client_sdk::subscribe::{Client, Listener, Subscription};
///
/// # async fn run() -> pubsub_client_sdk::Result<()> {
/// let config = Config::builder().subscribe_key("demo").build();
/// let client = Client::new("https://ps.pndsn.com", config)?;
///
/// let (listener, mut events) = Listener::channel(100);
/// client.add_listener(listener);
/// client.subscribe(
///     Subscription::builder()
///         .channels(vec!["news".to_owned()])
///         .build(),
/// )?;
///
/// while let Some(message) = events.message.recv().await {
///     println!("{}: {}", message.channel, message.payload);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    api: Api,
    state: Arc<StateManager>,
    listeners: Arc<ListenerManager>,
    heartbeat: Arc<HeartbeatManager>,
    subscription: Arc<SubscriptionManager>,
    root: CancellationToken,
    _shutdown: DropGuard,
}

impl Client {
    /// Creates a client talking to `origin` over a default [`ReqwestTransport`].
    ///
    /// # Errors
    ///
    /// Returns an error if `origin` is not a valid base URL, the subscribe key is empty, or
    /// the HTTP client cannot be created.
    pub fn new(origin: &str, config: Config) -> Result<Self> {
        let mut headers = HeaderMap::new();

        headers.insert("User-Agent", HeaderValue::from_static("rs_pubsub_client"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        Self::with_transport(origin, config, Arc::new(ReqwestTransport::new(client)))
    }

    /// Creates a client that issues its requests through `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if `origin` is not a valid base URL or the subscribe key is empty.
    pub fn with_transport(
        origin: &str,
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if config.subscribe_key.trim().is_empty() {
            return Err(Error::validation("subscribe key must not be empty"));
        }
        let origin = Url::parse(origin)?;
        if origin.cannot_be_a_base() {
            return Err(Error::validation(format!("{origin} cannot be a base URL")));
        }

        let capacity = config.message_queue_capacity;
        let api = Api::new(origin, Arc::new(config), transport);
        let root = CancellationToken::new();
        let state = Arc::new(StateManager::new());
        let listeners = Arc::new(ListenerManager::new());
        let dispatcher = Dispatcher::spawn(Arc::clone(&listeners), capacity);
        let heartbeat = Arc::new(HeartbeatManager::new(
            api.clone(),
            Arc::clone(&state),
            dispatcher.clone(),
            root.clone(),
        ));
        let subscription = Arc::new(SubscriptionManager::new(
            api.clone(),
            Arc::clone(&state),
            Arc::clone(&heartbeat),
            dispatcher,
            root.clone(),
        ));

        Ok(Self {
            inner: Arc::new(ClientInner {
                api,
                state,
                listeners,
                heartbeat,
                subscription,
                _shutdown: root.clone().drop_guard(),
                root,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        self.inner.api.config()
    }

    /// Add channels and groups to the subscription set.
    ///
    /// The next poll is a catch-up poll; listeners get `Connected` once it succeeds.
    ///
    /// # Errors
    ///
    /// Returns a validation error when both lists are empty, or a cancellation error after
    /// [`Client::destroy`].
    pub fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.inner.subscription.subscribe(subscription)
    }

    /// Remove channels and groups and, unless suppressed, announce a leave for them.
    ///
    /// # Errors
    ///
    /// Returns a validation error when both lists are empty.
    pub fn unsubscribe(&self, channels: &[&str], groups: &[&str]) -> Result<()> {
        let (channels, groups) = owned(channels, groups)?;
        self.inner.subscription.unsubscribe(&channels, &groups);
        Ok(())
    }

    pub fn unsubscribe_all(&self) {
        self.inner.subscription.unsubscribe_all();
    }

    /// Replace the presence state of already-subscribed entities.
    ///
    /// Unknown names are ignored; the state reaches the server with the next heartbeat or
    /// catch-up poll.
    ///
    /// # Errors
    ///
    /// Returns a validation error when both lists are empty.
    pub fn set_state(&self, channels: &[&str], groups: &[&str], state: &State) -> Result<()> {
        let (channels, groups) = owned(channels, groups)?;
        self.inner.state.set_state(&channels, &groups, state);
        Ok(())
    }

    /// Announce presence on entities without subscribing to them.
    ///
    /// With `connected` the entities join the heartbeat set and the heartbeat runs
    /// independently of the poll loop. Without it they are removed and a leave is sent.
    ///
    /// # Errors
    ///
    /// Returns a validation error when both lists are empty.
    pub fn presence(&self, channels: &[&str], groups: &[&str], connected: bool) -> Result<()> {
        let (channels, groups) = owned(channels, groups)?;
        let heartbeat = &self.inner.heartbeat;

        if connected {
            heartbeat.add_presence(&channels, &groups);
            heartbeat.start(HeartbeatMode::Independent);
            return Ok(());
        }

        if !heartbeat.remove_presence(&channels, &groups)
            && heartbeat.mode() == Some(HeartbeatMode::Independent)
        {
            heartbeat.destroy();
            if !matches!(self.phase(), Phase::Idle | Phase::Stopped) {
                heartbeat.start(HeartbeatMode::Coupled);
            }
        }
        self.inner
            .subscription
            .leave(channels, groups, OperationType::Presence);
        Ok(())
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        self.inner.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove_listener(id)
    }

    /// Restart polling after the loop stopped, e.g. with the `None` reconnection policy or
    /// after retries were exhausted. Success is announced as `Reconnected`.
    pub fn reconnect(&self) {
        self.inner.subscription.reconnect();
    }

    /// Current server timetoken.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the client was destroyed.
    pub async fn time(&self) -> Result<Timetoken> {
        self.inner.api.time(&self.inner.root).await
    }

    #[must_use]
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner.state.prepare_channel_list(false)
    }

    #[must_use]
    pub fn subscribed_channel_groups(&self) -> Vec<String> {
        self.inner.state.prepare_group_list(false)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.subscription.phase()
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.inner.subscription.cursor()
    }

    /// Stop every background task. Listeners get a single `Cancelled` status.
    pub fn destroy(&self) {
        self.inner.subscription.destroy();
    }
}

fn owned(channels: &[&str], groups: &[&str]) -> Result<(Vec<String>, Vec<String>)> {
    if channels.is_empty() && groups.is_empty() {
        return Err(Error::validation(
            "at least one channel or channel group is required",
        ));
    }

    Ok((
        channels.iter().map(|name| (*name).to_owned()).collect(),
        groups.iter().map(|name| (*name).to_owned()).collect(),
    ))
}
