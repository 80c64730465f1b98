#![expect(
    clippy::module_name_repetitions,
    reason = "Listener types deliberately include the module name for clarity"
)]

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::types::{PnMessage, PnPresence, PnStatus};

/// Handle returned by [`ListenerManager::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-owned delivery channels for status, message and presence events.
///
/// A full channel makes delivery to this listener wait until the caller drains it; other
/// listeners are not held up.
#[derive(Debug, Clone)]
pub struct Listener {
    id: ListenerId,
    status: mpsc::Sender<PnStatus>,
    message: mpsc::Sender<PnMessage>,
    presence: mpsc::Sender<PnPresence>,
}

/// Receiving halves created by [`Listener::channel`].
#[non_exhaustive]
#[derive(Debug)]
pub struct ListenerReceivers {
    pub status: mpsc::Receiver<PnStatus>,
    pub message: mpsc::Receiver<PnMessage>,
    pub presence: mpsc::Receiver<PnPresence>,
}

impl Listener {
    #[must_use]
    pub fn new(
        status: mpsc::Sender<PnStatus>,
        message: mpsc::Sender<PnMessage>,
        presence: mpsc::Sender<PnPresence>,
    ) -> Self {
        Self {
            id: ListenerId(Uuid::new_v4()),
            status,
            message,
            presence,
        }
    }

    /// Create a listener with three channels of `capacity` slots each (at least one).
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, ListenerReceivers) {
        let capacity = capacity.max(1);
        let (status_tx, status) = mpsc::channel(capacity);
        let (message_tx, message) = mpsc::channel(capacity);
        let (presence_tx, presence) = mpsc::channel(capacity);

        (
            Self::new(status_tx, message_tx, presence_tx),
            ListenerReceivers {
                status,
                message,
                presence,
            },
        )
    }

    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Hand queued events to the caller's channels in queue order.
    async fn forward(self, mut queue: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = queue.recv().await {
            match event {
                Event::Status(status) => deliver(self.id, &self.status, status).await,
                Event::Message(message) => deliver(self.id, &self.message, message).await,
                Event::Presence(presence) => deliver(self.id, &self.presence, presence).await,
            }
        }
    }
}

/// A registered listener: its own queue and the task draining it.
#[derive(Debug)]
struct Registration {
    queue: mpsc::UnboundedSender<Event>,
    handle: JoinHandle<()>,
}

impl Registration {
    fn spawn(listener: Listener) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(listener.forward(rx));

        Self { queue, handle }
    }
}

/// Registry of listeners and fan-out of events to all of them.
///
/// Every listener owns an ordered queue drained by its own task, so announcing never waits
/// on a listener that stopped reading. Must be used inside a Tokio runtime.
#[derive(Debug, Default)]
pub struct ListenerManager {
    listeners: DashMap<ListenerId, Registration>,
}

impl ListenerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. Adding the same listener twice keeps a single registration.
    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = listener.id;
        self.listeners
            .entry(id)
            .or_insert_with(|| Registration::spawn(listener));
        id
    }

    /// Returns `false` if `id` was not registered. Events still queued for it are dropped.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let Some((_, registration)) = self.listeners.remove(&id) else {
            return false;
        };
        registration.handle.abort();
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn announce_status(&self, status: PnStatus) {
        self.announce(&Event::Status(status));
    }

    pub fn announce_message(&self, message: PnMessage) {
        self.announce(&Event::Message(message));
    }

    pub fn announce_presence(&self, presence: PnPresence) {
        self.announce(&Event::Presence(presence));
    }

    fn announce(&self, event: &Event) {
        for queue in self.snapshot() {
            // A closed queue belongs to a listener removed after the snapshot.
            _ = queue.send(event.clone());
        }
    }

    /// Copy of the registered queues; the map is not locked while sending.
    fn snapshot(&self) -> Vec<mpsc::UnboundedSender<Event>> {
        self.listeners
            .iter()
            .map(|entry| entry.value().queue.clone())
            .collect()
    }
}

async fn deliver<T: Send>(id: ListenerId, tx: &mpsc::Sender<T>, event: T) {
    if let Err(e) = tx.send(event).await {
        #[cfg(feature = "tracing")]
        tracing::debug!(listener = %id, "listener dropped its receiver: {e}");
        #[cfg(not(feature = "tracing"))]
        let _ = (&id, &e);
    }
}

/// Event waiting in the delivery queue.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    Status(PnStatus),
    Message(PnMessage),
    Presence(PnPresence),
}

/// Bounded queue between the managers and a single delivery worker.
///
/// Events reach every listener in the order they were dispatched. The worker stops once
/// every `Dispatcher` clone is dropped and the queue is drained.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::Sender<Event>,
}

impl Dispatcher {
    pub(crate) fn spawn(listeners: Arc<ListenerManager>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listeners.announce(&event);
            }

            #[cfg(feature = "tracing")]
            tracing::trace!("delivery queue closed");
        });

        Self { tx }
    }

    /// Queue `event`, waiting for room when the queue is full.
    pub(crate) async fn dispatch(&self, event: Event) {
        if let Err(e) = self.tx.send(event).await {
            #[cfg(feature = "tracing")]
            tracing::warn!("delivery worker is gone, dropping {:?}", e.0);
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    pub(crate) async fn status(&self, status: PnStatus) {
        self.dispatch(Event::Status(status)).await;
    }
}
