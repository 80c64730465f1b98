#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strum_macros::Display;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatManager, HeartbeatMode};
use super::listener::{Dispatcher, Event};
use super::reconnection::ReconnectionManager;
use super::state::StateManager;
use super::types::request::{PollRequest, PresenceRequest};
use super::types::response::SubscribeEnvelope;
use super::types::{Cursor, OperationType, PnStatus, StatusCategory, StreamEvent, Subscription};
use crate::Result;
use crate::api::Api;
use crate::config::ReconnectionPolicy;
use crate::error::{Error, Kind};
use crate::types::{State, Timetoken};

/// Where the long-poll loop currently is.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Phase {
    /// Nothing subscribed, no request outstanding.
    Idle,
    Polling,
    /// Waiting for the reconnection probe to succeed.
    Reconnecting,
    /// Halted after a failure, exhaustion or shutdown until re-armed.
    Stopped,
}

#[derive(Debug)]
struct PollState {
    cursor: Cursor,
    /// Timetoken to resume from once the next catch-up poll completes.
    stored_timetoken: Option<Timetoken>,
    /// Next poll is a catch-up poll with timetoken 0.
    handshake: bool,
    connected_announced: bool,
    reconnected_pending: bool,
    filter_expression: Option<String>,
}

#[derive(Debug, Default)]
struct LoopSlot {
    running: bool,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Reconnected,
    Exhausted,
}

/// Drives the single outstanding long-poll for the entities held by [`StateManager`].
///
/// Every membership change bumps an epoch. The loop abandons an in-flight poll when the
/// epoch moves, issues a catch-up poll (timetoken 0) and announces `Connected` after the
/// first successful poll of the new epoch.
pub struct SubscriptionManager {
    api: Api,
    state: Arc<StateManager>,
    heartbeat: Arc<HeartbeatManager>,
    reconnection: ReconnectionManager,
    dispatcher: Dispatcher,
    root: CancellationToken,
    phase: watch::Sender<Phase>,
    epoch: watch::Sender<u64>,
    poll: Mutex<PollState>,
    slot: Mutex<LoopSlot>,
    cancelled_announced: AtomicBool,
}

impl SubscriptionManager {
    pub(crate) fn new(
        api: Api,
        state: Arc<StateManager>,
        heartbeat: Arc<HeartbeatManager>,
        dispatcher: Dispatcher,
        root: CancellationToken,
    ) -> Self {
        let filter_expression = api.config().filter_expression.clone();

        Self {
            reconnection: ReconnectionManager::new(api.clone(), root.clone()),
            api,
            state,
            heartbeat,
            dispatcher,
            root,
            phase: watch::Sender::new(Phase::Idle),
            epoch: watch::Sender::new(0),
            poll: Mutex::new(PollState {
                cursor: Cursor::default(),
                stored_timetoken: None,
                handshake: true,
                connected_announced: false,
                reconnected_pending: false,
                filter_expression,
            }),
            slot: Mutex::new(LoopSlot::default()),
            cancelled_announced: AtomicBool::new(false),
        }
    }

    /// Add the entities of `subscription` and make sure the loop is running.
    pub(crate) fn subscribe(self: &Arc<Self>, subscription: Subscription) -> Result<()> {
        if subscription.is_empty() {
            return Err(Error::validation(
                "at least one channel or channel group is required",
            ));
        }
        if self.root.is_cancelled() {
            return Err(Error::cancelled());
        }

        self.state.subscribe(
            &subscription.channels,
            &subscription.channel_groups,
            subscription.state.as_ref(),
            subscription.with_presence,
        );
        {
            let mut poll = self.lock_poll();
            if let Some(timetoken) = subscription.timetoken.filter(|tt| *tt > 0) {
                poll.stored_timetoken = Some(timetoken);
            }
            if let Some(filter) = subscription.filter_expression {
                poll.filter_expression = Some(filter);
            }
        }

        self.membership_changed();
        self.ensure_running();
        Ok(())
    }

    /// Remove entities; a loop left with nothing to poll goes idle by itself.
    pub(crate) fn unsubscribe(self: &Arc<Self>, channels: &[String], groups: &[String]) {
        self.state.unsubscribe(channels, groups);
        self.membership_changed();
        self.ensure_running();
        self.leave(channels.to_vec(), groups.to_vec(), OperationType::Unsubscribe);
    }

    pub(crate) fn unsubscribe_all(self: &Arc<Self>) {
        let (channels, groups) = self.state.unsubscribe_all();
        self.membership_changed();
        self.ensure_running();
        self.leave(channels, groups, OperationType::Unsubscribe);
    }

    /// Re-arm a stopped loop, or restart a running one, with a catch-up poll that is
    /// announced as `Reconnected`.
    pub(crate) fn reconnect(self: &Arc<Self>) {
        if self.root.is_cancelled() {
            return;
        }

        self.mark_reconnected();
        self.reconnection.stop();
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        self.ensure_running();
    }

    /// Tell the server this client left `channels` and `groups`, in the background.
    pub(crate) fn leave(
        &self,
        channels: Vec<String>,
        groups: Vec<String>,
        operation: OperationType,
    ) {
        let request = PresenceRequest {
            channels,
            channel_groups: groups,
            state: State::new(),
        };
        if request.is_empty()
            || self.api.config().suppress_leave_events
            || self.root.is_cancelled()
        {
            return;
        }

        let api = self.api.clone();
        let dispatcher = self.dispatcher.clone();
        let token = self.root.clone();

        tokio::spawn(async move {
            let status = match api.leave(&request, &token).await {
                Ok(_) => PnStatus::new(StatusCategory::Acknowledgment, operation),
                Err(e) if e.kind() == Kind::Cancellation => return,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("leave failed: {e}");
                    PnStatus::from_error(&e, operation)
                }
            };
            dispatcher
                .status(status.with_entities(request.channels, request.channel_groups))
                .await;
        });
    }

    /// Cancel every task and announce `Cancelled` once.
    pub(crate) fn destroy(self: &Arc<Self>) {
        self.root.cancel();
        self.reconnection.stop();
        self.heartbeat.destroy();
        self.set_phase(Phase::Stopped);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let this = Arc::clone(self);
            runtime.spawn(async move { this.announce_cancelled().await });
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver observing every phase change.
    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.lock_poll().cursor
    }

    fn membership_changed(&self) {
        {
            let mut poll = self.lock_poll();
            poll.handshake = true;
            poll.connected_announced = false;
            if self.state.is_empty() {
                poll.cursor = Cursor::default();
                poll.stored_timetoken = None;
            }
        }
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    /// Catch-up poll next, resuming from the last cursor and announced as `Reconnected`.
    fn mark_reconnected(&self) {
        let mut poll = self.lock_poll();
        poll.handshake = true;
        poll.connected_announced = false;
        poll.reconnected_pending = true;
        if poll.stored_timetoken.is_none() && poll.cursor.timetoken != 0 {
            poll.stored_timetoken = Some(poll.cursor.timetoken);
        }
    }

    fn ensure_running(self: &Arc<Self>) {
        let mut slot = self.lock_slot();
        if slot.running || self.root.is_cancelled() {
            return;
        }
        if self.state.is_empty() {
            self.set_phase(Phase::Idle);
            return;
        }

        slot.running = true;
        let token = self.root.child_token();
        slot.handle = Some(tokio::spawn(Arc::clone(self).run(token)));
    }

    /// Mark the loop as gone. With `only_if_empty` this only happens when nothing is
    /// subscribed; the check shares the slot lock with [`Self::ensure_running`].
    fn retire(&self, phase: Phase, only_if_empty: bool) -> bool {
        let mut slot = self.lock_slot();
        if only_if_empty && !self.state.is_empty() {
            return false;
        }

        slot.running = false;
        slot.handle = None;
        if phase == Phase::Idle {
            let mut poll = self.lock_poll();
            poll.cursor = Cursor::default();
            poll.stored_timetoken = None;
        }
        self.set_phase(phase);
        self.heartbeat.stop_coupled();

        #[cfg(feature = "tracing")]
        tracing::debug!(%phase, "subscribe loop stopped");

        true
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut epoch_rx = self.epoch.subscribe();

        loop {
            if token.is_cancelled() {
                return self.shutdown().await;
            }
            if self.retire(Phase::Idle, true) {
                return;
            }

            let epoch = *epoch_rx.borrow_and_update();
            let request = self.poll_request();
            self.set_phase(Phase::Polling);
            // No-op while a run is alive; revives one lost during recovery or an empty spell.
            self.heartbeat.start(HeartbeatMode::Coupled);

            #[cfg(feature = "tracing")]
            tracing::trace!(
                timetoken = request.timetoken,
                channels = ?request.channels,
                groups = ?request.channel_groups,
                "polling"
            );

            let result = tokio::select! {
                biased;

                () = token.cancelled() => return self.shutdown().await,
                _ = epoch_rx.changed() => continue,
                result = self.api.subscribe(&request, &token) => result,
            };

            match result {
                Ok(envelope) => self.handle_envelope(envelope, &request, epoch).await,
                Err(e) if e.kind() == Kind::Cancellation => return self.shutdown().await,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("subscribe failed: {e}");

                    let last = self.lock_poll().cursor.timetoken;
                    let status = PnStatus::from_error(&e, OperationType::Subscribe)
                        .with_entities(request.channels, request.channel_groups)
                        .with_timetokens(last, last);
                    self.dispatcher.status(status).await;

                    if !self.recover(&token, &mut epoch_rx).await {
                        return;
                    }
                }
            }
        }
    }

    /// Wait for connectivity after a failed poll. Returns `false` when the loop must stop.
    async fn recover(
        &self,
        token: &CancellationToken,
        epoch_rx: &mut watch::Receiver<u64>,
    ) -> bool {
        if self.api.config().reconnection_policy == ReconnectionPolicy::None {
            self.retire(Phase::Stopped, false);
            return false;
        }

        self.set_phase(Phase::Reconnecting);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exhausted = tx.clone();
        self.reconnection.start(
            move || {
                _ = tx.send(Recovery::Reconnected);
            },
            move || {
                _ = exhausted.send(Recovery::Exhausted);
            },
        );

        loop {
            let recovery = tokio::select! {
                biased;

                () = token.cancelled() => {
                    self.shutdown().await;
                    return false;
                }
                _ = epoch_rx.changed() => {
                    if self.state.is_empty() {
                        self.reconnection.stop();
                        return true;
                    }
                    continue;
                }
                recovery = rx.recv() => recovery,
            };

            match recovery {
                Some(Recovery::Reconnected) => {
                    self.mark_reconnected();
                    return true;
                }
                Some(Recovery::Exhausted) => {
                    let status = PnStatus::new(
                        StatusCategory::ReconnectionAttemptsExhausted,
                        OperationType::Subscribe,
                    )
                    .with_entities(
                        self.state.prepare_channel_list(true),
                        self.state.prepare_group_list(true),
                    );
                    self.dispatcher.status(status).await;
                    self.retire(Phase::Stopped, false);
                    return false;
                }
                // The probe was stopped by a manual reconnect.
                None => return true,
            }
        }
    }

    async fn handle_envelope(
        &self,
        envelope: SubscribeEnvelope,
        request: &PollRequest,
        epoch: u64,
    ) {
        self.heartbeat.record_poll();
        let current_epoch = *self.epoch.borrow();
        let threshold = self.api.config().request_message_count_threshold;

        let connected = {
            let mut poll = self.lock_poll();
            let last = poll.cursor.timetoken;
            let mut cursor = envelope.cursor;
            let fresh = epoch == current_epoch;

            if request.timetoken == 0 && fresh {
                if let Some(stored) = poll.stored_timetoken.take() {
                    cursor.timetoken = stored;
                }
                poll.handshake = false;
            }
            poll.cursor = cursor;

            if fresh && !poll.connected_announced {
                poll.connected_announced = true;
                let category = if std::mem::take(&mut poll.reconnected_pending) {
                    StatusCategory::Reconnected
                } else {
                    StatusCategory::Connected
                };
                Some(
                    PnStatus::new(category, OperationType::Subscribe)
                        .with_entities(request.channels.clone(), request.channel_groups.clone())
                        .with_timetokens(cursor.timetoken, last),
                )
            } else {
                None
            }
        };

        if let Some(status) = connected {
            self.dispatcher.status(status).await;
        }

        if threshold > 0 && envelope.messages.len() >= threshold {
            let status = PnStatus::new(
                StatusCategory::RequestMessageCountExceeded,
                OperationType::Subscribe,
            )
            .with_entities(request.channels.clone(), request.channel_groups.clone());
            self.dispatcher.status(status).await;
        }

        for item in envelope.messages {
            match StreamEvent::try_from(item) {
                Ok(StreamEvent::Message(message) | StreamEvent::Signal(message)) => {
                    self.dispatcher.dispatch(Event::Message(message)).await;
                }
                Ok(StreamEvent::Presence(presence)) => {
                    self.dispatcher.dispatch(Event::Presence(presence)).await;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("skipping undecodable stream entry: {e}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
    }

    fn poll_request(&self) -> PollRequest {
        let entities = self.state.entities(true);
        let poll = self.lock_poll();
        let (timetoken, region) = if poll.handshake {
            (0, None)
        } else {
            (
                poll.cursor.timetoken,
                Some(poll.cursor.region).filter(|region| *region != 0),
            )
        };

        PollRequest {
            channels: entities.channels,
            channel_groups: entities.channel_groups,
            timetoken,
            region,
            filter_expression: poll.filter_expression.clone(),
            state: entities.state,
        }
    }

    async fn shutdown(&self) {
        self.reconnection.stop();
        self.announce_cancelled().await;
        self.retire(Phase::Stopped, false);
    }

    async fn announce_cancelled(&self) {
        if self.cancelled_announced.swap(true, Ordering::SeqCst) {
            return;
        }

        let status = PnStatus::new(StatusCategory::Cancelled, OperationType::Subscribe)
            .with_entities(
                self.state.prepare_channel_list(true),
                self.state.prepare_group_list(true),
            );
        self.dispatcher.status(status).await;
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }

    fn lock_poll(&self) -> MutexGuard<'_, PollState> {
        self.poll.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self) -> MutexGuard<'_, LoopSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
