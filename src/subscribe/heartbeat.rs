#![expect(
    clippy::module_name_repetitions,
    reason = "Heartbeat types deliberately include the module name for clarity"
)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use strum_macros::Display;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::listener::Dispatcher;
use super::state::StateManager;
use super::types::request::PresenceRequest;
use super::types::{OperationType, PnStatus, StatusCategory};
use crate::api::Api;
use crate::config::HeartbeatNotifications;
use crate::error::Kind;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum HeartbeatMode {
    /// Runs alongside the poll loop and skips beats a recent poll made redundant.
    Coupled,
    /// Fires on every tick, for presence without a subscribe loop.
    Independent,
}

struct Run {
    token: CancellationToken,
    mode: HeartbeatMode,
    generation: u64,
    handle: JoinHandle<()>,
}

impl Run {
    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Default)]
struct RunState {
    run: Option<Run>,
    generation: u64,
    last_poll: Option<Instant>,
    presence_channels: BTreeSet<String>,
    presence_groups: BTreeSet<String>,
}

/// Periodic presence heartbeat for the subscribed entities plus any presence-only ones.
///
/// Run bookkeeping sits behind its own lock, separate from [`StateManager`].
pub struct HeartbeatManager {
    api: Api,
    state: Arc<StateManager>,
    dispatcher: Dispatcher,
    root: CancellationToken,
    run_state: Mutex<RunState>,
}

impl HeartbeatManager {
    pub(crate) fn new(
        api: Api,
        state: Arc<StateManager>,
        dispatcher: Dispatcher,
        root: CancellationToken,
    ) -> Self {
        Self {
            api,
            state,
            dispatcher,
            root,
            run_state: Mutex::new(RunState::default()),
        }
    }

    /// Start the timer in `mode`. An independent run is never downgraded to a coupled one.
    pub(crate) fn start(self: &Arc<Self>, mode: HeartbeatMode) {
        let Some(period) = self.api.config().heartbeat_period() else {
            return;
        };
        if self.root.is_cancelled() {
            return;
        }

        let mut run_state = self.lock();
        if let Some(run) = run_state.run.as_ref().filter(|run| run.is_active()) {
            if run.mode == HeartbeatMode::Independent || mode == HeartbeatMode::Coupled {
                return;
            }
            run.token.cancel();
        }

        run_state.generation = run_state.generation.wrapping_add(1);
        let generation = run_state.generation;
        let token = self.root.child_token();
        let handle = tokio::spawn(Arc::clone(self).beat_loop(
            mode,
            generation,
            period,
            token.clone(),
        ));

        #[cfg(feature = "tracing")]
        tracing::debug!(%mode, ?period, "heartbeat started");

        run_state.run = Some(Run {
            token,
            mode,
            generation,
            handle,
        });
    }

    /// Stop a coupled run; an independent run keeps going.
    pub(crate) fn stop_coupled(&self) {
        if let Some(run) = self
            .lock()
            .run
            .take_if(|run| run.mode == HeartbeatMode::Coupled)
        {
            run.token.cancel();
        }
    }

    /// Stop the timer whatever its state. Safe to call before it was ever started.
    pub fn destroy(&self) {
        if let Some(run) = self.lock().run.take() {
            run.token.cancel();
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().run.as_ref().is_some_and(Run::is_active)
    }

    #[must_use]
    pub fn mode(&self) -> Option<HeartbeatMode> {
        self.lock()
            .run
            .as_ref()
            .filter(|run| run.is_active())
            .map(|run| run.mode)
    }

    pub(crate) fn record_poll(&self) {
        self.lock().last_poll = Some(Instant::now());
    }

    /// Add entities announced without subscribing.
    pub(crate) fn add_presence(&self, channels: &[String], groups: &[String]) {
        let mut run_state = self.lock();
        run_state.presence_channels.extend(channels.iter().cloned());
        run_state.presence_groups.extend(groups.iter().cloned());
    }

    /// Remove presence-only entities; returns `true` if some remain.
    pub(crate) fn remove_presence(&self, channels: &[String], groups: &[String]) -> bool {
        let mut run_state = self.lock();
        for name in channels {
            run_state.presence_channels.remove(name);
        }
        for name in groups {
            run_state.presence_groups.remove(name);
        }
        !(run_state.presence_channels.is_empty() && run_state.presence_groups.is_empty())
    }

    async fn beat_loop(
        self: Arc<Self>,
        mode: HeartbeatMode,
        generation: u64,
        period: Duration,
        token: CancellationToken,
    ) {
        let tolerance = self.api.config().heartbeat_skip_tolerance;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if mode == HeartbeatMode::Coupled {
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                biased;

                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if mode == HeartbeatMode::Coupled {
                let slack = self.slack(period);
                if slack > tolerance {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(?slack, "recent poll, postponing heartbeat");

                    tokio::select! {
                        biased;

                        () = token.cancelled() => break,
                        () = tokio::time::sleep(slack) => {}
                    }
                }
            }

            let request = self.request();
            if request.is_empty() {
                self.retire(mode, generation);
                break;
            }

            if !self.beat(&request, &token).await {
                break;
            }
        }
    }

    /// Returns `false` once the run was cancelled.
    async fn beat(&self, request: &PresenceRequest, token: &CancellationToken) -> bool {
        let notifications = self.api.config().heartbeat_notifications;

        match self.api.heartbeat(request, token).await {
            Ok(_) => {
                if notifications == HeartbeatNotifications::All {
                    let status =
                        PnStatus::new(StatusCategory::Acknowledgment, OperationType::Heartbeat)
                            .with_entities(request.channels.clone(), request.channel_groups.clone());
                    self.dispatcher.status(status).await;
                }
                true
            }
            Err(e) if e.kind() == Kind::Cancellation => false,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("heartbeat failed: {e}");

                if notifications != HeartbeatNotifications::None {
                    let mut status = PnStatus::from_error(&e, OperationType::Heartbeat)
                        .with_entities(request.channels.clone(), request.channel_groups.clone());
                    status.category = StatusCategory::BadRequest;
                    status.error = true;
                    self.dispatcher.status(status).await;
                }
                true
            }
        }
    }

    /// Subscribed entities merged with presence-only ones, plus the state payload.
    ///
    /// The presence-only sets are copied out before [`StateManager`] is read, so the two
    /// locks are never held together.
    fn request(&self) -> PresenceRequest {
        let (mut channels, mut groups) = {
            let run_state = self.lock();
            (
                run_state.presence_channels.clone(),
                run_state.presence_groups.clone(),
            )
        };
        let entities = self.state.entities(false);

        channels.extend(entities.channels);
        groups.extend(entities.channel_groups);

        PresenceRequest {
            channels: channels.into_iter().collect(),
            channel_groups: groups.into_iter().collect(),
            state: entities.state,
        }
    }

    /// Drop the run of `generation` after it found nothing to announce. Entities added in
    /// the meantime start a fresh run, since `start` saw this one still active.
    fn retire(self: &Arc<Self>, mode: HeartbeatMode, generation: u64) {
        let retired = self
            .lock()
            .run
            .take_if(|run| run.generation == generation)
            .is_some();

        #[cfg(feature = "tracing")]
        tracing::debug!("nothing to announce, heartbeat stopped");

        if retired && !self.request().is_empty() {
            self.start(mode);
        }
    }

    fn slack(&self, period: Duration) -> Duration {
        self.lock()
            .last_poll
            .map_or(Duration::ZERO, |last| period.saturating_sub(last.elapsed()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.run_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;
    use url::Url;

    use super::*;
    use crate::config::Config;
    use crate::error::StatusCode;
    use crate::subscribe::listener::{Listener, ListenerManager, ListenerReceivers};
    use crate::transport::testing::{Reply, ScriptedTransport};
    use crate::types::State;

    const OK: &str = r#"{"status":200,"message":"OK","service":"Presence"}"#;

    struct Harness {
        manager: Arc<HeartbeatManager>,
        state: Arc<StateManager>,
        requests: mpsc::UnboundedReceiver<Url>,
        listener: ListenerReceivers,
    }

    fn harness(config: Config, fallback: Reply) -> Harness {
        let (transport, requests) = ScriptedTransport::new();
        transport.route("/heartbeat", Vec::new(), fallback);
        let api = Api::new(
            Url::parse("http://localhost").unwrap(),
            Arc::new(config),
            Arc::new(transport),
        );
        let listeners = Arc::new(ListenerManager::new());
        let (listener, receivers) = Listener::channel(16);
        listeners.add_listener(listener);
        let dispatcher = Dispatcher::spawn(listeners, 16);
        let state = Arc::new(StateManager::new());

        Harness {
            manager: Arc::new(HeartbeatManager::new(
                api,
                Arc::clone(&state),
                dispatcher,
                CancellationToken::new(),
            )),
            state,
            requests,
            listener: receivers,
        }
    }

    fn config(interval: u32) -> Config {
        Config::builder()
            .subscribe_key("demo")
            .heartbeat_interval(interval)
            .build()
    }

    fn drain(requests: &mut mpsc::UnboundedReceiver<Url>) -> Vec<Url> {
        let mut urls = Vec::new();
        while let Ok(url) = requests.try_recv() {
            urls.push(url);
        }
        urls
    }

    fn subscribe(state: &StateManager, channel: &str) {
        state.subscribe(&[channel.to_owned()], &[], None, false);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_fires_every_tick() {
        let mut h = harness(config(5), Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Independent);
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let urls = drain(&mut h.requests);
        assert_eq!(urls.len(), 3);
        assert_eq!(
            urls[0].path(),
            "/v2/presence/sub-key/demo/channel/a/heartbeat"
        );
        assert_eq!(h.manager.mode(), Some(HeartbeatMode::Independent));
    }

    #[tokio::test(start_paused = true)]
    async fn coupled_waits_one_period() {
        let mut h = harness(config(30), Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Coupled);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(drain(&mut h.requests).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(drain(&mut h.requests).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coupled_postpones_after_recent_poll() {
        let mut h = harness(config(30), Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Coupled);
        tokio::time::sleep(Duration::from_secs(25)).await;
        h.manager.record_poll();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(drain(&mut h.requests).is_empty());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(drain(&mut h.requests).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_itself_when_nothing_is_subscribed() {
        let mut h = harness(config(5), Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Independent);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut h.requests).len(), 1);

        h.state.unsubscribe(&["a".to_owned()], &[]);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(!h.manager.is_running());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut h.requests).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_announced_and_timer_keeps_running() {
        let mut h = harness(
            config(5),
            Reply::Json(StatusCode::INTERNAL_SERVER_ERROR, "boom".to_owned()),
        );
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Independent);
        let status = h.listener.status.recv().await.unwrap();

        assert_eq!(status.category, StatusCategory::BadRequest);
        assert_eq!(status.operation, OperationType::Heartbeat);
        assert_eq!(status.status_code, Some(500));
        assert_eq!(status.affected_channels, vec!["a".to_owned()]);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(h.manager.is_running());
        assert_eq!(drain(&mut h.requests).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn all_notifications_acknowledge_success() {
        let config = Config::builder()
            .subscribe_key("demo")
            .heartbeat_interval(5)
            .heartbeat_notifications(HeartbeatNotifications::All)
            .build();
        let mut h = harness(config, Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Independent);
        let status = h.listener.status.recv().await.unwrap();

        assert_eq!(status.category, StatusCategory::Acknowledgment);
        assert!(!status.error);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_without_period() {
        let mut h = harness(config(0), Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Independent);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!h.manager.is_running());
        assert!(drain(&mut h.requests).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_safe_in_any_state() {
        let mut h = harness(config(5), Reply::ok(OK));
        h.manager.destroy();

        subscribe(&h.state, "a");
        h.manager.start(HeartbeatMode::Independent);
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.manager.destroy();
        h.manager.destroy();
        drain(&mut h.requests);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!h.manager.is_running());
        assert!(drain(&mut h.requests).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn presence_only_entities_are_announced() {
        let mut h = harness(config(5), Reply::ok(OK));
        h.manager.add_presence(&["lobby".to_owned()], &["g".to_owned()]);
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Independent);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let urls = drain(&mut h.requests);
        assert_eq!(
            urls[0].path(),
            "/v2/presence/sub-key/demo/channel/a,lobby/heartbeat"
        );
        assert!(urls[0].query().unwrap().contains("channel-group=g"));

        assert!(!h.manager.remove_presence(&["lobby".to_owned()], &["g".to_owned()]));
    }

    #[tokio::test]
    async fn request_merges_subscribed_and_presence_only_entities() {
        let h = harness(config(5), Reply::ok(OK));
        h.manager
            .add_presence(&["lobby".to_owned(), "a".to_owned()], &[]);
        let mut mood = State::new();
        mood.insert("mood".to_owned(), json!("ok"));
        h.state
            .subscribe(&["a".to_owned()], &["g".to_owned()], Some(&mood), false);

        let request = h.manager.request();

        assert_eq!(request.channels, vec!["a".to_owned(), "lobby".to_owned()]);
        assert_eq!(request.channel_groups, vec!["g".to_owned()]);
        assert_eq!(request.state.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn coupled_run_comes_back_after_stopping_itself() {
        let mut h = harness(config(5), Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Coupled);
        h.state.unsubscribe(&["a".to_owned()], &[]);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(!h.manager.is_running());

        subscribe(&h.state, "b");
        h.manager.start(HeartbeatMode::Coupled);
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        let urls = drain(&mut h.requests);
        assert_eq!(urls.len(), 1);
        assert_eq!(
            urls[0].path(),
            "/v2/presence/sub-key/demo/channel/b/heartbeat"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn coupled_request_does_not_replace_independent_run() {
        let h = harness(config(5), Reply::ok(OK));
        subscribe(&h.state, "a");

        h.manager.start(HeartbeatMode::Independent);
        h.manager.start(HeartbeatMode::Coupled);
        h.manager.stop_coupled();

        assert_eq!(h.manager.mode(), Some(HeartbeatMode::Independent));

        h.manager.destroy();
        h.manager.start(HeartbeatMode::Coupled);
        h.manager.start(HeartbeatMode::Independent);
        assert_eq!(h.manager.mode(), Some(HeartbeatMode::Independent));
    }
}
