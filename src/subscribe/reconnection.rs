#![expect(
    clippy::module_name_repetitions,
    reason = "Reconnection types deliberately include the module name for clarity"
)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::Api;
use crate::config::PolicyBackoff;
use crate::error::Kind;

struct Run {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The live run, if any, and the failure counter owned by the latest run.
#[derive(Default)]
struct Slot {
    run: Option<Run>,
    failed_calls: Arc<AtomicU32>,
}

/// Probes the time endpoint after a failure until it answers or the retry ceiling is hit.
///
/// At most one probe task exists at a time; starting again replaces the previous run and
/// clears its counters.
pub struct ReconnectionManager {
    api: Api,
    root: CancellationToken,
    slot: Mutex<Slot>,
}

impl ReconnectionManager {
    pub(crate) fn new(api: Api, root: CancellationToken) -> Self {
        Self {
            api,
            root,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Start probing. `on_reconnect` runs after the first successful probe, `on_exhausted`
    /// once `maximum_reconnection_retries` probes have failed. Neither runs with the `None`
    /// policy.
    pub(crate) fn start<R, E>(&self, on_reconnect: R, on_exhausted: E)
    where
        R: FnOnce() + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let mut slot = self.lock();
        if let Some(previous) = slot.run.take() {
            previous.token.cancel();
            previous.handle.abort();
        }
        // A run that is still unwinding keeps counting into its own counter.
        slot.failed_calls = Arc::new(AtomicU32::new(0));

        if self.root.is_cancelled() {
            return;
        }

        let backoff = PolicyBackoff::from(self.api.config());
        let Some(initial_delay) = backoff.initial_delay() else {
            #[cfg(feature = "tracing")]
            tracing::debug!("reconnection policy is none, waiting for a manual reconnect");
            return;
        };

        let token = self.root.child_token();
        let handle = tokio::spawn(probe(
            self.api.clone(),
            backoff,
            initial_delay,
            Arc::clone(&slot.failed_calls),
            token.clone(),
            on_reconnect,
            on_exhausted,
        ));

        slot.run = Some(Run { token, handle });
    }

    pub(crate) fn stop(&self) {
        if let Some(run) = self.lock().run.take() {
            run.token.cancel();
            run.handle.abort();
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock()
            .run
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Probes that failed during the latest run.
    #[must_use]
    pub fn failed_calls(&self) -> u32 {
        self.lock().failed_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn probe<R, E>(
    api: Api,
    mut backoff: PolicyBackoff,
    initial_delay: Duration,
    failed_calls: Arc<AtomicU32>,
    token: CancellationToken,
    on_reconnect: R,
    on_exhausted: E,
) where
    R: FnOnce() + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    let max_retries = api.config().max_retries();
    let mut delay = initial_delay;

    loop {
        tokio::select! {
            biased;

            () = token.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        match api.time(&token).await {
            Ok(_) => {
                #[cfg(feature = "tracing")]
                tracing::info!("network is reachable again");
                on_reconnect();
                return;
            }
            Err(e) if e.kind() == Kind::Cancellation => return,
            Err(e) => {
                let failed = failed_calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);

                #[cfg(feature = "tracing")]
                tracing::warn!(failed, "reconnection probe failed: {e}");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;

                if max_retries.is_some_and(|max| failed >= max) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(failed, "reconnection attempts exhausted");
                    on_exhausted();
                    return;
                }

                match backoff.next_backoff() {
                    Some(next) => delay = next,
                    None => return,
                }
            }
        }
    }
}
