#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Deeply nested uses in sub-modules are falsely flagged as being unused"
)]

use std::time::Duration;

use httpmock::MockServer;
use pubsub_client_sdk::config::Config;
use pubsub_client_sdk::subscribe::{Client, ListenerReceivers, PnStatus, StatusCategory};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const SUBSCRIBE_KEY: &str = "demo";
pub const UUID: &str = "test-client";

/// Long enough that a held poll never completes within a test.
pub const HOLD: Duration = Duration::from_secs(60);

const WAIT: Duration = Duration::from_secs(5);

#[must_use]
pub fn config() -> Config {
    Config::builder()
        .subscribe_key(SUBSCRIBE_KEY)
        .uuid(UUID)
        .build()
}

#[must_use]
pub fn client(server: &MockServer, config: Config) -> Client {
    Client::new(&server.base_url(), config).unwrap()
}

#[must_use]
pub fn subscribe_path(channels: &str) -> String {
    format!("/v2/subscribe/{SUBSCRIBE_KEY}/{channels}/0")
}

#[must_use]
pub fn presence_path(channels: &str, action: &str) -> String {
    format!("/v2/presence/sub-key/{SUBSCRIBE_KEY}/channel/{channels}/{action}")
}

/// Subscribe response carrying `messages` and pointing the cursor at `timetoken`.
#[must_use]
pub fn envelope(timetoken: u64, messages: Value) -> Value {
    json!({
        "t": { "t": timetoken.to_string(), "r": 1 },
        "m": messages
    })
}

#[must_use]
pub fn message(channel: &str, timetoken: u64, payload: Value) -> Value {
    json!({
        "a": "1",
        "f": 0,
        "c": channel,
        "d": payload,
        "p": { "t": timetoken.to_string(), "r": 1 },
        "k": SUBSCRIBE_KEY
    })
}

#[must_use]
pub fn presence_ok() -> Value {
    json!({ "status": 200, "message": "OK", "service": "Presence" })
}

pub async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("listener channel closed")
}

/// Next status of `category`, skipping anything announced before it.
pub async fn status(receivers: &mut ListenerReceivers, category: StatusCategory) -> PnStatus {
    loop {
        let status = recv(&mut receivers.status).await;
        if status.category == category {
            return status;
        }
    }
}
