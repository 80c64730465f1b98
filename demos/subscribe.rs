//! Subscribes to a channel and logs everything the client delivers.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info cargo run --example subscribe --features tracing -- news
//! ```
//!
//! `PUBSUB_ORIGIN` and `PUBSUB_SUBSCRIBE_KEY` override the public demo endpoint.

use std::env;
use std::time::Duration;

use pubsub_client_sdk::config::{Config, HeartbeatNotifications, ReconnectionPolicy};
use pubsub_client_sdk::subscribe::{Client, Listener, StatusCategory, Subscription};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let origin = env::var("PUBSUB_ORIGIN").unwrap_or_else(|_| "https://ps.pndsn.com".to_owned());
    let subscribe_key = env::var("PUBSUB_SUBSCRIBE_KEY").unwrap_or_else(|_| "demo".to_owned());
    let channels: Vec<String> = env::args().skip(1).collect();
    let channels = if channels.is_empty() {
        vec!["news".to_owned()]
    } else {
        channels
    };

    let config = Config::builder()
        .subscribe_key(subscribe_key)
        .presence_timeout(60)
        .heartbeat_notifications(HeartbeatNotifications::All)
        .reconnection_policy(ReconnectionPolicy::Exponential)
        .maximum_reconnection_retries(5)
        .build();
    let client = Client::new(&origin, config)?;

    let timetoken = client.time().await?;
    info!(endpoint = "time", timetoken);

    let (listener, mut events) = Listener::channel(100);
    let id = client.add_listener(listener);
    info!(listener = %id, "listener registered");

    client.subscribe(
        Subscription::builder()
            .channels(channels.clone())
            .with_presence(true)
            .build(),
    )?;

    let run = async {
        loop {
            tokio::select! {
                Some(status) = events.status.recv() => {
                    if status.error {
                        warn!(category = %status.category, operation = %status.operation, message = ?status.error_message);
                    } else {
                        info!(category = %status.category, operation = %status.operation, channels = ?status.affected_channels);
                    }
                    if status.category == StatusCategory::ReconnectionAttemptsExhausted {
                        break;
                    }
                }
                Some(message) = events.message.recv() => {
                    info!(channel = %message.channel, timetoken = message.timetoken, kind = %message.kind, payload = %message.payload);
                }
                Some(presence) = events.presence.recv() => {
                    info!(channel = %presence.channel, event = %presence.event, uuid = ?presence.uuid, occupancy = presence.occupancy);
                }
                else => break,
            }
        }
    };

    if timeout(Duration::from_secs(60), run).await.is_err() {
        info!("no more events after 60s");
    }

    info!(cursor = ?client.cursor(), phase = ?client.phase());
    let channels: Vec<&str> = channels.iter().map(String::as_str).collect();
    client.unsubscribe(&channels, &[])?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.destroy();

    Ok(())
}
