//! Endpoint calls used by the managers: subscribe, heartbeat, leave and time.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret as _;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::error::Error;
use crate::subscribe::types::request::{
    HeartbeatQuery, LeaveQuery, PollRequest, PresenceRequest, SubscribeQuery, TimeQuery,
    encode_state, join_groups,
};
use crate::subscribe::types::response::{PresenceResponse, SubscribeEnvelope};
use crate::transport::Transport;
use crate::types::Timetoken;
use crate::{Result, ToQueryParams};

#[derive(Clone)]
pub(crate) struct Api {
    transport: Arc<dyn Transport>,
    config: Arc<Config>,
    origin: Url,
}

impl Api {
    pub(crate) fn new(origin: Url, config: Arc<Config>, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config,
            origin,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) async fn subscribe(
        &self,
        request: &PollRequest,
        token: &CancellationToken,
    ) -> Result<SubscribeEnvelope> {
        let query = SubscribeQuery {
            uuid: &self.config.uuid,
            auth: self.auth(),
            tt: request.timetoken,
            tr: request.region.filter(|region| *region != 0),
            channel_group: join_groups(&request.channel_groups),
            heartbeat: self.presence_timeout(),
            filter_expr: request.filter_expression.as_deref(),
            state: encode_state(&request.state),
        };
        let url = self.url(
            &[
                "v2",
                "subscribe",
                &self.config.subscribe_key,
                &join_channels(&request.channels),
                "0",
            ],
            &query,
        )?;

        self.get(url, self.config.subscribe_request_timeout, token)
            .await
    }

    pub(crate) async fn heartbeat(
        &self,
        request: &PresenceRequest,
        token: &CancellationToken,
    ) -> Result<PresenceResponse> {
        let query = HeartbeatQuery {
            uuid: &self.config.uuid,
            auth: self.auth(),
            heartbeat: self.presence_timeout(),
            channel_group: join_groups(&request.channel_groups),
            state: encode_state(&request.state),
        };
        let url = self.presence_url(&request.channels, "heartbeat", &query)?;

        self.get(url, self.config.non_subscribe_request_timeout, token)
            .await
    }

    pub(crate) async fn leave(
        &self,
        request: &PresenceRequest,
        token: &CancellationToken,
    ) -> Result<PresenceResponse> {
        let query = LeaveQuery {
            uuid: &self.config.uuid,
            auth: self.auth(),
            channel_group: join_groups(&request.channel_groups),
        };
        let url = self.presence_url(&request.channels, "leave", &query)?;

        self.get(url, self.config.non_subscribe_request_timeout, token)
            .await
    }

    /// Current server timetoken; doubles as the reachability probe.
    pub(crate) async fn time(&self, token: &CancellationToken) -> Result<Timetoken> {
        let query = TimeQuery {
            uuid: &self.config.uuid,
            auth: self.auth(),
        };
        let url = self.url(&["time", "0"], &query)?;

        let (timetoken,): (Timetoken,) = self
            .get(url, self.config.non_subscribe_request_timeout, token)
            .await?;
        Ok(timetoken)
    }

    fn auth(&self) -> Option<&str> {
        self.config
            .auth_key
            .as_ref()
            .map(|key| key.expose_secret())
    }

    fn presence_timeout(&self) -> Option<u32> {
        (self.config.presence_timeout > 0).then_some(self.config.presence_timeout)
    }

    fn presence_url(
        &self,
        channels: &[String],
        action: &str,
        query: &impl ToQueryParams,
    ) -> Result<Url> {
        self.url(
            &[
                "v2",
                "presence",
                "sub-key",
                &self.config.subscribe_key,
                "channel",
                &join_channels(channels),
                action,
            ],
            query,
        )
    }

    fn url(&self, segments: &[&str], query: &impl ToQueryParams) -> Result<Url> {
        let mut url = self.origin.clone();
        url.path_segments_mut()
            .map_err(|()| Error::validation(format!("{} cannot be a base URL", self.origin)))?
            .pop_if_empty()
            .extend(segments);

        let params = query.query_params();
        url.set_query((!params.is_empty()).then_some(params.as_str()));

        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<T> {
        tokio::select! {
            biased;

            () = token.cancelled() => Err(Error::cancelled()),
            result = crate::request(self.transport.as_ref(), url, timeout) => result,
        }
    }
}

/// Comma-joined channel list for the path, `,` when there are none.
fn join_channels(channels: &[String]) -> String {
    if channels.is_empty() {
        ",".to_owned()
    } else {
        channels.join(",")
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::error::Kind;
    use crate::transport::testing::{Reply, ScriptedTransport};
    use crate::types::State;

    fn api(transport: ScriptedTransport, config: Config) -> Api {
        Api::new(
            Url::parse("http://localhost:8080").unwrap(),
            Arc::new(config),
            Arc::new(transport),
        )
    }

    fn config() -> Config {
        Config::builder().subscribe_key("demo").uuid("me").build()
    }

    #[tokio::test]
    async fn subscribe_builds_catch_up_url() {
        let (transport, mut requests) = ScriptedTransport::new();
        transport.route(
            "/v2/subscribe",
            vec![Reply::ok(r#"{"t":{"t":"15","r":3},"m":[]}"#)],
            Reply::Hang,
        );
        let api = api(transport, config());
        let request = PollRequest {
            channels: vec!["a".to_owned(), "a-pnpres".to_owned()],
            channel_groups: Vec::new(),
            timetoken: 0,
            region: None,
            filter_expression: None,
            state: State::new(),
        };

        let envelope = api
            .subscribe(&request, &CancellationToken::new())
            .await
            .unwrap();

        let url = requests.recv().await.unwrap();
        assert_eq!(url.path(), "/v2/subscribe/demo/a,a-pnpres/0");
        assert_eq!(url.query(), Some("uuid=me&tt=0"));
        assert_eq!(envelope.cursor.timetoken, 15);
        assert_eq!(envelope.cursor.region, 3);
    }

    #[tokio::test]
    async fn subscribe_sends_cursor_groups_and_state() {
        let (transport, mut requests) = ScriptedTransport::new();
        transport.route(
            "/v2/subscribe",
            vec![Reply::ok(r#"{"t":{"t":"16","r":3},"m":[]}"#)],
            Reply::Hang,
        );
        let config = Config::builder()
            .subscribe_key("demo")
            .uuid("me")
            .presence_timeout(120)
            .auth_key(SecretString::from("token".to_owned()))
            .build();
        let api = api(transport, config);
        let mut state = State::new();
        state.insert("g".to_owned(), json!({ "x": 1 }));
        let request = PollRequest {
            channels: Vec::new(),
            channel_groups: vec!["g".to_owned()],
            timetoken: 15,
            region: Some(3),
            filter_expression: Some("a==1".to_owned()),
            state,
        };

        api.subscribe(&request, &CancellationToken::new())
            .await
            .unwrap();

        let url = requests.recv().await.unwrap();
        assert_eq!(url.path(), "/v2/subscribe/demo/,/0");
        assert_eq!(
            url.query(),
            Some(
                "uuid=me&auth=token&tt=15&tr=3&channel-group=g&heartbeat=120\
                 &filter-expr=a%3D%3D1&state=%7B%22g%22%3A%7B%22x%22%3A1%7D%7D"
            )
        );
    }

    #[tokio::test]
    async fn heartbeat_and_leave_urls() {
        let (transport, mut requests) = ScriptedTransport::new();
        let ok = r#"{"status":200,"message":"OK","service":"Presence"}"#;
        transport.route("/heartbeat", vec![Reply::ok(ok)], Reply::Hang);
        transport.route("/leave", vec![Reply::ok(ok)], Reply::Hang);
        let api = api(transport, config());
        let request = PresenceRequest {
            channels: vec!["a".to_owned(), "b".to_owned()],
            channel_groups: vec!["g".to_owned()],
            state: State::new(),
        };
        let token = CancellationToken::new();

        let response = api.heartbeat(&request, &token).await.unwrap();
        assert_eq!(response.status, 200);
        let url = requests.recv().await.unwrap();
        assert_eq!(
            url.path(),
            "/v2/presence/sub-key/demo/channel/a,b/heartbeat"
        );
        assert_eq!(url.query(), Some("uuid=me&channel-group=g"));

        api.leave(&request, &token).await.unwrap();
        let url = requests.recv().await.unwrap();
        assert_eq!(url.path(), "/v2/presence/sub-key/demo/channel/a,b/leave");
        assert_eq!(url.query(), Some("uuid=me&channel-group=g"));
    }

    #[tokio::test]
    async fn time_returns_first_element() {
        let (transport, mut requests) = ScriptedTransport::new();
        transport.route("/time/0", vec![Reply::ok("[17000000000000000]")], Reply::Hang);
        let api = api(transport, config());

        let timetoken = api.time(&CancellationToken::new()).await.unwrap();

        assert_eq!(timetoken, 17_000_000_000_000_000);
        assert_eq!(requests.recv().await.unwrap().path(), "/time/0");
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_call() {
        let (transport, _requests) = ScriptedTransport::new();
        let api = api(transport, config());
        let token = CancellationToken::new();
        token.cancel();

        let err = api.time(&token).await.unwrap_err();

        assert_eq!(err.kind(), Kind::Cancellation);
    }

    #[test]
    fn empty_channel_list_is_a_comma() {
        assert_eq!(join_channels(&[]), ",");
        assert_eq!(join_channels(&["a".to_owned()]), "a");
    }
}
