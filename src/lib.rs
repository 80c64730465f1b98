#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub(crate) mod api;
pub mod config;
pub mod error;
pub(crate) mod serde_helpers;
pub mod subscribe;
pub mod transport;
pub mod types;

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::Error;
use crate::transport::Transport;

pub type Result<T> = std::result::Result<T, Error>;

/// Suffix appended to a channel or group name to address its presence stream.
pub const PRESENCE_SUFFIX: &str = "-pnpres";

/// Trait for converting request types to URL query parameters.
///
/// This trait is automatically implemented for all types that implement [`Serialize`].
/// It uses [`serde_html_form`] to serialize the struct fields into a query string.
pub trait ToQueryParams: Serialize {
    /// Converts the request to a URL-encoded query string without the leading `?`.
    ///
    /// Returns an empty string if no parameters are set.
    fn query_params(&self) -> String {
        serde_html_form::to_string(self)
            .inspect_err(|e| {
                #[cfg(feature = "tracing")]
                tracing::error!("Unable to convert to URL-encoded string {e:?}");
                #[cfg(not(feature = "tracing"))]
                let _: &serde_html_form::ser::Error = e;
            })
            .unwrap_or_default()
    }
}

impl<T: Serialize> ToQueryParams for T {}

#[cfg_attr(
    feature = "tracing",
    tracing::instrument(
        level = "debug",
        skip(transport, url),
        fields(path = url.path(), status_code)
    )
)]
async fn request<Response: DeserializeOwned>(
    transport: &dyn Transport,
    url: Url,
    timeout: Duration,
) -> Result<Response> {
    let path = url.path().to_owned();

    let response = transport.get(url, timeout).await?;
    let status_code = response.status;

    #[cfg(feature = "tracing")]
    tracing::Span::current().record("status_code", status_code.as_u16());

    if !status_code.is_success() {
        let message = String::from_utf8_lossy(&response.body).into_owned();

        #[cfg(feature = "tracing")]
        tracing::warn!(
            status = %status_code,
            path = %path,
            message = %message,
            "API request failed"
        );

        return Err(Error::status(status_code, path, message));
    }

    let json_value = serde_json::from_slice::<serde_json::Value>(&response.body)?;
    serde_helpers::deserialize_with_warnings(json_value)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde::Deserialize;

    use super::*;
    use crate::error::Kind;
    use crate::transport::testing::{Reply, ScriptedTransport};

    #[derive(Serialize)]
    struct Query<'a> {
        uuid: &'a str,
        #[serde(rename = "channel-group", skip_serializing_if = "Option::is_none")]
        channel_group: Option<&'a str>,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        status: u16,
    }

    fn url() -> Url {
        Url::parse("http://localhost/time/0").unwrap()
    }

    #[test]
    fn query_params_skip_absent_fields() {
        let query = Query {
            uuid: "client a",
            channel_group: None,
        };
        assert_eq!(query.query_params(), "uuid=client+a");

        let query = Query {
            uuid: "u",
            channel_group: Some("g1,g2"),
        };
        assert_eq!(query.query_params(), "uuid=u&channel-group=g1%2Cg2");
    }

    #[tokio::test]
    async fn request_decodes_success_body() {
        let (transport, _requests) = ScriptedTransport::new();
        transport.route("/time", vec![Reply::ok(r#"{"status":200}"#)], Reply::Hang);

        let payload: Payload = request(&transport, url(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(payload, Payload { status: 200 });
    }

    #[tokio::test]
    async fn request_maps_error_status() {
        let (transport, _requests) = ScriptedTransport::new();
        transport.route(
            "/time",
            vec![Reply::Json(StatusCode::FORBIDDEN, "denied".to_owned())],
            Reply::Hang,
        );

        let err = request::<Payload>(&transport, url(), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Kind::Status);
        assert_eq!(err.status_code(), Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn request_reports_malformed_body() {
        let (transport, _requests) = ScriptedTransport::new();
        transport.route("/time", vec![Reply::ok("{not json")], Reply::Hang);

        let err = request::<Payload>(&transport, url(), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Kind::ResponseParsing);
    }
}
