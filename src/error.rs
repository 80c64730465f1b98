use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to non-successful HTTP call
    Status,
    /// Caller supplied invalid arguments
    Validation,
    /// Transport or DNS failure before a response was received
    Connection,
    /// The transport gave up waiting for a response
    Timeout,
    /// The response body could not be decoded
    ResponseParsing,
    /// The client's cancellation token fired while the operation was pending
    Cancellation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn status<S: Into<String>>(status_code: StatusCode, path: String, message: S) -> Self {
        Status {
            status_code,
            path,
            message: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Cancelled.into()
    }

    /// HTTP status code of a [`Kind::Status`] error.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.downcast_ref::<Status>().map(|s| s.status_code)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: StatusCode,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) making GET call to {} with {}",
            self.status_code, self.path, self.message
        )
    }
}

impl StdError for Status {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled: the client is shutting down")
    }
}

impl StdError for Cancelled {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            Kind::Timeout
        } else if e.is_connect() || e.is_request() {
            Kind::Connection
        } else if e.is_decode() {
            Kind::ResponseParsing
        } else {
            Kind::Internal
        };
        Error::with_source(kind, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::ResponseParsing, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(Kind::Status, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Error::with_source(Kind::Cancellation, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_should_succeed() {
        let status = Status {
            status_code: StatusCode::FORBIDDEN,
            path: "/v2/subscribe/demo/a/0".to_owned(),
            message: "Forbidden".to_owned(),
        };

        assert_eq!(
            status.to_string(),
            "error(403 Forbidden) making GET call to /v2/subscribe/demo/a/0 with Forbidden"
        );
    }

    #[test]
    fn status_into_error_keeps_code() {
        let error = Error::status(StatusCode::BAD_REQUEST, "/time/0".to_owned(), "nope");

        assert_eq!(error.kind(), Kind::Status);
        assert_eq!(error.status_code(), Some(StatusCode::BAD_REQUEST));
        assert!(error.to_string().contains("nope"));
    }

    #[test]
    fn cancelled_has_cancellation_kind() {
        let error = Error::cancelled();

        assert_eq!(error.kind(), Kind::Cancellation);
        assert_eq!(error.status_code(), None);
    }

    #[test]
    fn json_error_is_response_parsing() {
        let e = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: Error = e.into();

        assert_eq!(error.kind(), Kind::ResponseParsing);
    }
}
