use strum_macros::Display;

use crate::error::{Error, Kind, StatusCode};
use crate::types::Timetoken;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StatusCategory {
    /// First successful poll after a membership change.
    Connected,
    /// First successful poll after connectivity was restored.
    Reconnected,
    Disconnected,
    Timeout,
    Cancelled,
    BadRequest,
    AccessDenied,
    ReconnectionAttemptsExhausted,
    /// A single poll returned at least `request_message_count_threshold` messages.
    RequestMessageCountExceeded,
    Acknowledgment,
    Unknown,
}

impl StatusCategory {
    /// Category reported for a failed operation.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error.kind() {
            Kind::Cancellation => Self::Cancelled,
            Kind::Timeout => Self::Timeout,
            Kind::Status => match error.status_code() {
                Some(StatusCode::BAD_REQUEST) => Self::BadRequest,
                Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => Self::AccessDenied,
                _ => Self::Disconnected,
            },
            Kind::ResponseParsing => Self::BadRequest,
            Kind::Connection => Self::Disconnected,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(
            self,
            Self::Connected
                | Self::Reconnected
                | Self::Acknowledgment
                | Self::RequestMessageCountExceeded
        )
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OperationType {
    Subscribe,
    Unsubscribe,
    Heartbeat,
    Presence,
    Time,
}

/// Status event handed to every listener.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct PnStatus {
    pub category: StatusCategory,
    pub operation: OperationType,
    pub error: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub affected_channels: Vec<String>,
    pub affected_channel_groups: Vec<String>,
    pub current_timetoken: Timetoken,
    pub last_timetoken: Timetoken,
}

impl PnStatus {
    #[must_use]
    pub fn new(category: StatusCategory, operation: OperationType) -> Self {
        Self {
            category,
            operation,
            error: category.is_error(),
            status_code: None,
            error_message: None,
            affected_channels: Vec::new(),
            affected_channel_groups: Vec::new(),
            current_timetoken: 0,
            last_timetoken: 0,
        }
    }

    /// Status describing a failed operation.
    #[must_use]
    pub fn from_error(error: &Error, operation: OperationType) -> Self {
        Self {
            status_code: error.status_code().map(|code| code.as_u16()),
            error_message: Some(error.to_string()),
            ..Self::new(StatusCategory::from_error(error), operation)
        }
    }

    #[must_use]
    pub fn with_entities(mut self, channels: Vec<String>, channel_groups: Vec<String>) -> Self {
        self.affected_channels = channels;
        self.affected_channel_groups = channel_groups;
        self
    }

    #[must_use]
    pub fn with_timetokens(mut self, current: Timetoken, last: Timetoken) -> Self {
        self.current_timetoken = current;
        self.last_timetoken = last;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(code: StatusCode) -> Error {
        Error::status(code, "/v2/subscribe/demo/a/0".to_owned(), "failed")
    }

    #[test]
    fn failures_map_to_categories() {
        let cases = [
            (Error::cancelled(), StatusCategory::Cancelled),
            (
                Error::with_source(Kind::Timeout, std::io::Error::other("slow")),
                StatusCategory::Timeout,
            ),
            (status_error(StatusCode::BAD_REQUEST), StatusCategory::BadRequest),
            (status_error(StatusCode::FORBIDDEN), StatusCategory::AccessDenied),
            (status_error(StatusCode::UNAUTHORIZED), StatusCategory::AccessDenied),
            (
                status_error(StatusCode::BAD_GATEWAY),
                StatusCategory::Disconnected,
            ),
            (
                Error::with_source(Kind::Connection, std::io::Error::other("refused")),
                StatusCategory::Disconnected,
            ),
            (
                Error::with_source(Kind::ResponseParsing, std::io::Error::other("bad")),
                StatusCategory::BadRequest,
            ),
            (Error::validation("empty"), StatusCategory::Unknown),
        ];

        for (error, expected) in cases {
            assert_eq!(StatusCategory::from_error(&error), expected, "{error}");
        }
    }

    #[test]
    fn error_status_carries_details() {
        let status = PnStatus::from_error(
            &status_error(StatusCode::FORBIDDEN),
            OperationType::Heartbeat,
        )
        .with_entities(vec!["a".to_owned()], Vec::new());

        assert_eq!(status.category, StatusCategory::AccessDenied);
        assert_eq!(status.operation, OperationType::Heartbeat);
        assert!(status.error);
        assert_eq!(status.status_code, Some(403));
        assert!(status.error_message.unwrap().contains("failed"));
        assert_eq!(status.affected_channels, vec!["a".to_owned()]);
    }

    #[test]
    fn connected_is_not_an_error() {
        let status = PnStatus::new(StatusCategory::Connected, OperationType::Subscribe)
            .with_timetokens(10, 5);

        assert!(!status.error);
        assert_eq!(status.current_timetoken, 10);
        assert_eq!(status.last_timetoken, 5);
    }
}
