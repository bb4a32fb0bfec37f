use http::{Response, StatusCode};

use crate::body::ResponseBody;

/// Every failure the engine can produce, session-level and transport-level
/// alike. Each variant maps to an HTTP status code, and its `Display`
/// rendering is the reason phrase returned to the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    // Request classification
    #[error("Invalid server path")]
    InvalidServerPath,
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Missing mandatory query parameters `EIO` and `transport`")]
    MissingQueryParameters,
    #[error("Protocol version is invalid")]
    ProtocolVersionInvalid,
    #[error("Protocol version is not supported")]
    ProtocolVersionUnsupported,
    #[error("Unknown transport")]
    TransportUnknown,
    #[error("Transport is not available on this server")]
    TransportUnavailable,
    #[error("Session identifier is required")]
    SessionIdRequired,
    #[error("Invalid session identifier")]
    InvalidSessionId,
    #[error("Transport does not match the transport of the session")]
    TransportMismatch,
    #[error("Upgrade requests must reference an existing session")]
    UpgradeRequestUnexpected,

    // Session
    #[error("Did not respond to a heartbeat in time")]
    HeartbeatTimedOut,
    #[error("Heartbeat was not expected at this time")]
    HeartbeatUnexpected,
    #[error("Received an illegal packet")]
    PacketIllegal,
    #[error("Connection closed forcefully")]
    ClosedForcefully,
    #[error("Closure requested by the client")]
    RequestedClosure,
    #[error("Server is closing")]
    ServerClosing,

    // Upgrade
    #[error("Upgrade to the requested transport is not allowed")]
    UpgradeCourseNotAllowed,
    #[error("Upgrade request is invalid")]
    UpgradeRequestInvalid,
    #[error("An upgrade is already in progress")]
    UpgradeAlreadyInitiated,
    #[error("No upgrade is underway")]
    UpgradeNotUnderway,
    #[error("Upgrade did not complete in time")]
    UpgradeTimedOut,
    #[error("Transport has already been probed")]
    TransportAlreadyProbed,
    #[error("Transport has not been probed")]
    TransportNotProbed,
    #[error("Transport has already been upgraded")]
    TransportAlreadyUpgraded,
    #[error("Transport is the origin of the upgrade")]
    TransportIsOrigin,
    #[error("Connection closed while an upgrade was in progress")]
    ConnectionClosedDuringUpgrade,

    // Polling transport
    #[error("A GET request is already in flight")]
    DuplicateGetRequest,
    #[error("A POST request is already in flight")]
    DuplicatePostRequest,
    #[error("Failed to read the request body")]
    ReadingBodyFailed,
    #[error("Request body length does not match the declared Content-Length")]
    ContentLengthDisparity,
    #[error("Maximum payload length exceeded")]
    ContentLengthLimitExceeded,
    #[error("Request body is not valid UTF-8")]
    DecodingBodyFailed,
    #[error("Request body contains one or more invalid packets")]
    DecodingPacketsFailed,
    #[error("Detected content type differs from the implicit content type")]
    ContentTypeDifferentToImplicit,
    #[error("Detected content type differs from the specified content type")]
    ContentTypeDifferentToSpecified,

    // WebSocket transport
    #[error("Packet could not be decoded")]
    DecodingPacketFailed,
    #[error("Unknown data frame type")]
    UnknownDataType,
    #[error("Transport is closed")]
    TransportClosed,
    #[error("Outbound packet buffer is full")]
    SendBufferFull,

    #[error("Failed to build an http response")]
    ResponseBuildFailed,
}

impl EngineError {
    /// The HTTP status code this failure maps to on the offending request.
    pub fn status_code(&self) -> StatusCode {
        use EngineError::*;
        match self {
            RequestedClosure => StatusCode::OK,
            InvalidServerPath
            | ProtocolVersionUnsupported
            | TransportUnavailable => StatusCode::FORBIDDEN,
            MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ContentLengthLimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            ConnectionClosedDuringUpgrade
            | ServerClosing
            | SendBufferFull
            | ResponseBuildFailed => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code().is_success()
    }

    /// Whether this failure must tear the whole session down rather than
    /// only answering the offending request.
    pub(crate) fn is_fatal(&self) -> bool {
        use EngineError::*;
        matches!(
            self,
            HeartbeatTimedOut
                | HeartbeatUnexpected
                | PacketIllegal
                | ClosedForcefully
                | ServerClosing
                | ConnectionClosedDuringUpgrade
        )
    }

    /// The RFC 6455 close code sent when this failure surfaces on a
    /// WebSocket. Failures without a specific mapping close with 1008
    /// (policy violation).
    pub(crate) fn ws_close_code(&self) -> u16 {
        use EngineError::*;
        match self {
            ServerClosing | ConnectionClosedDuringUpgrade | SendBufferFull => 1011,
            _ => 1008,
        }
    }
}

impl From<http::Error> for EngineError {
    fn from(_: http::Error) -> Self {
        EngineError::ResponseBuildFailed
    }
}

impl<B> From<EngineError> for Response<ResponseBody<B>> {
    fn from(err: EngineError) -> Self {
        Response::builder()
            .status(err.status_code())
            .header("Content-Type", "text/plain")
            .body(ResponseBody::custom_response(err.to_string().into()))
            .unwrap_or_else(|_| {
                let mut res = Response::new(ResponseBody::empty_response());
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            EngineError::RequestedClosure.status_code(),
            StatusCode::OK
        );
        assert!(EngineError::RequestedClosure.is_success());
        assert_eq!(
            EngineError::ContentLengthLimitExceeded.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            EngineError::ConnectionClosedDuringUpgrade.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            EngineError::InvalidServerPath.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            EngineError::HeartbeatTimedOut.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert!(!EngineError::HeartbeatTimedOut.is_success());
    }

    #[test]
    fn reason_phrases_are_stable() {
        assert_eq!(
            EngineError::InvalidSessionId.to_string(),
            "Invalid session identifier"
        );
        assert_eq!(
            EngineError::InvalidServerPath.to_string(),
            "Invalid server path"
        );
        assert_eq!(
            EngineError::MethodNotAllowed.to_string(),
            "Method not allowed"
        );
    }

    #[test]
    fn websocket_close_codes() {
        assert_eq!(EngineError::DecodingPacketFailed.ws_close_code(), 1008);
        assert_eq!(EngineError::UnknownDataType.ws_close_code(), 1008);
        assert_eq!(EngineError::ServerClosing.ws_close_code(), 1011);
    }
}
