//! Error types and RTSP status codes.

use std::fmt;

/// RTSP reply status, including the private 57x/58x codes this server
/// emits for transport-negotiation and parameter-set failures.
///
/// The numeric value goes on the status line together with the
/// SCREAMING_SNAKE name, e.g. `RTSP/1.0 581 ERROR_MISSING_SPS`.
/// Protocol-level failures travel through the stack as `Status` values
/// and are rendered into a single error reply; the connection survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestUriTooLarge = 414,
    SessionNotFound = 454,
    MethodNotValidInThisState = 455,
    UnsupportedTransport = 461,
    InternalServerError = 500,
    RtspVersionNotSupported = 505,
    MissingFieldArg = 570,
    FieldTooLong = 571,
    BadPortSpec = 572,
    BadInterleavedSpec = 573,
    TcpWithPorts = 574,
    UdpNoPorts = 575,
    SupportUnicastOnly = 576,
    SessionIdTooLong = 578,
    ServerInErrorState = 579,
    SupportOnlySdp = 580,
    MissingSps = 581,
    ServerBufferOverflow = 582,
    ServerDateError = 583,
    UnsupportedEncoder = 584,
}

impl Status {
    /// Numeric wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Reason phrase written on the status line.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::RequestUriTooLarge => "REQUEST_URI_TOO_LARGE",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::MethodNotValidInThisState => "METHOD_NOT_VALID_IN_THIS_STATE",
            Self::UnsupportedTransport => "UNSUPPORTED_TRANSPORT",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::RtspVersionNotSupported => "RTSP_VERSION_NOT_SUPPORTED",
            Self::MissingFieldArg => "ERROR_MISSING_FIELD_ARG",
            Self::FieldTooLong => "ERROR_FIELD_TOO_LONG",
            Self::BadPortSpec => "ERROR_BAD_PORT_SPEC",
            Self::BadInterleavedSpec => "ERROR_BAD_INTERLEAVED_SPEC",
            Self::TcpWithPorts => "ERROR_TCP_WITH_PORTS",
            Self::UdpNoPorts => "ERROR_UDP_NO_PORTS",
            Self::SupportUnicastOnly => "ERROR_SUPPORT_UNICAST_ONLY",
            Self::SessionIdTooLong => "ERROR_SESSION_ID_TOO_LONG",
            Self::ServerInErrorState => "SERVER_IN_ERROR_STATE",
            Self::SupportOnlySdp => "ERROR_SUPPORT_ONLY_SDP",
            Self::MissingSps => "ERROR_MISSING_SPS",
            Self::ServerBufferOverflow => "SERVER_BUFFER_OVERFLOW",
            Self::ServerDateError => "SERVER_DATE_ERROR",
            Self::UnsupportedEncoder => "ERROR_UNSUPPORTED_ENCODER",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Errors surfaced by the server library.
///
/// [`Status`](Self::Status) carries a protocol failure that maps to an
/// RTSP error reply; [`Io`](Self::Io) carries a socket failure that tears
/// the affected connection down.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// RTSP protocol failure with its wire status.
    #[error("RTSP error: {0}")]
    Status(Status),
}

impl From<Status> for RtspError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_values() {
        assert_eq!(Status::Ok.code(), 200);
        assert_eq!(Status::SessionNotFound.code(), 454);
        assert_eq!(Status::TcpWithPorts.code(), 574);
        assert_eq!(Status::MissingSps.code(), 581);
        assert_eq!(Status::UnsupportedEncoder.code(), 584);
    }

    #[test]
    fn display_is_code_and_name() {
        assert_eq!(Status::Ok.to_string(), "200 OK");
        assert_eq!(Status::MissingSps.to_string(), "581 ERROR_MISSING_SPS");
        assert_eq!(
            Status::MethodNotValidInThisState.to_string(),
            "455 METHOD_NOT_VALID_IN_THIS_STATE"
        );
    }
}
