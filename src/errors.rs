//! Error taxonomy shared by every driver, the codec pipeline, and the
//! WebSocket gateway.
//!
//! A flat, `Display`-via-`Debug` enum, widened to the categories the
//! server as a whole needs to distinguish: peer faults that are not
//! programmer bugs, size violations
//! that may be recovered by raising a limit, malformed-protocol faults,
//! pipeline/filter faults, and internal/fatal faults.

use crate::http::types::{StatusCode, Version};
use std::{error, fmt, io};

/// Peer-induced fault: disconnect, aborted stream, reset. Not a programmer
/// error; logged at `info` level and never surfaced to the handler as a panic.
#[derive(Debug)]
pub struct ClientException {
    pub message: &'static str,
}

impl ClientException {
    pub const fn new(message: &'static str) -> Self {
        Self { message }
    }
}

impl fmt::Display for ClientException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client exception: {}", self.message)
    }
}
impl error::Error for ClientException {}

/// Body or query exceeded a configured limit. Recoverable: the consumer may
/// raise `maxBodySize` and resume before the emitter gives up for good.
#[derive(Debug)]
pub struct ClientSizeException {
    pub limit: usize,
    pub observed: usize,
}

impl fmt::Display for ClientSizeException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client size exception: {} exceeds limit {}",
            self.observed, self.limit
        )
    }
}
impl error::Error for ClientSizeException {}

/// Malformed bytes or an illegal protocol state transition.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolError {
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    UnsupportedVersion,
    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    InvalidConnection,
    InvalidChunk,
    BodyTooLarge,
    Http2(Http2ErrorCode),
    WebSocketClose(u16),
}

/// HTTP/2 error codes, RFC 7540 §7.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
pub enum Http2ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl error::Error for ProtocolError {}

/// A middleware or codec filter raised. Distinguishes whether bytes have
/// already reached the wire (stream must abort) from the case where the
/// server may still substitute a generic 500.
#[derive(Debug)]
pub struct FilterException {
    pub filter_key: &'static str,
    pub flushed: bool,
}

impl fmt::Display for FilterException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter `{}` raised (flushed={})", self.filter_key, self.flushed)
    }
}
impl error::Error for FilterException {}

/// Programmer or environmental fault (deflate init failure, invalid
/// configuration). Logged at `error` level; response is 500.
#[derive(Debug)]
pub struct InternalError {
    pub message: String,
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal error: {}", self.message)
    }
}
impl error::Error for InternalError {}

/// Unrecoverable: acceptor failure on all ports. The server transitions to
/// `Stopping`.
#[derive(Debug)]
pub struct Fatal {
    pub message: String,
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.message)
    }
}
impl error::Error for Fatal {}

/// The umbrella error threaded through connection drivers; the pipeline
/// catches everything at the outermost boundary, and the driver catches
/// everything at the codec boundary, so nothing escapes into the event-loop
/// trampoline.
#[derive(Debug)]
pub enum ErrorKind {
    Protocol(ProtocolError),
    ClientGone(ClientException),
    Size(ClientSizeException),
    Filter(FilterException),
    Internal(InternalError),
    Fatal(Fatal),
    Io(IoError),
}

impl From<ProtocolError> for ErrorKind {
    fn from(e: ProtocolError) -> Self {
        ErrorKind::Protocol(e)
    }
}
impl From<ClientException> for ErrorKind {
    fn from(e: ClientException) -> Self {
        ErrorKind::ClientGone(e)
    }
}
impl From<ClientSizeException> for ErrorKind {
    fn from(e: ClientSizeException) -> Self {
        ErrorKind::Size(e)
    }
}
impl From<FilterException> for ErrorKind {
    fn from(e: FilterException) -> Self {
        ErrorKind::Filter(e)
    }
}
impl From<InternalError> for ErrorKind {
    fn from(e: InternalError) -> Self {
        ErrorKind::Internal(e)
    }
}
impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug)]
pub struct IoError(pub io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        impl ProtocolError {
            /// Renders the generic error body used for HTTP/1 responses
            /// when no bytes have flushed yet.
            pub fn as_http(&self, version: Version, json: bool) -> &'static [u8] {
                match (json, self, version) { $(
                    (true, Self::$name { .. }, Version::Http11) => concat!(
                        "HTTP/1.1 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: ", $len, "\r\n",
                        "content-type: application/json\r\n",
                        "\r\n",
                        $json
                    ),
                    (false, Self::$name { .. }, Version::Http11) => concat!(
                        "HTTP/1.1 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: 0\r\n\r\n",
                    ),
                    (true, Self::$name { .. }, Version::Http10) => concat!(
                        "HTTP/1.0 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: ", $len, "\r\n",
                        "content-type: application/json\r\n",
                        "\r\n",
                        $json
                    ),
                    (false, Self::$name { .. }, Version::Http10) => concat!(
                        "HTTP/1.0 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: 0\r\n\r\n",
                    ),
                )* _ => "HTTP/1.1 400 Bad Request\r\nconnection: close\r\ncontent-length: 0\r\n\r\n" }.as_bytes()
            }
        }
    };
}

http_errors! {
    InvalidMethod: "400 Bad Request", "55"
        => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
    InvalidUrl: "400 Bad Request", "51"
        => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
    InvalidVersion: "400 Bad Request", "57"
        => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
    UnsupportedVersion: "505 HTTP Version Not Supported", "67"
        => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;
    InvalidHeader: "400 Bad Request", "57"
        => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
    TooManyHeaders: "431 Request Header Fields Too Large", "54"
        => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
    InvalidContentLength: "400 Bad Request", "66"
        => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
    InvalidConnection: "400 Bad Request", "65"
        => r#"{"error":"Invalid Connection header","code":"INVALID_CONNECTION"}"#;
    InvalidChunk: "400 Bad Request", "58"
        => r#"{"error":"Invalid chunk encoding","code":"INVALID_CHUNK"}"#;
    BodyTooLarge: "413 Payload Too Large", "58"
        => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
}

impl ErrorKind {
    /// Renders the client-facing error response for any member of the
    /// taxonomy on HTTP/1; HTTP/2 and WebSocket drivers instead map these to
    /// GOAWAY/RST_STREAM and close codes respectively (see `http2::driver`
    /// and `websocket::gateway`).
    pub fn as_http(&self, version: Version, json: bool) -> Vec<u8> {
        match self {
            ErrorKind::Protocol(p) => p.as_http(version, json).to_vec(),
            ErrorKind::Size(_) => ProtocolError::BodyTooLarge.as_http(version, json).to_vec(),
            ErrorKind::ClientGone(_) => Vec::new(),
            ErrorKind::Filter(_) | ErrorKind::Internal(_) => {
                crate::http::response::make_generic_body(StatusCode::InternalServerError, version, json)
            }
            ErrorKind::Fatal(_) => {
                crate::http::response::make_generic_body(StatusCode::ServiceUnavailable, version, json)
            }
            ErrorKind::Io(_) => Vec::new(),
        }
    }
}
