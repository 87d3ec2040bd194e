use std::{fmt, io, sync::Arc, time::Duration};

use smol_str::SmolStr;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum TransportError {
    #[error("convert from uri error {0}")]
    FromUri(#[from] FromUriError),
    #[error("io error {0}")]
    Io(#[from] io::Error),
    #[error("rustls error {0}")]
    Rustls(#[from] rustls::Error),
    #[error("serde_json error {0}")]
    Json(#[from] serde_json::Error),
    #[error("connect error {0}")]
    Connect(io::Error),
    #[error("address unreachable {0}")]
    Unreachable(io::Error),
    #[error("connect timeout after {0:?}")]
    ConnectTimeout(Duration),
    #[error("operation timeout after {0:?}")]
    OperationTimeout(Duration),
    #[error("read timeout after {0:?}")]
    ReadTimeout(Duration),
    #[error("write timeout after {0:?}")]
    WriteTimeout(Duration),
    #[error("request timeout after {0:?}")]
    RequestTimeout(Duration),
    #[error("total timeout after {0:?}")]
    TotalTimeout(Duration),
    #[error("select timed out after {0:?}")]
    SelectTimeout(Duration),
    #[error("pool checkout timeout after {0:?}")]
    PoolTimeout(Duration),
    #[error("failed to resolve {0}")]
    Resolve(SmolStr),
    #[error("H1 decode error {0}")]
    H1Decode(String),
    #[error("H2 protocol error {0:?}")]
    H2(H2ErrorCode),
    #[error("H2 stream reset {0:?}")]
    StreamReset(H2ErrorCode),
    #[error("connection closed before message completed")]
    Eof,
    #[error("io handle closed")]
    ClosedHandle,
    #[error("Validation error {0}")]
    Validation(String),
}

pub type Error = TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Whether the failure happened at the connection level, so a resend
    /// on another socket may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Eof | Self::ConnectTimeout(_) | Self::ClosedHandle => true,
            Self::StreamReset(code) => *code == H2ErrorCode::RefusedStream,
            Self::Connect(e) | Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[derive(ThisError, Debug)]
pub enum FromUriError {
    #[error("Invalid dns name {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[error("Scheme not supported")]
    UnsupportScheme,
    #[error("Missing authority in uri")]
    NoAuthority,
}

/// HTTP/2 error codes (RFC 9113 section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl From<u32> for H2ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            other => Self::Unknown(other),
        }
    }
}

impl From<H2ErrorCode> for u32 {
    fn from(code: H2ErrorCode) -> Self {
        match code {
            H2ErrorCode::NoError => 0x0,
            H2ErrorCode::ProtocolError => 0x1,
            H2ErrorCode::InternalError => 0x2,
            H2ErrorCode::FlowControlError => 0x3,
            H2ErrorCode::SettingsTimeout => 0x4,
            H2ErrorCode::StreamClosed => 0x5,
            H2ErrorCode::FrameSizeError => 0x6,
            H2ErrorCode::RefusedStream => 0x7,
            H2ErrorCode::Cancel => 0x8,
            H2ErrorCode::CompressionError => 0x9,
            H2ErrorCode::ConnectError => 0xa,
            H2ErrorCode::EnhanceYourCalm => 0xb,
            H2ErrorCode::InadequateSecurity => 0xc,
            H2ErrorCode::Http11Required => 0xd,
            H2ErrorCode::Unknown(other) => other,
        }
    }
}

/// A failed exchange, delivered through the same path as a successful
/// response. The error is shared so one channel failure can be handed to
/// every request that was waiting on it.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    error: Arc<TransportError>,
}

impl ErrorResponse {
    #[inline]
    pub fn new(error: TransportError) -> Self {
        Self {
            error: Arc::new(error),
        }
    }

    #[inline]
    pub fn shared(error: Arc<TransportError>) -> Self {
        Self { error }
    }

    #[inline]
    pub fn error(&self) -> &TransportError {
        &self.error
    }

    #[inline]
    pub fn shared_error(&self) -> Arc<TransportError> {
        self.error.clone()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for ErrorResponse {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl From<TransportError> for ErrorResponse {
    fn from(error: TransportError) -> Self {
        Self::new(error)
    }
}

/// What a caller receives for each request.
pub type Outcome = std::result::Result<http::Response<bytes::Bytes>, ErrorResponse>;
