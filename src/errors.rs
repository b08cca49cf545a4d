//! Blob client error types.
//!
//! Errors fall into three families: argument errors caught before any
//! network call, transport/service errors returned by the blob service
//! (or captured as a sticky fault by an output stream), and state errors
//! such as using a stream after it was closed.  The enum is `Clone` so a
//! recorded fault can be surfaced again on every later call.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Storage error code returned when an append-position precondition fails.
pub const APPEND_POSITION_CONDITION_NOT_MET: &str = "AppendPositionConditionNotMet";

/// Storage error code returned when a max-size precondition fails.
pub const MAX_BLOB_SIZE_CONDITION_NOT_MET: &str = "MaxBlobSizeConditionNotMet";

/// Errors produced by the blob client.
#[derive(Debug, Clone, Error)]
pub enum BlobError {
    /// Invalid input rejected before any request was issued.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The service answered with a non-success status.
    #[error("Blob service returned {status} ({code}): {message}")]
    Service {
        status: StatusCode,
        code: String,
        message: String,
    },

    /// The request never produced a response (connection, body read, ...).
    #[error("I/O failure talking to blob service: {message}")]
    Io { message: String },

    /// A transport failure recorded by an output stream.  Every later
    /// operation on that stream returns this same error.
    #[error("Blob upload failed: {0}")]
    StreamFault(Box<BlobError>),

    /// The output stream was already closed.
    #[error("Stream is already closed")]
    StreamClosed,

    /// The operation did not finish within the configured bound.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A response body could not be parsed.
    #[error("Malformed XML in service response: {message}")]
    Xml { message: String },

    /// Client configuration is incomplete or inconsistent.
    #[error("Invalid client configuration: {message}")]
    Config { message: String },
}

impl BlobError {
    /// Shorthand for [`BlobError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BlobError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`BlobError::Io`].
    pub fn io(message: impl Into<String>) -> Self {
        BlobError::Io {
            message: message.into(),
        }
    }

    /// Return a stable error code string.
    pub fn code(&self) -> &str {
        match self {
            BlobError::InvalidArgument { .. } => "InvalidArgument",
            BlobError::Service { code, .. } => code,
            BlobError::Io { .. } => "IoError",
            BlobError::StreamFault(inner) => inner.code(),
            BlobError::StreamClosed => "StreamClosed",
            BlobError::Timeout(_) => "OperationTimedOut",
            BlobError::Xml { .. } => "MalformedXml",
            BlobError::Config { .. } => "InvalidConfiguration",
        }
    }

    /// Return the HTTP status associated with this error.
    ///
    /// Local errors map onto the closest status the service would use.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BlobError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            BlobError::Service { status, .. } => *status,
            BlobError::Io { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BlobError::StreamFault(inner) => inner.status_code(),
            BlobError::StreamClosed => StatusCode::CONFLICT,
            BlobError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            BlobError::Xml { .. } => StatusCode::BAD_GATEWAY,
            BlobError::Config { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// The storage error code if this error came from the service.
    pub fn service_code(&self) -> Option<&str> {
        match self {
            BlobError::Service { code, .. } => Some(code),
            BlobError::StreamFault(inner) => inner.service_code(),
            _ => None,
        }
    }

    /// True when the service rejected a conditional request (HTTP 412).
    pub fn is_precondition_failed(&self) -> bool {
        matches!(
            self.unwrap_fault(),
            BlobError::Service { status, .. } if *status == StatusCode::PRECONDITION_FAILED
        )
    }

    /// True for errors raised by local validation.
    pub fn is_argument_error(&self) -> bool {
        matches!(self, BlobError::InvalidArgument { .. })
    }

    /// True for service and network failures, including recorded faults.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self.unwrap_fault(),
            BlobError::Service { .. } | BlobError::Io { .. } | BlobError::Timeout(_)
        )
    }

    fn unwrap_fault(&self) -> &BlobError {
        match self {
            BlobError::StreamFault(inner) => inner.unwrap_fault(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for BlobError {
    fn from(err: reqwest::Error) -> Self {
        BlobError::io(err.to_string())
    }
}

impl From<quick_xml::Error> for BlobError {
    fn from(err: quick_xml::Error) -> Self {
        BlobError::Xml {
            message: err.to_string(),
        }
    }
}
