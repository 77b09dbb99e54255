use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for fallible pipeline results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed source error shared between every caller awaiting the same request.
pub type SharedSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Why a call stopped before it settled on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// `abort()`, `cancel(url, method)` or `cancel_all()` was called.
    User,
    /// The per-call timer fired first.
    Timeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CancelReason::User => "request aborted",
            CancelReason::Timeout => "request timed out",
        };
        write!(f, "{label}")
    }
}

/// HTTP status families the classifier distinguishes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HttpErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    ServerError,
    Other,
}

impl HttpErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => HttpErrorKind::BadRequest,
            401 => HttpErrorKind::Unauthorized,
            403 => HttpErrorKind::Forbidden,
            404 => HttpErrorKind::NotFound,
            500 => HttpErrorKind::ServerError,
            _ => HttpErrorKind::Other,
        }
    }

    /// User-facing message template for this status family.
    pub fn message(&self, status: u16, path: Option<&str>) -> String {
        match self {
            HttpErrorKind::BadRequest => {
                "Bad request, please check the submitted data".to_string()
            }
            HttpErrorKind::Unauthorized => "Session expired, please sign in again".to_string(),
            HttpErrorKind::Forbidden => {
                "You do not have permission to access this resource".to_string()
            }
            HttpErrorKind::NotFound => match path {
                Some(path) => format!("Resource not found: {path}"),
                None => "Resource not found".to_string(),
            },
            HttpErrorKind::ServerError => {
                "Internal server error, please try again later".to_string()
            }
            HttpErrorKind::Other => format!("Request failed with status {status}"),
        }
    }
}

/// Non-2xx transport status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpError {
    pub status: u16,
    pub kind: HttpErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Raw response body for debugging (when available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl HttpError {
    pub fn new(status: u16, path: Option<String>) -> Self {
        let kind = HttpErrorKind::from_status(status);
        Self {
            status,
            kind,
            message: kind.message(status, path.as_deref()),
            path,
            request_id: None,
            raw_body: None,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} ({}): {}", self.status, path, self.message),
            None => write!(f, "{}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for HttpError {}

/// Envelope whose business `code` is not the success sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusinessError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Set when `code` is the configured business-unauthorized code.
    #[serde(default)]
    pub unauthorized: bool,
}

impl fmt::Display for BusinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "business error {}: {}", self.code, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " ({path})")?;
        }
        Ok(())
    }
}

impl std::error::Error for BusinessError {}

/// Transport-level error (DNS/TLS/connectivity, body read failures).
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<SharedSource>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_request() {
            TransportErrorKind::Request
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        };
        let message = err.to_string();
        Self::with_source(kind, message, err)
    }
}

/// Broad transport error kinds for classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Body,
    Closed,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Body => "body",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Unified error type surfaced by the pipeline.
///
/// `Clone` so that every caller sharing a deduplicated request receives the
/// same rejection.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("authentication required for {path}")]
    AuthRequired { path: String },

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Http(#[from] HttpError),

    #[error("{0}")]
    Business(#[from] BusinessError),

    #[error("stream error: {message}")]
    StreamProtocol { message: String },

    #[error("{0}")]
    Cancelled(CancelReason),

    #[error("invalid response body: {message}")]
    Decode {
        message: String,
        path: Option<String>,
    },

    #[error("serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(err))
    }
}

impl Error {
    /// True for user aborts and timeouts; these never reach error interceptors.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Cancelled(CancelReason::Timeout))
    }

    /// HTTP 401, the business-unauthorized envelope code, or a missing credential.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Error::AuthRequired { .. } => true,
            Error::Http(err) => err.kind == HttpErrorKind::Unauthorized,
            Error::Business(err) => err.unauthorized,
            _ => false,
        }
    }

    /// Request path associated with the failure, when known.
    pub fn path(&self) -> Option<&str> {
        match self {
            Error::AuthRequired { path } => Some(path),
            Error::Http(err) => err.path.as_deref(),
            Error::Business(err) => err.path.as_deref(),
            Error::Decode { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_templates_by_status() {
        assert_eq!(HttpError::new(400, None).kind, HttpErrorKind::BadRequest);
        assert_eq!(HttpError::new(418, None).kind, HttpErrorKind::Other);
        let err = HttpError::new(404, Some("/models".into()));
        assert_eq!(err.message, "Resource not found: /models");
        assert_eq!(err.to_string(), "404 (/models): Resource not found: /models");
        assert_eq!(
            HttpError::new(502, None).message,
            "Request failed with status 502"
        );
    }

    #[test]
    fn unauthorized_detection_covers_both_layers() {
        assert!(Error::Http(HttpError::new(401, None)).is_unauthorized());
        let business = BusinessError {
            code: 401,
            message: "token expired".into(),
            path: None,
            unauthorized: true,
        };
        assert!(Error::Business(business).is_unauthorized());
        assert!(!Error::Http(HttpError::new(403, None)).is_unauthorized());
        assert!(Error::AuthRequired {
            path: "/me".into()
        }
        .is_unauthorized());
    }

    #[test]
    fn cancellation_is_distinguishable() {
        let timeout = Error::Cancelled(CancelReason::Timeout);
        assert!(timeout.is_cancelled());
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "request timed out");
        assert!(!Error::Cancelled(CancelReason::User).is_timeout());
    }

    #[test]
    fn cloned_transport_error_shares_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::Transport(TransportError::with_source(
            TransportErrorKind::Connect,
            "connection reset",
            io,
        ));
        let copy = err.clone();
        match (&err, &copy) {
            (Error::Transport(a), Error::Transport(b)) => {
                let (a, b) = (a.source.as_ref().unwrap(), b.source.as_ref().unwrap());
                assert!(Arc::ptr_eq(a, b));
            }
            _ => unreachable!(),
        }
        assert_eq!(copy.to_string(), "connect: connection reset");
    }
}
