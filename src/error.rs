use serde_json::Value as JsonValue;
use std::fmt;
use thiserror::Error;

/// HTTP statuses the service uses for transient conditions.
pub const RETRIABLE_STATUS_CODES: [u16; 6] = [408, 409, 429, 502, 503, 504];

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed input detected locally, always raised before any request is sent.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to compress payload: {0}")]
    Compression(#[source] std::io::Error),

    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Api(err) => err.is_retriable(),
            ClientError::Transport(err) => err.kind.is_retriable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status_code: Option<u16>,
    pub body: JsonValue,
}

impl ApiError {
    pub fn new(status_code: u16, body: JsonValue) -> Self {
        Self {
            status_code: Some(status_code),
            body,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.status_code
            .is_some_and(|code| RETRIABLE_STATUS_CODES.contains(&code))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "status_code: {code}, body: {}", self.body),
            None => write!(f, "status_code: None, body: {}", self.body),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionReset,
    Connect,
    ConnectTimeout,
    ReadTimeout,
    WriteTimeout,
    RemoteProtocol,
    PoolTimeout,
    Read,
    Write,
    Other,
}

impl TransportErrorKind {
    pub fn is_retriable(self) -> bool {
        !matches!(self, TransportErrorKind::Other)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify_reqwest_error(&err);
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.into())
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if let Some(io_kind) = io_error_kind(err) {
        match io_kind {
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                return TransportErrorKind::ConnectionReset;
            }
            std::io::ErrorKind::BrokenPipe => return TransportErrorKind::Write,
            std::io::ErrorKind::UnexpectedEof => return TransportErrorKind::RemoteProtocol,
            std::io::ErrorKind::TimedOut if err.is_connect() => {
                return TransportErrorKind::ConnectTimeout;
            }
            std::io::ErrorKind::TimedOut => return TransportErrorKind::ReadTimeout,
            _ => {}
        }
    }
    if err.is_timeout() {
        if err.is_connect() {
            TransportErrorKind::ConnectTimeout
        } else {
            TransportErrorKind::ReadTimeout
        }
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Read
    } else if err.is_request() {
        TransportErrorKind::RemoteProtocol
    } else {
        TransportErrorKind::Other
    }
}

fn io_error_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}
