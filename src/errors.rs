//! Crate-wide error types.
//!
//! Each error enum is named by effect, not by site, following spec §7: a
//! caller should be able to tell what HTTP status (or process action) an
//! error implies just from its variant.

use std::fmt;
use std::io;

use http::StatusCode;

/// Errors from the wire codec (`crate::wire`).
#[derive(Debug)]
pub enum WireError {
    /// Peer closed the socket in an orderly way (no more messages).
    Eof,
    /// Header was malformed, or declared a buffer count/length that
    /// doesn't fit the implementation limits.
    Framing(String),
    Io(io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Eof => write!(f, "end of stream"),
            WireError::Framing(s) => write!(f, "framing error: {s}"),
            WireError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> WireError {
        WireError::Io(e)
    }
}

/// Result of `RapPool::acquire` (spec §4.3, §9 "cyclic ownership").
#[derive(Debug)]
pub enum PoolError {
    /// Missing or malformed credentials.
    AuthFailed,
    /// PAM or fork failure while bringing up a new RAP.
    AuthError(String),
    /// The user already has `rap_max_sessions_per_user` live sessions.
    Backoff,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::AuthFailed => write!(f, "authentication failed"),
            PoolError::AuthError(s) => write!(f, "error bringing up RAP: {s}"),
            PoolError::Backoff => write!(f, "too many sessions for this user"),
        }
    }
}

impl std::error::Error for PoolError {}

impl PoolError {
    /// Both `AuthFailed` and `Backoff` are mapped to 401, as the source does
    /// (spec §4.3 point 4, documented quirk).
    pub fn status_code(&self) -> StatusCode {
        match self {
            PoolError::AuthFailed | PoolError::Backoff => StatusCode::UNAUTHORIZED,
            PoolError::AuthError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors a RAP operation can return to its caller (spec §4.2, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RapError {
    AccessDenied,
    NotFound,
    Conflict,
    BadClientRequest,
    BadRapRequest,
    InternalError,
    InsufficientStorage,
}

impl fmt::Display for RapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RapError::AccessDenied => "access denied",
            RapError::NotFound => "not found",
            RapError::Conflict => "conflict",
            RapError::BadClientRequest => "bad client request",
            RapError::BadRapRequest => "bad rap request",
            RapError::InternalError => "internal error",
            RapError::InsufficientStorage => "insufficient storage",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for RapError {}

impl RapError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RapError::AccessDenied => StatusCode::FORBIDDEN,
            RapError::NotFound => StatusCode::NOT_FOUND,
            RapError::Conflict => StatusCode::CONFLICT,
            RapError::BadClientRequest => StatusCode::BAD_REQUEST,
            RapError::BadRapRequest | RapError::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RapError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
        }
    }

    /// Map an `io::Error` from a filesystem call per spec §4.2's mapping
    /// table: `EACCES -> ACCESS_DENIED`, otherwise a caller-supplied default
    /// (usually `NotFound` for reads, `Conflict` for writes).
    pub fn from_io(e: &io::Error, default: RapError) -> RapError {
        if e.kind() == io::ErrorKind::PermissionDenied {
            RapError::AccessDenied
        } else {
            default
        }
    }
}

/// Errors while loading or parsing the server configuration (spec §6).
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Xml(String),
    /// A value was present but didn't parse (e.g. `<session-timeout>`).
    Malformed(String),
    /// No `<server>` block was found at all.
    NoServerBlock,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error reading config: {e}"),
            ConfigError::Xml(s) => write!(f, "malformed config xml: {s}"),
            ConfigError::Malformed(s) => write!(f, "malformed config value: {s}"),
            ConfigError::NoServerBlock => write!(f, "no <server> block in config"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> ConfigError {
        ConfigError::Io(e)
    }
}
