//! Registry Client Error Hierarchy
//!
//! Errors are grouped by the layer that raises them: the store transport, the
//! lease/session layer, the watch layer and the registry surface. Transport
//! failures arrive as [`tonic::Status`] and are translated here so callers can
//! match on intent instead of gRPC codes.

use std::time::Duration;

use config::ConfigError;
use tonic::Code;
use tonic::Status;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Store unreachable during a lease or key operation
    #[error("store unreachable during {operation}: {source}")]
    Connection {
        operation: &'static str,
        #[source]
        source: Status,
    },

    /// Any other non-success status returned by the store
    #[error("store rejected {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: Status,
    },

    /// Lease can no longer be renewed or was dropped by the store
    #[error("lease {0} has expired")]
    LeaseExpired(i64),

    /// Operation issued after the owning client was closed
    #[error("{client} client has been closed, path '{path}'")]
    ClosedClient { client: &'static str, path: String },

    /// Watch stream was invalidated by the server and cannot be reused
    #[error("call was cancelled, watcher path '{path}': {}", .source.message())]
    StreamCancelled {
        path: String,
        #[source]
        source: Status,
    },

    /// Ephemeral registration could not be written
    #[error("failed to create ephemeral by path '{path}'")]
    Creation {
        path: String,
        #[source]
        source: Box<Error>,
    },

    /// Malformed address or connection locator
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    RetryTaskFailed(String),

    /// Unrecoverable failures requiring the caller to rebuild the client
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Translate a store status raised by `operation` into a crate error
    pub(crate) fn from_status(
        operation: &'static str,
        source: Status,
    ) -> Self {
        match source.code() {
            Code::Unavailable | Code::DeadlineExceeded => Error::Connection { operation, source },
            _ => Error::Store { operation, source },
        }
    }

    /// Translate a status raised by a lease RPC; an unknown lease means it expired
    pub(crate) fn from_lease_status(
        operation: &'static str,
        lease_id: i64,
        source: Status,
    ) -> Self {
        match source.code() {
            Code::NotFound => Error::LeaseExpired(lease_id),
            _ => Self::from_status(operation, source),
        }
    }

    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::Timeout(_) => true,
            Error::Creation { source, .. } => source.is_connection_error(),
            _ => false,
        }
    }

    pub fn is_closed_client(&self) -> bool {
        matches!(self, Error::ClosedClient { .. })
    }
}

/// Whether a failed watch stream may be silently re-established.
///
/// Transient transport conditions are recoverable. Anything the server did on
/// purpose (abort, cancel, permission or leadership loss) is not.
pub fn is_recoverable(status: &Status) -> bool {
    if status.message().contains("no leader") {
        return false;
    }
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted => true,
        Code::Internal => {
            let message = status.message();
            message.contains("RST_STREAM") || message.contains("reset")
        }
        _ => false,
    }
}
