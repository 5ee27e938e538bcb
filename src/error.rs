//! Error taxonomy shared by the store, the server and the client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReadDbError>;

#[derive(Debug, Error)]
pub enum ReadDbError {
    /// Socket or framing failure. The connection is unusable until `reconnect()`.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request was understood but cannot be answered (unknown alignment,
    /// empty chromosome, bad range). Callers move on to the next query.
    #[error("client error: {0}")]
    Client(String),

    /// Coverage bookkeeping went inconsistent; the result would be wrong.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReadDbError {
    /// Errors after which the current connection must be dropped.
    pub fn is_connection(&self) -> bool {
        matches!(self, ReadDbError::Connection(_))
    }

    /// Errors caused by the request itself rather than the server.
    pub fn is_client_side(&self) -> bool {
        matches!(
            self,
            ReadDbError::Client(_) | ReadDbError::InvalidArgument(_) | ReadDbError::Parse(_)
        )
    }
}

impl From<ReadDbError> for std::io::Error {
    fn from(e: ReadDbError) -> Self {
        match e {
            ReadDbError::Io(e) => e,
            ReadDbError::Connection(msg) => {
                std::io::Error::new(std::io::ErrorKind::ConnectionAborted, msg)
            }
            ReadDbError::InvalidArgument(msg) | ReadDbError::Parse(msg) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
            }
            ReadDbError::Auth(msg) => {
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, msg)
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}
