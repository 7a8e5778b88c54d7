use shared::WireError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("server rejected connection: {0}")]
    Rejected(String),
    /// The server answered the call with an error.
    #[error(transparent)]
    Remote(#[from] WireError),
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// The server-side error kind, for errors the server reported.
    pub fn remote_kind(&self) -> Option<shared::ErrorKind> {
        match self {
            ClientError::Remote(err) => Some(err.kind),
            _ => None,
        }
    }
}
