//! Error types for GuacTunnel.

use std::io;

use thiserror::Error;

use crate::status::Status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed instruction data. Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection was closed. Expected at the end of every tunnel.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("{message}")]
    Client { status: Status, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Upstream error: {message}")]
    Upstream { status: Status, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for the most common client error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::Client {
            status: Status::ClientBadRequest,
            message: message.into(),
        }
    }

    /// Classify an I/O error raised by a guacd socket.
    pub fn from_socket(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Upstream {
                status: Status::UpstreamTimeout,
                message: "Connection to guacd timed out.".into(),
            },
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => {
                Error::ConnectionClosed(format!("Connection to guacd is closed: {}", err))
            }
            _ => Error::Io(err),
        }
    }

    /// The protocol status reported to the client for this error.
    pub fn status(&self) -> Status {
        match self {
            Error::Protocol(_) | Error::Server(_) | Error::Io(_) => Status::ServerError,
            Error::ConnectionClosed(_) => Status::ResourceClosed,
            Error::NotFound(_) => Status::ResourceNotFound,
            Error::Client { status, .. } | Error::Upstream { status, .. } => *status,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_))
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}
