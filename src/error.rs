//! Error taxonomy.
//!
//! Would-block is never an error and never reaches this type. Everything else
//! that goes wrong on a connection becomes its sticky status: the first
//! [`Error`] recorded is kept until the connection is destroyed and is handed
//! to the ERROR event.

use std::fmt;
use std::io;

use crate::event::Handle;
use crate::frame::ProtocolError;
use crate::http_upgrade::UpgradeErr;
use crate::transport::DialError;
use crate::url::UrlError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Resolution, connect, TLS, or lease exhaustion while dialing.
    #[error("failed to open connection to {host}:{port}: {source}")]
    Transport {
        host: String,
        port: u16,
        source: DialError,
    },

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] UpgradeErr),

    #[error("websocket protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Send or receive failed once connected.
    #[error("{context}: {kind}")]
    Io {
        kind: io::ErrorKind,
        context: &'static str,
    },

    #[error("connection {0} is not connected")]
    NotConnected(Handle),

    #[error("websocket engine is not initialized: {0}")]
    Initialization(String),

    #[error("invalid websocket url: {0}")]
    Url(#[from] UrlError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Handshake,
    Protocol,
    Io,
    NotConnected,
    Initialization,
    Url,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Io { .. } => ErrorKind::Io,
            Error::NotConnected(_) => ErrorKind::NotConnected,
            Error::Initialization(_) => ErrorKind::Initialization,
            Error::Url(_) => ErrorKind::Url,
        }
    }

    pub(crate) fn io(err: &io::Error, context: &'static str) -> Self {
        Error::Io {
            kind: err.kind(),
            context,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Handshake => "handshake",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
            ErrorKind::NotConnected => "not connected",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Url => "url",
        };
        f.write_str(name)
    }
}
