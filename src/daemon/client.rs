//! Client side of the wire protocol.
//!
//! The daemon does not mark errors on the wire, so replies are told apart by
//! content: anything starting with the PDF magic is a document, anything else
//! is taken as an error code.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::protocol::{self, FrameError};

/// Leading bytes of every PDF document.
pub const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reply truncated: header announced {declared} bytes, got {received}")]
    Truncated { declared: usize, received: usize },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A reply from the daemon, classified by content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileReply {
    Document(Vec<u8>),
    ErrorCode(String),
}

impl CompileReply {
    pub fn classify(payload: Vec<u8>) -> Self {
        if payload.starts_with(PDF_MAGIC) {
            Self::Document(payload)
        } else {
            Self::ErrorCode(String::from_utf8_lossy(&payload).trim().to_string())
        }
    }
}

/// Sends one document per connection to a running daemon.
#[derive(Debug, Clone)]
pub struct CompileClient {
    socket_path: PathBuf,
    timeout: Option<Duration>,
}

impl CompileClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: None,
        }
    }

    /// Bound each read and write on the connection. Compilation happens while
    /// the client waits for the reply, so this must cover the compile time.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send `source` and return the raw reply payload.
    pub fn send(&self, source: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;

        let sent = protocol::write_frame(&mut stream, source)?;
        debug!(bytes = sent, socket = %self.socket_path.display(), "Sent request");
        let _ = stream.shutdown(Shutdown::Write);

        let (declared, payload) = protocol::read_frame(&mut stream)?;
        if payload.len() != declared {
            return Err(ClientError::Truncated {
                declared,
                received: payload.len(),
            });
        }
        Ok(payload)
    }

    /// Send `source` and classify the reply.
    pub fn compile(&self, source: &[u8]) -> Result<CompileReply, ClientError> {
        self.send(source).map(CompileReply::classify)
    }
}
