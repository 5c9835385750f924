//! Daemon server core.
//!
//! Listens on a Unix Domain Socket and handles one connection at a time: read
//! a framed document source, compile it, write the framed result, close. A
//! slow compilation blocks every other client for its duration; requests are
//! strictly serialized, so response N always answers request N.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::lifecycle::SocketGuard;
use super::protocol::{self, FrameError};
use super::workspace::Compiler;
use crate::config::{DEFAULT_RECV_TIMEOUT, DaemonConfig};

/// Delay between accept attempts while no client is waiting.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Back-off after an accept error.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Consecutive accept errors tolerated before the loop gives up.
const MAX_ACCEPT_FAILURES: u32 = 50;

/// Errors that stop the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("another daemon holds {}", .lock_path.display())]
    AlreadyRunning { lock_path: PathBuf },

    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("accept failed {failures} times in a row: {source}")]
    Accept {
        failures: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A socket claimed and bound, ready for [`CompileDaemon::serve`].
#[derive(Debug)]
pub struct BoundSocket {
    pub guard: SocketGuard,
    pub listener: UnixListener,
}

/// Daemon server state.
pub struct CompileDaemon {
    config: DaemonConfig,
    compiler: Compiler,
    start_time: Instant,
    total_requests: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl CompileDaemon {
    /// Create a new daemon with the given configuration.
    pub fn new(config: DaemonConfig) -> Self {
        let compiler = Compiler::new(&config.pdflatex)
            .with_scratch_dir(&config.scratch_dir)
            .with_timeout(config.compile_timeout)
            .with_source_delivery(config.source_delivery);
        Self {
            config,
            compiler,
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Requests that reached the compiler.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Flag that stops the accept loop when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request the daemon to stop after the current connection.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Claim the socket path and bind the listener.
    pub fn bind(&self) -> Result<BoundSocket, DaemonError> {
        let guard = SocketGuard::acquire(&self.config.socket_path)?;
        let listener = guard.bind(self.config.socket_mode)?;
        Ok(BoundSocket { guard, listener })
    }

    /// Bind and serve until shutdown.
    pub fn run(&self) -> Result<(), DaemonError> {
        let bound = self.bind()?;
        self.serve(bound)
    }

    /// Run the accept loop on an already bound socket. The socket file is
    /// removed when this returns, whether cleanly or with an error.
    pub fn serve(&self, bound: BoundSocket) -> Result<(), DaemonError> {
        let BoundSocket { guard, listener } = bound;
        listener.set_nonblocking(true)?;

        info!(
            socket = %guard.socket_path().display(),
            pdflatex = %self.compiler.binary().display(),
            "Daemon listening"
        );

        let mut failures = 0u32;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping daemon");
                break;
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    failures = 0;
                    match self.handle_connection(stream) {
                        Ok(sent) => info!(bytes = sent, "OK"),
                        Err(e) => error!(error = %e, "Connection failed"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failures += 1;
                    error!(error = %e, failures, "Accept error");
                    if failures >= MAX_ACCEPT_FAILURES {
                        return Err(DaemonError::Accept {
                            failures,
                            source: e,
                        });
                    }
                    std::thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }

        drop(guard);
        info!(
            uptime_secs = self.uptime_secs(),
            total_requests = self.total_requests(),
            "Daemon stopped"
        );
        Ok(())
    }

    /// Handle a single client connection: one frame in, one frame out.
    ///
    /// Returns the number of bytes written. The stream is closed on every path.
    pub fn handle_connection(&self, mut stream: UnixStream) -> Result<usize, FrameError> {
        stream.set_nonblocking(false)?;
        // A zero timeout is rejected by the socket; fall back to the default.
        let timeout = match self.config.recv_timeout {
            t if t.is_zero() => DEFAULT_RECV_TIMEOUT,
            t => t,
        };
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let declared = protocol::read_header(&mut stream)?;
        debug!(size = declared, "Connected");
        let source = protocol::read_payload(&mut stream, declared)?;
        if source.len() < declared {
            warn!(
                declared,
                received = source.len(),
                "Client closed before sending the full payload"
            );
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let response = self.compiler.compile(&source);
        let sent = protocol::write_frame(&mut stream, &response)?;

        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "Shutdown after response failed");
        }
        Ok(sent)
    }
}
