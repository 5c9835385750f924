//! Ownership of the listening socket path across the process lifetime.
//!
//! - an advisory lock next to the socket keeps two daemons from claiming the
//!   same path; once it is held, any file at the socket path is stale. The
//!   lock file itself is never deleted, so every contender locks the same inode
//! - the socket is bound with a zero umask, after which the umask is
//!   tightened for everything the daemon creates later
//! - termination signals remove the socket before the process exits

use std::ffi::c_int;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use fs2::FileExt;
use signal_hook::consts::{SIGALRM, SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use super::core::DaemonError;

/// Signals that remove the socket and stop the daemon.
pub const SHUTDOWN_SIGNALS: [c_int; 4] = [SIGHUP, SIGALRM, SIGTERM, SIGINT];

/// Umask in force after the socket has been bound.
const POST_BIND_UMASK: libc::mode_t = 0o077;

/// Lock file used to claim `socket_path`.
pub fn lock_path_for(socket_path: &Path) -> PathBuf {
    let mut path = socket_path.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

/// Remove the socket file if present. Returns whether a file was removed.
pub fn remove_socket_file(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(_) => match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "Removing file");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
                false
            }
        },
        Err(_) => false,
    }
}

/// Exclusive claim on a socket path: holds the lock on the lock file, and on
/// drop removes the socket and releases the lock. The lock file stays.
#[derive(Debug)]
pub struct SocketGuard {
    socket_path: PathBuf,
    lock_path: PathBuf,
    lock_file: File,
}

impl SocketGuard {
    /// Take the advisory lock for `socket_path`, then delete any stale
    /// socket left by an instance that did not shut down cleanly.
    pub fn acquire(socket_path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let lock_path = lock_path_for(socket_path);
        let mut lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| DaemonError::Lock {
                path: lock_path.clone(),
                source,
            })?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(DaemonError::AlreadyRunning { lock_path });
            }
            Err(source) => return Err(DaemonError::Lock { path: lock_path, source }),
        }
        lock_file.set_len(0)?;
        writeln!(lock_file, "{}", std::process::id())?;

        if remove_socket_file(socket_path) {
            warn!(path = %socket_path.display(), "deleted stale socket");
        }

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            lock_path,
            lock_file,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Bind the listener at the guarded path.
    ///
    /// The socket is created under a zero umask so it is connectable by other
    /// users; afterwards the umask is tightened and `mode`, if given, is
    /// applied to the socket file.
    pub fn bind(&self, mode: Option<u32>) -> Result<UnixListener, DaemonError> {
        // SAFETY: umask only swaps the process file-creation mask.
        let previous = unsafe { libc::umask(0) };
        let bound = UnixListener::bind(&self.socket_path);
        // SAFETY: as above.
        unsafe { libc::umask(previous | POST_BIND_UMASK) };

        let listener = bound.map_err(|source| DaemonError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;
        if let Some(mode) = mode {
            fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(mode))?;
        }
        Ok(listener)
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        remove_socket_file(&self.socket_path);
        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// Spawn the thread that turns termination signals into socket cleanup
/// followed by process exit with `128 + signal`. The instance lock is
/// released by the exit itself.
pub fn install_signal_cleanup(socket_path: &Path) -> Result<JoinHandle<()>, DaemonError> {
    let mut signals = Signals::new(SHUTDOWN_SIGNALS).map_err(DaemonError::Signals)?;
    let socket_path = socket_path.to_path_buf();

    let handle = std::thread::Builder::new()
        .name("pdflatexd-signals".into())
        .spawn(move || {
            #[allow(clippy::never_loop)]
            for signal in signals.forever() {
                if signal == SIGINT {
                    warn!("stopped");
                }
                info!(signal, "Signal handler called with signal {signal}");
                remove_socket_file(&socket_path);
                std::process::exit(128 + signal);
            }
        })
        .map_err(|e| {
            error!(error = %e, "Failed to spawn signal thread");
            DaemonError::Signals(e)
        })?;
    Ok(handle)
}
