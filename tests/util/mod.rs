use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pdflatexd::config::DaemonConfig;
use pdflatexd::daemon::{CompileDaemon, DaemonError};
use tempfile::TempDir;

/// Stand-in for `pdflatex`: honours `-output-directory` and `-jobname`, writes
/// `.log`/`.aux` for every job and a PDF only when the source looks like a
/// LaTeX document. Sources containing `hang` sleep so timeouts can be tested.
pub const FAKE_PDFLATEX: &str = r#"#!/bin/sh
outdir=""
job=""
src=""
for arg in "$@"; do
  case "$arg" in
    -output-directory=*) outdir="${arg#-output-directory=}" ;;
    -jobname=*) job="${arg#-jobname=}" ;;
    -interaction=*) ;;
    *) src="$arg" ;;
  esac
done
if [ -f "$src" ]; then src=$(cat "$src"); fi
echo "log" > "$outdir/$job.log"
echo "aux" > "$outdir/$job.aux"
case "$src" in
  *hang*) exec sleep 30 ;;
  *documentclass*) printf '%%PDF-1.4 %s' "$job" > "$outdir/$job.pdf"; exit 0 ;;
  *) exit 1 ;;
esac
"#;

pub const VALID_SOURCE: &[u8] =
    b"\\documentclass{article}\\begin{document}Hello\\end{document}";

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Scratch area for one test: socket, scratch dir and fake binary.
#[allow(dead_code)]
pub struct DaemonFixture {
    pub dir: TempDir,
    pub scratch: PathBuf,
    pub pdflatex: PathBuf,
    pub socket: PathBuf,
}

#[allow(dead_code)]
impl DaemonFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).expect("scratch dir");
        let pdflatex = write_script(dir.path(), "pdflatex", FAKE_PDFLATEX);
        let socket = dir.path().join("pdflatexd.sock");
        Self {
            dir,
            scratch,
            pdflatex,
            socket,
        }
    }

    pub fn config(&self) -> DaemonConfig {
        DaemonConfig {
            socket_path: self.socket.clone(),
            pdflatex: self.pdflatex.clone(),
            scratch_dir: self.scratch.clone(),
            ..DaemonConfig::default()
        }
    }

    /// Entries left behind in the scratch dir.
    pub fn scratch_entries(&self) -> Vec<String> {
        fs::read_dir(&self.scratch)
            .map(|rd| {
                rd.filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[allow(dead_code)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// An in-process daemon serving on a background thread.
#[allow(dead_code)]
pub struct RunningDaemon {
    pub socket: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), DaemonError>>>,
}

#[allow(dead_code)]
impl RunningDaemon {
    pub fn start(config: DaemonConfig) -> Self {
        let socket = config.socket_path.clone();
        let daemon = CompileDaemon::new(config);
        let bound = daemon.bind().expect("bind daemon socket");
        let stop = daemon.shutdown_handle();
        let handle = thread::spawn(move || daemon.serve(bound));
        Self {
            socket,
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) -> Result<(), DaemonError> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .take()
            .expect("daemon thread")
            .join()
            .expect("daemon thread panicked")
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Poll until `cond` holds or `timeout` passes.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}
