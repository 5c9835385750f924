//! Per-job scratch space and the external `pdflatex` invocation.
//!
//! Each request gets a fresh prefix such as `/tmp/ows-a8Kx2Q`. The bare prefix
//! file reserves the name; everything `pdflatex` produces is named by suffixing
//! it (`.log`, `.aux`, `.pdf`, and `.tex` in file delivery mode). When the job
//! is done every suffixed file is removed, whatever the outcome.
//!
//! Outcome resolution only looks at the filesystem: if `<prefix>.pdf` exists
//! its bytes are the answer, otherwise the tool's exit status is rendered as
//! a short decimal string. Failing to run the tool at all yields [`FAULT_CODE`].

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::protocol::MAX_PAYLOAD_LEN;

/// Payload returned when the compiler could not be run at all.
pub const FAULT_CODE: &str = "64";

/// Prefix for job workspace names.
pub const JOB_PREFIX: &str = "ows-";

/// Suffixes removed at the end of every job. The empty suffix is the bare
/// prefix file created to reserve the name.
pub const CLEANUP_SUFFIXES: [&str; 5] = [".log", ".aux", ".pdf", ".tex", ""];

const ARTIFACT_SUFFIX: &str = ".pdf";
const SOURCE_SUFFIX: &str = ".tex";
const WAIT_POLL: Duration = Duration::from_millis(25);

/// How the document source reaches the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDelivery {
    /// Source bytes are the final command-line argument, verbatim.
    #[default]
    Argument,
    /// Source is written to `<prefix>.tex` and that path is passed instead.
    File,
}

impl FromStr for SourceDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "argument" | "arg" => Ok(Self::Argument),
            "file" => Ok(Self::File),
            other => Err(format!("unknown source delivery mode: {other}")),
        }
    }
}

/// Reasons the compiler could not produce a verdict.
#[derive(Error, Debug)]
pub enum CompileFault {
    #[error("failed to prepare job workspace: {0}")]
    Workspace(#[source] io::Error),

    #[error("failed to start {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for compiler: {0}")]
    Wait(#[source] io::Error),

    #[error("compiler still running after {}ms, killed", .0.as_millis())]
    Timeout(Duration),

    #[error("artifact {} is {len} bytes, larger than a frame can carry", .path.display())]
    ArtifactTooLarge { path: PathBuf, len: u64 },

    #[error("failed to read {}: {source}", .path.display())]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of one compilation job.
#[derive(Debug)]
pub enum CompileOutcome {
    /// The tool produced an artifact; these are its bytes.
    Artifact(Vec<u8>),
    /// The tool ran but left no artifact; `status` is its rendered exit status.
    Failed { status: String },
    /// The tool could not be run to completion.
    Fault(CompileFault),
}

impl CompileOutcome {
    /// Bytes sent back to the client. Errors are indistinguishable from
    /// artifacts at the framing layer.
    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Self::Artifact(bytes) => bytes,
            Self::Failed { status } => status.into_bytes(),
            Self::Fault(_) => FAULT_CODE.as_bytes().to_vec(),
        }
    }
}

/// Render an exit status the way the wire protocol reports it: the exit code,
/// or the negated signal number when the process was killed.
pub fn render_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => code.to_string(),
        (None, Some(signal)) => format!("-{signal}"),
        (None, None) => FAULT_CODE.to_string(),
    }
}

/// A uniquely named temporary prefix owned by one job.
#[derive(Debug)]
pub struct JobWorkspace {
    prefix: PathBuf,
}

impl JobWorkspace {
    /// Reserve a new prefix inside `scratch_dir`.
    pub fn create(scratch_dir: &Path) -> io::Result<Self> {
        let reserved = tempfile::Builder::new()
            .prefix(JOB_PREFIX)
            .tempfile_in(scratch_dir)?
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)?;
        Ok(Self { prefix: reserved })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Directory holding every file of the job.
    pub fn dir(&self) -> &Path {
        self.prefix.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Base name of the prefix, used as the compiler's job name.
    pub fn job_name(&self) -> &OsStr {
        self.prefix.file_name().unwrap_or_default()
    }

    pub fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut path = self.prefix.as_os_str().to_owned();
        path.push(suffix);
        PathBuf::from(path)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.with_suffix(ARTIFACT_SUFFIX)
    }

    pub fn source_path(&self) -> PathBuf {
        self.with_suffix(SOURCE_SUFFIX)
    }

    /// Remove every job file. Missing files are skipped, so calling this
    /// again is a no-op. Returns how many files were removed.
    pub fn cleanup(&self) -> usize {
        let mut removed = 0;
        for suffix in CLEANUP_SUFFIXES {
            let path = self.with_suffix(suffix);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove job file"),
            }
        }
        removed
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Runs the external typesetting tool against a fresh workspace per job.
#[derive(Debug, Clone)]
pub struct Compiler {
    binary: PathBuf,
    scratch_dir: PathBuf,
    timeout: Option<Duration>,
    delivery: SourceDelivery,
}

impl Compiler {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_dir: std::env::temp_dir(),
            timeout: None,
            delivery: SourceDelivery::Argument,
        }
    }

    /// Directory in which job prefixes are created.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Kill the tool if it runs longer than `timeout`. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_source_delivery(mut self, delivery: SourceDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Compile `source` and return the bytes to send back to the client.
    pub fn compile(&self, source: &[u8]) -> Vec<u8> {
        self.run(source).into_payload()
    }

    /// Compile `source` and classify the result. The workspace is always
    /// cleaned up before this returns.
    pub fn run(&self, source: &[u8]) -> CompileOutcome {
        debug!(bytes = source.len(), "got data");
        let workspace = match JobWorkspace::create(&self.scratch_dir) {
            Ok(ws) => ws,
            Err(e) => {
                let fault = CompileFault::Workspace(e);
                error!(error = %fault, "While generating PDF");
                return CompileOutcome::Fault(fault);
            }
        };

        let outcome = self.run_in(&workspace, source);
        let removed = workspace.cleanup();
        debug!(prefix = %workspace.prefix().display(), removed, "cleaned job workspace");
        outcome
    }

    fn run_in(&self, workspace: &JobWorkspace, source: &[u8]) -> CompileOutcome {
        let status = match self.invoke(workspace, source) {
            Ok(status) => status,
            Err(fault) => {
                error!(error = %fault, "While generating PDF");
                return CompileOutcome::Fault(fault);
            }
        };

        let artifact = workspace.artifact_path();
        if let Ok(meta) = fs::metadata(&artifact)
            && meta.is_file()
        {
            if meta.len() > MAX_PAYLOAD_LEN as u64 {
                let fault = CompileFault::ArtifactTooLarge {
                    path: artifact,
                    len: meta.len(),
                };
                error!(error = %fault, "While generating PDF");
                return CompileOutcome::Fault(fault);
            }
            return match fs::read(&artifact) {
                Ok(bytes) => {
                    debug!(bytes = bytes.len(), "finished creating file");
                    CompileOutcome::Artifact(bytes)
                }
                Err(source) => {
                    let fault = CompileFault::ReadArtifact {
                        path: artifact,
                        source,
                    };
                    error!(error = %fault, "While generating PDF");
                    CompileOutcome::Fault(fault)
                }
            };
        }

        let status = render_status(status);
        error!(status = %status, "Returned value {status}");
        CompileOutcome::Failed { status }
    }

    fn invoke(&self, workspace: &JobWorkspace, source: &[u8]) -> Result<ExitStatus, CompileFault> {
        let mut command = self.command(workspace, source)?;
        debug!(binary = %self.binary.display(), "built command");
        let mut child = command.spawn().map_err(|source| CompileFault::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        match self.timeout {
            Some(limit) => wait_with_deadline(&mut child, limit),
            None => child.wait().map_err(CompileFault::Wait),
        }
    }

    fn command(&self, workspace: &JobWorkspace, source: &[u8]) -> Result<Command, CompileFault> {
        let mut output_dir = OsString::from("-output-directory=");
        output_dir.push(workspace.dir());
        let mut job_name = OsString::from("-jobname=");
        job_name.push(workspace.job_name());

        let document = match self.delivery {
            SourceDelivery::Argument => OsStr::from_bytes(source).to_owned(),
            SourceDelivery::File => {
                let path = workspace.source_path();
                fs::write(&path, source).map_err(CompileFault::Workspace)?;
                path.into_os_string()
            }
        };

        let mut command = Command::new(&self.binary);
        command
            .arg(output_dir)
            .arg("-interaction=nonstopmode")
            .arg(job_name)
            .arg(document)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Ok(command)
    }
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Result<ExitStatus, CompileFault> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(CompileFault::Wait)? {
            return Ok(status);
        }
        if started.elapsed() >= limit {
            if let Err(e) = child.kill() {
                warn!(pid = child.id(), error = %e, "Failed to kill compiler");
            }
            let _ = child.wait();
            return Err(CompileFault::Timeout(limit));
        }
        std::thread::sleep(WAIT_POLL.min(limit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stand-in for pdflatex: writes `<job>.pdf` when the source mentions
    /// `\documentclass`, otherwise leaves a log behind and exits 1.
    const FAKE_PDFLATEX: &str = r#"#!/bin/sh
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
  *documentclass*) printf '%%PDF-1.4 fake' > "$outdir/$job.pdf"; exit 0 ;;
  *) exit 1 ;;
esac
"#;

    /// Leaves a sparse artifact one byte longer than a frame can carry.
    const OVERSIZED_PDFLATEX: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    -output-directory=*) outdir="${arg#-output-directory=}" ;;
    -jobname=*) job="${arg#-jobname=}" ;;
  esac
done
truncate -s 100000000 "$outdir/$job.pdf"
"#;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Files in `dir` that belong to a job workspace.
    fn job_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(JOB_PREFIX))
            .collect()
    }

    struct Fixture {
        _tools: TempDir,
        scratch: TempDir,
        compiler: Compiler,
    }

    fn fixture(body: &str) -> Fixture {
        let tools = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let binary = script(tools.path(), "pdflatex", body);
        let compiler = Compiler::new(binary).with_scratch_dir(scratch.path());
        Fixture {
            _tools: tools,
            scratch,
            compiler,
        }
    }

    #[test]
    fn test_workspace_paths_share_prefix() {
        let scratch = TempDir::new().unwrap();
        let ws = JobWorkspace::create(scratch.path()).unwrap();
        assert!(ws.prefix().is_file());
        assert_eq!(ws.dir(), scratch.path());
        let name = ws.job_name().to_string_lossy().into_owned();
        assert!(name.starts_with(JOB_PREFIX));
        assert_eq!(
            ws.artifact_path().file_name().unwrap().to_string_lossy(),
            format!("{name}.pdf")
        );
    }

    #[test]
    fn test_workspaces_are_unique() {
        let scratch = TempDir::new().unwrap();
        let a = JobWorkspace::create(scratch.path()).unwrap();
        let b = JobWorkspace::create(scratch.path()).unwrap();
        assert_ne!(a.prefix(), b.prefix());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let scratch = TempDir::new().unwrap();
        let ws = JobWorkspace::create(scratch.path()).unwrap();
        fs::write(ws.with_suffix(".log"), b"log").unwrap();
        fs::write(ws.artifact_path(), b"%PDF").unwrap();

        assert_eq!(ws.cleanup(), 3);
        assert_eq!(ws.cleanup(), 0);
        assert!(job_files(scratch.path()).is_empty());
    }

    #[test]
    fn test_drop_removes_workspace() {
        let scratch = TempDir::new().unwrap();
        {
            let ws = JobWorkspace::create(scratch.path()).unwrap();
            fs::write(ws.with_suffix(".aux"), b"aux").unwrap();
        }
        assert!(job_files(scratch.path()).is_empty());
    }

    #[test]
    fn test_source_delivery_parse() {
        assert_eq!("argument".parse::<SourceDelivery>(), Ok(SourceDelivery::Argument));
        assert_eq!(" FILE ".parse::<SourceDelivery>(), Ok(SourceDelivery::File));
        assert!("stdin".parse::<SourceDelivery>().is_err());
    }

    #[test]
    fn test_fault_payload_is_fixed_code() {
        let outcome = CompileOutcome::Fault(CompileFault::Timeout(Duration::from_secs(1)));
        assert_eq!(outcome.into_payload(), b"64");
    }

    #[test]
    #[serial]
    fn test_compile_success_returns_artifact() {
        let fx = fixture(FAKE_PDFLATEX);
        let out = fx
            .compiler
            .compile(b"\\documentclass{article}\\begin{document}hi\\end{document}");
        assert_eq!(out, b"%PDF-1.4 fake");
        assert!(job_files(fx.scratch.path()).is_empty());
    }

    #[test]
    #[serial]
    fn test_compile_failure_returns_exit_status() {
        let fx = fixture(FAKE_PDFLATEX);
        match fx.compiler.run(b"%PDF1") {
            CompileOutcome::Failed { status } => assert_eq!(status, "1"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(job_files(fx.scratch.path()).is_empty());
    }

    #[test]
    #[serial]
    fn test_compile_reports_arbitrary_exit_code() {
        let fx = fixture("#!/bin/sh\nexit 3\n");
        assert_eq!(fx.compiler.compile(b"anything"), b"3");
        assert!(job_files(fx.scratch.path()).is_empty());
    }

    #[test]
    #[serial]
    fn test_missing_binary_returns_fault_code() {
        let scratch = TempDir::new().unwrap();
        let compiler =
            Compiler::new("/nonexistent/bin/pdflatex").with_scratch_dir(scratch.path());
        match compiler.run(b"\\documentclass{article}") {
            CompileOutcome::Fault(CompileFault::Spawn { .. }) => {}
            other => panic!("expected spawn fault, got {other:?}"),
        }
        assert_eq!(compiler.compile(b"x"), b"64");
        assert!(job_files(scratch.path()).is_empty());
    }

    #[test]
    #[serial]
    fn test_timeout_kills_compiler() {
        let fx = fixture("#!/bin/sh\nexec sleep 30\n");
        let compiler = fx
            .compiler
            .clone()
            .with_timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();
        match compiler.run(b"\\documentclass{article}") {
            CompileOutcome::Fault(CompileFault::Timeout(_)) => {}
            other => panic!("expected timeout fault, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(job_files(fx.scratch.path()).is_empty());
    }

    #[test]
    #[serial]
    fn test_file_delivery_writes_and_removes_source() {
        let fx = fixture(FAKE_PDFLATEX);
        let compiler = fx.compiler.clone().with_source_delivery(SourceDelivery::File);
        assert_eq!(compiler.compile(b"\\documentclass{article}"), b"%PDF-1.4 fake");
        assert!(job_files(fx.scratch.path()).is_empty());
    }

    #[test]
    #[serial]
    fn test_oversized_artifact_is_a_fault() {
        let fx = fixture(OVERSIZED_PDFLATEX);
        match fx.compiler.run(b"\\documentclass{article}") {
            CompileOutcome::Fault(CompileFault::ArtifactTooLarge { len, .. }) => {
                assert_eq!(len, 100_000_000)
            }
            other => panic!("expected oversized artifact fault, got {other:?}"),
        }
        assert_eq!(fx.compiler.compile(b"x"), b"64");
        assert!(job_files(fx.scratch.path()).is_empty());
    }

    #[test]
    #[serial]
    fn test_source_with_nul_byte_is_a_fault() {
        let scratch = TempDir::new().unwrap();
        let compiler = Compiler::new("/bin/true").with_scratch_dir(scratch.path());
        assert_eq!(compiler.compile(b"a\0b"), b"64");
    }
}
