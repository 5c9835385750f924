//! LaTeX compile daemon.
//!
//! A local server that turns document sources into PDFs by running
//! `pdflatex`, one request at a time. Clients talk to it over a Unix Domain
//! Socket using a fixed length-prefixed framing:
//!
//! ```text
//! ┌─────────────┐  00000042\documentclass...   ┌──────────────────────────┐
//! │   client    │ ───────────────────────────▶ │ CompileDaemon            │
//! │             │                              │  ├─ protocol  (framing)  │
//! │             │  00012345%PDF-1.5...         │  ├─ workspace (pdflatex) │
//! │             │ ◀─────────────────────────── │  └─ lifecycle (socket)   │
//! └─────────────┘   or  00000001 + "1"         └──────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use pdflatexd::config::DaemonConfig;
//! use pdflatexd::daemon::{CompileClient, CompileDaemon};
//!
//! // Server
//! let daemon = CompileDaemon::new(DaemonConfig::load(None)?);
//! daemon.run()?;
//!
//! // Client
//! let reply = CompileClient::new(&socket_path).compile(source.as_bytes())?;
//! ```

pub mod client;
pub mod core;
pub mod lifecycle;
pub mod protocol;
pub mod workspace;

// Re-export key types for convenience
pub use client::{ClientError, CompileClient, CompileReply};
pub use self::core::{BoundSocket, CompileDaemon, DaemonError};
pub use lifecycle::{SocketGuard, install_signal_cleanup};
pub use protocol::{FrameError, HEADER_WIDTH, MAX_PAYLOAD_LEN, encode_frame, read_frame, write_frame};
pub use workspace::{CompileOutcome, Compiler, FAULT_CODE, JobWorkspace, SourceDelivery};
