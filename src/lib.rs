pub mod config;
pub mod daemon;
pub mod logging;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};

use config::DaemonConfig;
use daemon::{CompileClient, CompileDaemon, CompileReply, install_signal_cleanup};

/// Exit code of `compile` when the daemon answered with an error code.
pub const EXIT_COMPILE_FAILED: u8 = 2;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "pdflatexd",
    version,
    about = "Compile LaTeX sources to PDF over a Unix domain socket"
)]
pub struct Cli {
    /// Config file (defaults to the platform config dir, if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path of the daemon socket (overrides config and PDFLATEXD_SOCKET)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Typesetting binary to invoke
        #[arg(long)]
        pdflatex: Option<PathBuf>,

        /// Directory for per-job scratch files
        #[arg(long)]
        scratch_dir: Option<PathBuf>,

        /// Append logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Log level or filter directive (RUST_LOG wins when set)
        #[arg(long)]
        log_level: Option<String>,

        /// Kill a compilation after this many seconds (0 = never)
        #[arg(long)]
        compile_timeout_secs: Option<u64>,
    },
    /// Send a document to a running daemon and write the PDF
    Compile {
        /// LaTeX source file, or `-` for stdin
        input: PathBuf,

        /// Where to write the PDF (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Give up waiting for the daemon after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub fn run() -> Result<ExitCode> {
    run_with(Cli::parse())
}

pub fn run_with(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Serve {
            pdflatex,
            scratch_dir,
            log_file,
            log_level,
            compile_timeout_secs,
        } => {
            let mut config = load_config(cli.config.as_deref(), cli.socket)?;
            if let Some(v) = pdflatex {
                config.pdflatex = v;
            }
            if let Some(v) = scratch_dir {
                config.scratch_dir = v;
            }
            if let Some(v) = log_file {
                config.log_file = Some(v);
            }
            if let Some(v) = log_level {
                config.log_level = v;
            }
            if let Some(secs) = compile_timeout_secs {
                config.compile_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            run_serve(config)
        }
        Commands::Compile {
            input,
            output,
            timeout_secs,
        } => {
            let config = load_config(cli.config.as_deref(), cli.socket)?;
            logging::init("warn", None)?;
            run_compile(&config, &input, output.as_deref(), timeout_secs)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pdflatexd", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>, socket: Option<PathBuf>) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(path).context("loading configuration")?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    Ok(config)
}

fn run_serve(config: DaemonConfig) -> Result<ExitCode> {
    logging::init(&config.log_level, config.log_file.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
        "started"
    );

    let daemon = CompileDaemon::new(config);
    let bound = daemon.bind().inspect_err(|e| {
        error!(error = %e, "Failed to start daemon");
    })?;
    let _signals = install_signal_cleanup(bound.guard.socket_path())?;

    daemon.serve(bound).inspect_err(|e| {
        error!(error = %e, "Daemon stopped on fatal error");
    })?;
    Ok(ExitCode::SUCCESS)
}

fn run_compile(
    config: &DaemonConfig,
    input: &Path,
    output: Option<&Path>,
    timeout_secs: Option<u64>,
) -> Result<ExitCode> {
    let source = if input == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading source from stdin")?;
        buf
    } else {
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?
    };

    let client = CompileClient::new(&config.socket_path)
        .with_timeout(timeout_secs.map(Duration::from_secs));
    match client.compile(&source)? {
        CompileReply::Document(pdf) => {
            match output {
                Some(path) => std::fs::write(path, &pdf)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(&pdf)?;
                    out.flush()?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        CompileReply::ErrorCode(code) => {
            eprintln!("pdflatexd: compilation failed with code {code}");
            Ok(ExitCode::from(EXIT_COMPILE_FAILED))
        }
    }
}
