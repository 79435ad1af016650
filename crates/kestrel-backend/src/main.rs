use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kestrel_backend::{LexicalEngine, Server};
use kestrel_config::{init_tracing, LoggingConfig};

#[derive(Parser)]
#[command(name = "kestrel-backend", version, about = "Kestrel completion backend (speaks the framed protocol on stdio)")]
struct Args {
    /// Interpreter whose `sys.path` seeds module resolution
    #[arg(long)]
    interpreter: Option<PathBuf>,
    /// Append logs to this file (stdout is reserved for the protocol)
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Log level or `EnvFilter` directives
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Timeout for the interpreter `sys.path` probe, in milliseconds
    #[arg(long, default_value_t = 5000)]
    probe_timeout_ms: u64,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "kestrel.backend", error = ?err, "backend exiting");
            eprintln!("kestrel-backend: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn base_path(args: &Args) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::env::var_os("PYTHONPATH")
        .map(|value| std::env::split_paths(&value).collect())
        .unwrap_or_default();

    if let Some(interpreter) = &args.interpreter {
        let timeout = Duration::from_millis(args.probe_timeout_ms);
        match kestrel_process::interpreter_sys_path(interpreter, timeout) {
            Ok(sys_path) => {
                for path in sys_path {
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
            Err(err) => tracing::warn!(
                target: "kestrel.backend",
                interpreter = %interpreter.display(),
                error = %err,
                "failed to read interpreter sys.path"
            ),
        }
    }
    paths.retain(|path| !path.as_os_str().is_empty() && path.is_dir());
    paths
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing(&LoggingConfig {
        level: args.log_level.clone(),
        json: false,
        stderr: false,
        file: args.log_file.clone(),
    });

    let venv = std::env::var_os("VIRTUAL_ENV")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);
    let mut server = Server::new(LexicalEngine::new(), base_path(&args)).with_virtual_env(venv.as_deref());

    let stdin = io::stdin();
    let stdout = io::stdout();
    server
        .run(BufReader::new(stdin.lock()), BufWriter::new(stdout.lock()))
        .context("backend protocol error")
}
