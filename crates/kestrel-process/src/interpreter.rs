use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::command::{run_command, RunOptions};

#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: PathBuf, timeout: Duration },
    #[error("{program} exited with {status}")]
    Failed { program: PathBuf, status: String },
    #[error("could not find a version number in {output:?}")]
    UnrecognizedVersion { output: String },
}

/// Interpreter used for analysis.
///
/// An active virtual environment wins over the configured path; the final fallback is
/// `python` on `PATH`.
pub fn resolve_interpreter(configured: Option<&Path>) -> PathBuf {
    if let Some(venv) = std::env::var_os("VIRTUAL_ENV").filter(|v| !v.is_empty()) {
        let venv = PathBuf::from(venv);
        let candidate = if cfg!(windows) {
            venv.join("Scripts").join("python.exe")
        } else {
            venv.join("bin").join("python")
        };
        if candidate.exists() {
            return candidate;
        }
        tracing::debug!(
            target: "kestrel.process",
            venv = %venv.display(),
            "VIRTUAL_ENV has no interpreter; ignoring"
        );
    }
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("python"))
}

fn probe(python: &Path, args: &[&str], timeout: Duration) -> Result<(String, String), InterpreterError> {
    let opts = RunOptions {
        timeout: Some(timeout),
        ..RunOptions::default()
    };
    let result = run_command(python, args, None, &opts).map_err(|source| InterpreterError::Io {
        program: python.to_path_buf(),
        source,
    })?;
    if result.timed_out {
        return Err(InterpreterError::TimedOut {
            program: python.to_path_buf(),
            timeout,
        });
    }
    if !result.status.success() {
        return Err(InterpreterError::Failed {
            program: python.to_path_buf(),
            status: result.status.to_string(),
        });
    }
    Ok((result.output.stdout, result.output.stderr))
}

/// Extracts `major.minor` from `Python 3.12.1`-style output.
pub fn parse_version(output: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+\.\d+)\.").expect("version regex should compile"));
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}

/// `major.minor` of the interpreter. Old interpreters print `-V` to stderr.
pub fn interpreter_version(python: &Path, timeout: Duration) -> Result<String, InterpreterError> {
    let (stdout, stderr) = probe(python, &["-V"], timeout)?;
    let output = if stdout.trim().is_empty() { stderr } else { stdout };
    parse_version(&output).ok_or(InterpreterError::UnrecognizedVersion { output })
}

/// The interpreter's `sys.path`, keeping only existing directories.
pub fn interpreter_sys_path(python: &Path, timeout: Duration) -> Result<Vec<PathBuf>, InterpreterError> {
    let (stdout, _) = probe(
        python,
        &["-c", "import sys; print('\\n'.join(sys.path))"],
        timeout,
    )?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .filter(|path| path.is_dir())
        .collect())
}
