use std::ffi::OsString;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use kestrel_core::Candidate;
use kestrel_remote_proto::{
    read_message, write_message, BackendMessage, CompletionRequest, EngineVersion, Handshake,
    ProtocolError, PROTOCOL_VERSION,
};
use parking_lot::Mutex;

use crate::command::{kill_process_group, own_process_group, terminate_process_tree};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to spawn backend {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backend did not send a handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("backend handshake failed: {0}")]
    Handshake(#[source] ProtocolError),
    #[error("backend exited")]
    Exited,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// How to launch a backend process.
#[derive(Clone, Debug)]
pub struct BackendCommand {
    pub program: PathBuf,
    /// Arguments passed before the interpreter flag.
    pub args: Vec<String>,
    /// Interpreter whose environment the engine analyses.
    pub interpreter: Option<PathBuf>,
    /// Engine library and project paths appended to the child's `PYTHONPATH`.
    pub python_path: Vec<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl BackendCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            interpreter: None,
            python_path: Vec::new(),
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn python_path(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.python_path.extend(paths);
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// `PYTHONPATH` for the child: the inherited value followed by `python_path`.
    fn joined_python_path(&self) -> Option<OsString> {
        if self.python_path.is_empty() {
            return None;
        }
        let inherited = std::env::var_os("PYTHONPATH").filter(|v| !v.is_empty());
        let paths = inherited
            .iter()
            .flat_map(std::env::split_paths)
            .chain(self.python_path.iter().cloned());
        std::env::join_paths(paths).ok()
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(interpreter) = &self.interpreter {
            cmd.arg("--interpreter").arg(interpreter);
        }
        if let Some(log_file) = &self.log_file {
            cmd.arg("--log-file").arg(log_file);
        }
        if let Some(python_path) = self.joined_python_path() {
            cmd.env("PYTHONPATH", python_path);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        own_process_group(&mut cmd);
        cmd
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Completions served before the process is proactively replaced.
    pub max_completions: u32,
    pub handshake_timeout: Duration,
    /// Grace period between closing stdin and killing a process being replaced.
    pub shutdown_grace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_completions: 50,
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(200),
        }
    }
}

struct BackendProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    engine: EngineVersion,
    completions: u32,
}

impl BackendProcess {
    fn start(command: &BackendCommand, handshake_timeout: Duration) -> Result<Self, BackendError> {
        let mut child = command.build().spawn().map_err(|source| BackendError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = terminate_process_tree(&mut child, Duration::ZERO);
            return Err(BackendError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::other("backend stdio was not captured"),
            });
        };

        // Read the handshake on a helper thread so a silent child cannot block us forever.
        let (tx, rx) = crossbeam_channel::bounded(1);
        let reader = std::thread::spawn(move || {
            let mut stdout = BufReader::new(stdout);
            let handshake = read_message::<_, BackendMessage>(&mut stdout);
            let _ = tx.send(());
            (stdout, handshake)
        });

        if rx.recv_timeout(handshake_timeout).is_err() {
            let _ = terminate_process_tree(&mut child, Duration::ZERO);
            let _ = reader.join();
            return Err(BackendError::HandshakeTimeout(handshake_timeout));
        }
        let (stdout, handshake) = match reader.join() {
            Ok(result) => result,
            Err(_) => {
                let _ = terminate_process_tree(&mut child, Duration::ZERO);
                return Err(BackendError::Exited);
            }
        };

        let engine = match handshake {
            Ok(Some(BackendMessage::Handshake(Handshake {
                protocol_version,
                engine,
            }))) if protocol_version == PROTOCOL_VERSION => engine,
            Ok(Some(BackendMessage::Handshake(Handshake {
                protocol_version, ..
            }))) => {
                let _ = terminate_process_tree(&mut child, Duration::ZERO);
                return Err(BackendError::Handshake(ProtocolError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    found: protocol_version,
                }));
            }
            Ok(Some(BackendMessage::Completions(_))) => {
                let _ = terminate_process_tree(&mut child, Duration::ZERO);
                return Err(BackendError::Handshake(ProtocolError::UnexpectedMessage(
                    "completions before handshake",
                )));
            }
            Ok(None) => {
                let _ = terminate_process_tree(&mut child, Duration::ZERO);
                return Err(BackendError::Exited);
            }
            Err(err) => {
                let _ = terminate_process_tree(&mut child, Duration::ZERO);
                return Err(BackendError::Handshake(err));
            }
        };

        tracing::debug!(
            target: "kestrel.process",
            pid = child.id(),
            engine = %engine,
            "backend ready"
        );
        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout,
            engine,
            completions: 0,
        })
    }

    fn request(&mut self, request: &CompletionRequest) -> Result<Option<Vec<Candidate>>, BackendError> {
        write_message(&mut self.stdin, request)?;
        match read_message::<_, BackendMessage>(&mut self.stdout)? {
            Some(BackendMessage::Completions(candidates)) => {
                self.completions += 1;
                Ok(candidates)
            }
            Some(BackendMessage::Handshake(_)) => Err(ProtocolError::UnexpectedMessage(
                "handshake in response to a request",
            )
            .into()),
            None => Err(BackendError::Exited),
        }
    }

    /// Closes stdin (the clean shutdown signal) and kills the process if it lingers.
    fn shutdown(self, grace: Duration) {
        let Self {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        let pid = child.id();
        match terminate_process_tree(&mut child, grace) {
            Ok(status) => {
                tracing::debug!(target: "kestrel.process", pid, %status, "backend stopped")
            }
            Err(err) => {
                tracing::debug!(target: "kestrel.process", pid, error = %err, "failed to reap backend")
            }
        }
    }
}

/// Synchronous client for one backend process.
///
/// Calls are serialized by the process lock; a crashed or desynchronized process is
/// replaced before the next request. [`BackendClient::interrupt`] does not take the lock,
/// so a supervisor can unblock a request stuck on a hung process.
pub struct BackendClient {
    command: BackendCommand,
    options: ClientOptions,
    process: Mutex<Option<BackendProcess>>,
    current_pid: AtomicU32,
    restarts: AtomicU64,
}

impl BackendClient {
    /// Starts the backend and waits for its handshake.
    pub fn spawn(command: BackendCommand, options: ClientOptions) -> Result<Self, BackendError> {
        let process = BackendProcess::start(&command, options.handshake_timeout)?;
        let pid = process.child.id();
        Ok(Self {
            command,
            options,
            process: Mutex::new(Some(process)),
            current_pid: AtomicU32::new(pid),
            restarts: AtomicU64::new(0),
        })
    }

    fn replace(&self, slot: &mut Option<BackendProcess>) -> Result<(), BackendError> {
        if let Some(old) = slot.take() {
            self.current_pid.store(0, Ordering::SeqCst);
            old.shutdown(self.options.shutdown_grace);
        }
        let process = BackendProcess::start(&self.command, self.options.handshake_timeout)?;
        self.current_pid.store(process.child.id(), Ordering::SeqCst);
        self.restarts.fetch_add(1, Ordering::Relaxed);
        *slot = Some(process);
        Ok(())
    }

    /// Sends one request and waits for its response.
    ///
    /// On a protocol error or crash the process is replaced and the error returned; the
    /// request is not retried.
    pub fn completions(
        &self,
        request: &CompletionRequest,
    ) -> Result<Option<Vec<Candidate>>, BackendError> {
        let mut slot = self.process.lock();

        let needs_start = match slot.as_ref() {
            None => true,
            Some(process) => process.completions >= self.options.max_completions,
        };
        if needs_start {
            if slot.is_some() {
                tracing::debug!(
                    target: "kestrel.process",
                    max = self.options.max_completions,
                    "completion ceiling reached; restarting backend"
                );
            }
            self.replace(&mut *slot)?;
        }

        let Some(process) = slot.as_mut() else {
            return Err(BackendError::Exited);
        };
        match process.request(request) {
            Ok(candidates) => Ok(candidates),
            Err(err) if self.pid() == 0 => {
                // Interrupted by a supervisor, which owns the restart.
                if let Some(process) = slot.take() {
                    process.shutdown(Duration::ZERO);
                }
                Err(err)
            }
            Err(err) => {
                tracing::warn!(
                    target: "kestrel.process",
                    key = %request.cache_key,
                    error = %err,
                    "backend request failed; restarting"
                );
                if let Err(restart_err) = self.replace(&mut *slot) {
                    tracing::error!(
                        target: "kestrel.process",
                        error = %restart_err,
                        "failed to restart backend"
                    );
                }
                Err(err)
            }
        }
    }

    /// Kills the current process without taking the process lock.
    ///
    /// A request blocked on the process observes EOF and fails; call [`Self::restart`]
    /// afterwards to bring up a replacement.
    pub fn interrupt(&self) {
        let pid = self.current_pid.swap(0, Ordering::SeqCst);
        if pid != 0 {
            tracing::debug!(target: "kestrel.process", pid, "interrupting backend");
            kill_process_group(pid);
        }
    }

    /// Replaces the backend process, blocking until the new handshake is read.
    pub fn restart(&self) -> Result<(), BackendError> {
        let mut slot = self.process.lock();
        self.replace(&mut *slot)
    }

    pub fn shutdown(&self) {
        let mut slot = self.process.lock();
        self.current_pid.store(0, Ordering::SeqCst);
        if let Some(process) = slot.take() {
            process.shutdown(self.options.shutdown_grace);
        }
    }

    /// Engine version reported by the current process's handshake.
    pub fn engine_version(&self) -> Option<EngineVersion> {
        self.process.lock().as_ref().map(|p| p.engine.clone())
    }

    /// Pid of the current process, or 0 while none is running.
    pub fn pid(&self) -> u32 {
        self.current_pid.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

impl Drop for BackendClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
