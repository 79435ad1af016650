//! Backend process management for Kestrel.
//!
//! - [`BackendClient`] owns one long-lived backend process and speaks the framed protocol
//!   from `kestrel-remote-proto` over its stdio.
//! - [`run_command`] runs short-lived probes (interpreter version, `sys.path`) with bounded
//!   output and a timeout.

mod backend;
mod command;
mod interpreter;

pub use backend::{BackendClient, BackendCommand, BackendError, ClientOptions};
pub use command::{run_command, sibling_executable, BoundedOutput, CommandResult, RunOptions};
pub use interpreter::{
    interpreter_sys_path, interpreter_version, parse_version, resolve_interpreter,
    InterpreterError,
};
