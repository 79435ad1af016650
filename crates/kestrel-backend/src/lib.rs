//! The Kestrel backend server.
//!
//! Runs as a child process of a `BackendClient`, reading framed completion requests on
//! stdin and writing one framed response per request on stdout. Completion itself is
//! delegated to a [`CompletionEngine`]; the server adds the per-request search path, the
//! decorator-stripping retry and the scoped / synthetic / module fallback chain.

mod engine;
mod lexical;
mod search_path;
mod server;

pub use engine::{members_of, module_remainder, CompletionEngine, Definition, EngineError, Query};
pub use lexical::{parse_definitions, LexicalEngine};
pub use search_path::{package_root, request_search_path, venv_site_packages};
pub use server::{strip_decorators, Server};
