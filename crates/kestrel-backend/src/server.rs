use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use kestrel_core::{CacheKey, Candidate};
use kestrel_keys::find_module_file;
use kestrel_remote_proto::{
    read_message, write_message, BackendMessage, CompletionRequest, Handshake, ProtocolError,
};
use regex::Regex;

use crate::engine::{members_of, module_remainder, CompletionEngine, EngineError, Query};
use crate::search_path::{request_search_path, venv_site_packages};

/// Blanks decorator names at the start of lines, leaving any call arguments behind.
pub fn strip_decorators(source: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?m)^([ \t]*)@\w+").expect("decorator regex should compile"));
    re.replace_all(source, "${1}").into_owned()
}

/// Runs `attempt`, retrying once on stripped source if it fails and the source has a
/// decorator. Failures are logged and become `None`.
fn with_decorator_retry<E, T>(
    engine: &mut E,
    what: &'static str,
    source: &str,
    mut attempt: impl FnMut(&mut E, &str) -> Result<T, EngineError>,
) -> Option<T> {
    let err = match attempt(engine, source) {
        Ok(value) => return Some(value),
        Err(err) => err,
    };
    if source.contains('@') {
        tracing::warn!(target: "kestrel.backend", what, error = %err, "retrying without decorators");
        match attempt(engine, &strip_decorators(source)) {
            Ok(value) => return Some(value),
            Err(err) => {
                tracing::warn!(target: "kestrel.backend", what, error = %err, "completion failed");
                return None;
            }
        }
    }
    tracing::warn!(target: "kestrel.backend", what, error = %err, "completion failed");
    None
}

fn is_empty(out: &Option<Vec<Candidate>>) -> bool {
    out.as_ref().map_or(true, Vec::is_empty)
}

/// Keeps the first candidate for each `(name, kind)` pair.
fn dedup_by_name_and_kind(candidates: impl IntoIterator<Item = Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert((candidate.name.clone(), candidate.kind.clone())))
        .collect()
}

/// Request loop hosting one [`CompletionEngine`].
pub struct Server<E> {
    engine: E,
    base_path: Vec<PathBuf>,
    venv_site: Option<PathBuf>,
    unresolved_imports: HashSet<String>,
}

impl<E: CompletionEngine> Server<E> {
    /// `base_path` is the module search path every request starts from.
    pub fn new(engine: E, base_path: Vec<PathBuf>) -> Self {
        Self {
            engine,
            base_path,
            venv_site: None,
            unresolved_imports: HashSet::new(),
        }
    }

    /// Puts the virtual environment's `site-packages` in front of every search path.
    pub fn with_virtual_env(mut self, venv: Option<&Path>) -> Self {
        self.venv_site = venv.and_then(venv_site_packages);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Writes the handshake, then answers requests until `reader` reaches a clean EOF.
    pub fn run<R: Read, W: Write>(&mut self, mut reader: R, mut writer: W) -> Result<(), ProtocolError> {
        let engine = self.engine.version();
        tracing::debug!(target: "kestrel.backend", engine = %engine, base_path = ?self.base_path, "starting server");
        write_message(&mut writer, &BackendMessage::Handshake(Handshake::new(engine)))?;

        while let Some(request) = read_message::<_, CompletionRequest>(&mut reader)? {
            let out = self.handle(&request);
            write_message(&mut writer, &BackendMessage::Completions(out))?;
        }
        tracing::debug!(target: "kestrel.backend", "input closed; shutting down");
        Ok(())
    }

    /// Answers one request, falling back through scoped, synthetic and module completions
    /// while the previous step produced nothing.
    pub fn handle(&mut self, request: &CompletionRequest) -> Option<Vec<Candidate>> {
        let span = tracing::debug_span!("kestrel.backend.request", key = %request.cache_key);
        let _guard = span.enter();

        let filename = request.filename.as_deref();
        let options = request.options.as_ref();
        let search_path = request_search_path(
            &self.base_path,
            self.venv_site.as_deref(),
            filename,
            options,
        );

        let mut out = self.script_completion(&request.source, request.line, request.column, filename, &search_path);

        if is_empty(&out) {
            if let CacheKey::ScopedVars { scope, .. } = &request.cache_key {
                tracing::debug!(target: "kestrel.backend", "falling back to scoped completions");
                out = self.scoped_completions(&request.source, filename, scope, &search_path);
            }
        }

        if is_empty(&out) {
            if let Some(synthetic) = options.and_then(|options| options.synthetic.as_ref()) {
                tracing::debug!(target: "kestrel.backend", line = synthetic.line, column = synthetic.column, "using synthetic source");
                out = self.script_completion(
                    &synthetic.source,
                    synthetic.line,
                    synthetic.column,
                    filename,
                    &search_path,
                );
            }
        }

        if is_empty(&out) {
            if let Some(module) = request.cache_key.module() {
                tracing::debug!(target: "kestrel.backend", module, "falling back to module completions");
                match self.module_completions(module, &search_path) {
                    Ok(Some(candidates)) => out = Some(candidates),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(target: "kestrel.backend", module, error = %err, "module completions failed")
                    }
                }
            }
        }

        out
    }

    fn script_completion(
        &mut self,
        source: &str,
        line: u32,
        column: u32,
        filename: Option<&Path>,
        search_path: &[PathBuf],
    ) -> Option<Vec<Candidate>> {
        with_decorator_retry(&mut self.engine, "script", source, |engine, source| {
            engine.complete(&Query {
                source,
                line,
                column,
                filename,
                search_path,
            })
        })
    }

    /// Every definition visible from `scope`, independent of the cursor position.
    fn scoped_completions(
        &mut self,
        source: &str,
        filename: Option<&Path>,
        scope: &[String],
        search_path: &[PathBuf],
    ) -> Option<Vec<Candidate>> {
        let definitions = with_decorator_retry(&mut self.engine, "scoped", source, |engine, source| {
            engine.definitions(source, filename)
        })?;

        let mut out = Vec::new();
        for definition in definitions {
            let parents = &definition.parents;
            if parents.len() > scope.len() || !scope.starts_with(parents) {
                continue;
            }
            let Some(target) = definition.import_target.as_deref() else {
                out.push(definition.candidate);
                continue;
            };
            if self.unresolved_imports.contains(target) {
                continue;
            }
            match self.engine.resolve_import(&definition, search_path) {
                Some(resolved) => out.push(resolved.candidate),
                None => {
                    tracing::debug!(target: "kestrel.backend", import = target, "could not resolve import");
                    self.unresolved_imports.insert(target.to_owned());
                }
            }
        }
        Some(dedup_by_name_and_kind(out))
    }

    /// Names defined in the file of `module`, narrowed to the components the file path
    /// does not cover. `None` if the module file cannot be found.
    fn module_completions(
        &mut self,
        module: &str,
        search_path: &[PathBuf],
    ) -> Result<Option<Vec<Candidate>>, EngineError> {
        let Some(file) = find_module_file(module, search_path) else {
            return Ok(None);
        };
        tracing::debug!(target: "kestrel.backend", file = %file.display(), "found module file");

        let source = std::fs::read_to_string(&file).map_err(|source| EngineError::Io {
            path: file.clone(),
            source,
        })?;
        let definitions = self.engine.definitions(&source, Some(&file))?;
        let remainder = module_remainder(module, &file);
        let Some(members) = members_of(&definitions, &remainder) else {
            tracing::debug!(target: "kestrel.backend", remainder = ?remainder, "no definitions left to match");
            return Ok(Some(Vec::new()));
        };
        Ok(Some(dedup_by_name_and_kind(
            members.into_iter().map(|definition| definition.candidate.clone()),
        )))
    }
}
