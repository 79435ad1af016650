//! Cache key derivation.
//!
//! Maps a buffer context (the text left of the cursor, the buffer's lines and its path) to
//! a [`CacheKey`] plus the set of files whose modification times decide whether a cached
//! result for that key may still be served.
//!
//! Derivation is pure apart from `stat()`-style existence checks used to classify modules.

mod delimiters;
mod imports;
mod module_search;
mod position;
mod scope;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use kestrel_core::CacheKey;
use regex::Regex;
use sha2::{Digest, Sha256};

pub use delimiters::{balance, split_module, Balance};
pub use imports::full_module;
pub use module_search::{find_module_file, ModuleResolver, SysPathResolver};
pub use position::complete_position;
pub use scope::scope_chain;

/// What the editor knows about the cursor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorContext {
    /// Text of the current line left of the cursor.
    pub input: String,
    /// 1-based line number of the cursor.
    pub line: usize,
    /// The partial word being completed.
    pub complete_str: String,
    /// The editor's working directory, searched for local modules.
    pub cwd: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedKey {
    /// `None` when the request is not cacheable.
    pub key: Option<CacheKey>,
    /// Files whose mtimes must be unchanged for a cached entry to be trusted.
    pub dependencies: Vec<PathBuf>,
}

impl DerivedKey {
    fn none() -> Self {
        Self {
            key: None,
            dependencies: Vec::new(),
        }
    }

    fn new(key: CacheKey, dependencies: Vec<PathBuf>) -> Self {
        Self {
            key: Some(key),
            dependencies,
        }
    }
}

/// Stable, filesystem-safe digest of a buffer path.
pub fn file_hash(filename: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_os_str().as_encoded_bytes());
    hex::encode(hasher.finalize())
}

fn from_statement_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^from\s+(\S+)(.*)$").expect("from statement regex should compile"))
}

fn import_token_junk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\s\w.]").expect("import token regex should compile"))
}

fn has_key_material(input: &str) -> bool {
    input
        .chars()
        .any(|c| !(c.is_whitespace() || c.is_ascii_digit() || c == '.'))
}

/// Derives cache keys for one interpreter environment.
pub struct KeyDeriver<'a> {
    resolver: &'a dyn ModuleResolver,
    extra_path: &'a [PathBuf],
}

impl<'a> KeyDeriver<'a> {
    pub fn new(resolver: &'a dyn ModuleResolver, extra_path: &'a [PathBuf]) -> Self {
        Self {
            resolver,
            extra_path,
        }
    }

    pub fn derive(&self, filename: &Path, cursor: &CursorContext, source: &[String]) -> DerivedKey {
        let input = cursor.input.trim_start().trim_start_matches('@');
        if !has_key_material(input) {
            return DerivedKey::none();
        }

        if input.starts_with("import ") || input.starts_with("from ") {
            return self.derive_import(filename, cursor, input);
        }

        let trimmed = input.trim();
        if let Some(object) = split_module(trimmed) {
            return self.derive_dotted(filename, cursor, source, object);
        }

        if !cursor.complete_str.is_empty() || input.trim_end().ends_with('=') {
            let key = CacheKey::ScopedVars {
                file_hash: file_hash(filename),
                scope: scope_chain(source, cursor.line, false),
            };
            return DerivedKey::new(key, vec![filename.to_path_buf()]);
        }

        DerivedKey::none()
    }

    fn local_search_dirs(&self, filename: &Path, cwd: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.extra_path.to_vec();
        dirs.extend(cwd.map(Path::to_path_buf));
        dirs.extend(filename.parent().map(Path::to_path_buf));
        dirs
    }

    /// Classifies a module for import-line completion: local files win over packages.
    fn classify_module(
        &self,
        module: &str,
        filename: &Path,
        cwd: Option<&Path>,
    ) -> Option<(CacheKey, Vec<PathBuf>)> {
        let dirs = self.local_search_dirs(filename, cwd);
        if let Some(module_file) = find_module_file(module, &dirs) {
            let key = CacheKey::Local {
                module: module.to_owned(),
            };
            return Some((key, vec![module_file]));
        }
        if self.resolver.is_package(module) {
            let key = CacheKey::Package {
                module: module.to_owned(),
            };
            return Some((key, Vec::new()));
        }
        None
    }

    fn derive_import(&self, filename: &Path, cursor: &CursorContext, input: &str) -> DerivedKey {
        let cwd = cursor.cwd.as_deref();

        if let Some(caps) = from_statement_re().captures(input) {
            let module = caps.get(1).map_or("", |m| m.as_str());
            let rest = caps.get(2).map_or("", |m| m.as_str());

            if rest.is_empty() {
                // Still typing the module name: complete submodules of its parent.
                return match module.rsplit_once('.') {
                    Some((parent, _)) if !parent.trim_end_matches('.').is_empty() => {
                        let parent = parent.trim_end_matches('.');
                        match self.classify_module(parent, filename, cwd) {
                            Some((key, deps)) => DerivedKey::new(key, deps),
                            None => DerivedKey::new(CacheKey::Import, Vec::new()),
                        }
                    }
                    _ => DerivedKey::new(CacheKey::Import, Vec::new()),
                };
            }

            if "import".starts_with(rest.trim_start()) {
                return DerivedKey::new(CacheKey::ImportKeyword, Vec::new());
            }

            let mut dependencies = vec![filename.to_path_buf()];
            let dirs = self.local_search_dirs(filename, cwd);
            dependencies.extend(find_module_file(module, &dirs));
            let key = CacheKey::From {
                module: module.to_owned(),
            };
            return DerivedKey::new(key, dependencies);
        }

        // `import a.b.` asks for the submodules of `a.b`; anything else is a bare name.
        if !input.trim_end().ends_with('.') {
            return DerivedKey::new(CacheKey::Import, Vec::new());
        }
        let cleaned = import_token_junk_re().replace_all(input.trim(), " ");
        let Some(token) = cleaned.split_whitespace().last() else {
            return DerivedKey::none();
        };
        let module = token.trim_end_matches('.');
        if module.is_empty() {
            return DerivedKey::none();
        }
        match self.classify_module(module, filename, cwd) {
            Some((key, deps)) => DerivedKey::new(key, deps),
            None => DerivedKey::none(),
        }
    }

    fn derive_dotted(
        &self,
        filename: &Path,
        cursor: &CursorContext,
        source: &[String],
        object: &str,
    ) -> DerivedKey {
        let buffer_dependency = vec![filename.to_path_buf()];

        if object == "self" || object.starts_with("self.") {
            // Instance attributes depend on the enclosing class, not on the method.
            let key = CacheKey::ScopedDot {
                file_hash: file_hash(filename),
                scope: scope_chain(source, cursor.line, true),
                object: object.to_owned(),
            };
            return DerivedKey::new(key, buffer_dependency);
        }

        if let Some(module_path) = full_module(source, object) {
            let mut dirs: Vec<PathBuf> = filename.parent().map(Path::to_path_buf).into_iter().collect();
            dirs.extend(self.extra_path.iter().cloned());
            if let Some(module_file) = find_module_file(&module_path, &dirs) {
                let mut dependencies = buffer_dependency;
                dependencies.push(module_file);
                return DerivedKey::new(CacheKey::Local { module: module_path }, dependencies);
            }
            if !module_path.starts_with('.') && self.resolver.is_package(&module_path) {
                return DerivedKey::new(CacheKey::Package { module: module_path }, Vec::new());
            }
        }

        let key = CacheKey::ScopedDot {
            file_hash: file_hash(filename),
            scope: scope_chain(source, cursor.line, false),
            object: object.to_owned(),
        };
        DerivedKey::new(key, buffer_dependency)
    }
}
