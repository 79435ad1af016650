use std::path::{Path, PathBuf};

use kestrel_core::Candidate;
use kestrel_remote_proto::EngineVersion;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// One position-based completion query.
#[derive(Clone, Copy, Debug)]
pub struct Query<'a> {
    pub source: &'a str,
    /// 1-based line.
    pub line: u32,
    /// 0-based byte column.
    pub column: u32,
    pub filename: Option<&'a Path>,
    /// Module search path assembled for this request, highest priority first.
    pub search_path: &'a [PathBuf],
}

/// A name defined somewhere in a source file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Definition {
    pub candidate: Candidate,
    /// Enclosing `def`/`class` names, outermost first; empty at module level.
    pub parents: Vec<String>,
    /// Dotted target of an import binding (`os.path`, `collections.OrderedDict`).
    pub import_target: Option<String>,
}

impl Definition {
    pub fn new(candidate: Candidate, parents: Vec<String>) -> Self {
        Self {
            candidate,
            parents,
            import_target: None,
        }
    }

    pub fn import(candidate: Candidate, parents: Vec<String>, target: impl Into<String>) -> Self {
        Self {
            candidate,
            parents,
            import_target: Some(target.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.candidate.name
    }

    pub fn is_import(&self) -> bool {
        self.import_target.is_some()
    }
}

/// The analysis engine hosted by the backend server.
///
/// Engines are driven from a single thread and may keep state between calls.
pub trait CompletionEngine {
    fn version(&self) -> EngineVersion;

    /// Candidates at the query position.
    fn complete(&mut self, query: &Query<'_>) -> Result<Vec<Candidate>, EngineError>;

    /// Every definition in `source`, at all scopes.
    fn definitions(
        &mut self,
        source: &str,
        filename: Option<&Path>,
    ) -> Result<Vec<Definition>, EngineError>;

    /// Follows an import binding to what it names, or `None` if it cannot be found.
    fn resolve_import(&mut self, definition: &Definition, search_path: &[PathBuf])
        -> Option<Definition>;
}

/// Components of `module` that are not covered by the path of `file`.
///
/// `pkg.mod.Class` resolved to `.../pkg/mod.py` leaves `["Class"]`; a file that covers the
/// whole name leaves nothing.
pub fn module_remainder(module: &str, file: &Path) -> Vec<String> {
    let module_parts: Vec<&str> = module.split('.').filter(|part| !part.is_empty()).collect();
    let mut path_parts: Vec<String> = file
        .with_extension("")
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if path_parts.last().is_some_and(|last| last == "__init__") {
        path_parts.pop();
    }

    let len = module_parts.len();
    for covered in (1..=len).rev() {
        if ends_with(&path_parts, &module_parts[..covered]) {
            return module_parts[covered..].iter().map(|s| s.to_string()).collect();
        }
    }
    module_parts.iter().map(|s| s.to_string()).collect()
}

fn ends_with(parts: &[String], suffix: &[&str]) -> bool {
    parts.len() >= suffix.len()
        && parts[parts.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(part, expected)| part == expected)
}

/// Definitions directly inside the block named by `path`.
///
/// Every prefix of `path` must itself be defined (`["Outer", "Inner"]` needs `Outer` at
/// module level and `Inner` inside it); otherwise returns `None`.
pub fn members_of<'d>(definitions: &'d [Definition], path: &[String]) -> Option<Vec<&'d Definition>> {
    for depth in 0..path.len() {
        let found = definitions
            .iter()
            .any(|def| def.parents.as_slice() == &path[..depth] && def.name() == path[depth]);
        if !found {
            return None;
        }
    }
    Some(
        definitions
            .iter()
            .filter(|def| def.parents.as_slice() == path)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_strips_the_covered_prefix() {
        let file = Path::new("/site/pkg/mod.py");
        assert_eq!(module_remainder("pkg.mod.Class", file), vec!["Class"]);
        assert!(module_remainder("pkg.mod", file).is_empty());

        let init = Path::new("/site/pkg/__init__.py");
        assert_eq!(module_remainder("pkg.thing", init), vec!["thing"]);
        assert!(module_remainder("pkg", init).is_empty());
    }

    #[test]
    fn members_require_every_enclosing_block() {
        let defs = vec![
            Definition::new(Candidate::new("Outer", "class"), vec![]),
            Definition::new(Candidate::new("method", "function"), vec!["Outer".into()]),
            Definition::new(Candidate::new("helper", "function"), vec![]),
        ];

        let members = members_of(&defs, &["Outer".to_string()]).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name(), "method");

        assert_eq!(members_of(&defs, &[]).unwrap().len(), 2);
        assert!(members_of(&defs, &["Missing".to_string()]).is_none());
    }
}
