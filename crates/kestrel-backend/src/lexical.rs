//! A lexical completion engine.
//!
//! Understands just enough of the language to be useful without an external analysis
//! library: block structure by indentation, `def`/`class` headers, assignments, imports and
//! `self.x = ...` attributes. Module files are located through the request's search path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use kestrel_core::{Candidate, KESTREL_VERSION};
use kestrel_keys::{find_module_file, full_module, scope_chain};
use kestrel_remote_proto::EngineVersion;
use regex::Regex;

use crate::engine::{members_of, module_remainder, CompletionEngine, Definition, EngineError, Query};

/// How many import hops `resolve_import` follows before giving up.
const MAX_IMPORT_DEPTH: usize = 10;

const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs", "all", "any", "callable", "dir", "enumerate", "filter", "getattr", "hasattr",
    "hash", "id", "isinstance", "issubclass", "iter", "len", "map", "max", "min", "next",
    "open", "print", "repr", "round", "setattr", "sorted", "sum", "vars", "zip",
];

const BUILTIN_CLASSES: &[&str] = &[
    "bool", "bytes", "dict", "Exception", "float", "frozenset", "int", "list", "object",
    "property", "range", "set", "str", "super", "tuple", "type",
];

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del",
    "elif", "else", "except", "False", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "None", "nonlocal", "not", "or", "pass", "raise", "return", "True",
    "try", "while", "with", "yield",
];

macro_rules! lazy_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("lexical engine regex should compile"))
        }
    };
}

lazy_regex!(decorator_re, r"^@([\w.]+)");
lazy_regex!(def_re, r"^(?:async\s+)?def\s+(\w+)\s*(?:\((.*))?");
lazy_regex!(class_re, r"^class\s+(\w+)\s*(?:\(([^)]*)\))?");
lazy_regex!(import_re, r"^import\s+(.+)");
lazy_regex!(from_import_re, r"^from\s+([\w.]+)\s+import\s+(.+)");
lazy_regex!(
    assign_re,
    r"^([A-Za-z_]\w*(?:\s*,\s*[A-Za-z_]\w*)*)\s*(?::[^=]*)?=(?:[^=]|$)"
);
lazy_regex!(self_attr_re, r"\bself\.(\w+)\s*(?::[^=]*)?=(?:[^=]|$)");
lazy_regex!(
    import_line_re,
    r"^\s*(?:import\s+(?:[\w.]+\s*,\s*)*|from\s+)([\w.]*)$"
);
lazy_regex!(
    from_names_re,
    r"^\s*from\s+([\w.]+)\s+import\s+\(?(?:[\w\s]+,\s*)*(\w*)$"
);
lazy_regex!(dotted_re, r"([A-Za-z_][\w.]*)\.(\w*)$");
lazy_regex!(word_re, r"(\w*)$");

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Function,
    Class,
}

struct Block {
    indent: usize,
    name: String,
    kind: BlockKind,
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Text of the first line of a docstring opening right after line `header`.
fn docstring_after(lines: &[&str], header: usize) -> Option<String> {
    let next = lines[header + 1..].iter().find(|line| !line.trim().is_empty())?;
    let trimmed = next.trim();
    let body = trimmed
        .strip_prefix("\"\"\"")
        .or_else(|| trimmed.strip_prefix("'''"))?;
    let body = body
        .trim_end_matches("\"\"\"")
        .trim_end_matches("'''")
        .trim();
    (!body.is_empty()).then(|| body.to_owned())
}

/// Parameter list of a `def` header, `self` excluded.
fn split_params(raw: &str) -> Vec<String> {
    let mut depth = 0usize;
    let mut end = raw.len();
    for (idx, ch) in raw.char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' if depth == 0 => {
                end = idx;
                break;
            }
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
    }

    let mut params: Vec<String> = raw[..end]
        .split(',')
        .map(|param| param.trim().to_owned())
        .filter(|param| !param.is_empty())
        .collect();
    if params.first().is_some_and(|first| first == "self") {
        params.remove(0);
    }
    params
}

/// Bare name bound by a parameter (`*args: int = 1` binds `args`).
fn param_name(param: &str) -> Option<&str> {
    let name = param
        .trim_start_matches('*')
        .split(|c: char| c == ':' || c == '=')
        .next()?
        .trim();
    (!name.is_empty() && name != "/").then_some(name)
}

/// `a.b as c` binds `c` to `a.b`; plain `a.b` binds `a` to `a`.
fn import_bindings(clause: &str) -> Vec<(String, String)> {
    clause
        .split(',')
        .filter_map(|item| {
            let mut words = item.split_whitespace();
            let target = words.next()?;
            match (words.next(), words.next()) {
                (Some("as"), Some(alias)) => Some((alias.to_owned(), target.to_owned())),
                _ => {
                    let head = target.split('.').next().unwrap_or(target);
                    Some((head.to_owned(), head.to_owned()))
                }
            }
        })
        .collect()
}

/// `x as y` from module `m` binds `y` to `m.x`.
fn from_bindings(module: &str, clause: &str) -> Vec<(String, String)> {
    clause
        .trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace())
        .split(',')
        .filter_map(|item| {
            let mut words = item.split_whitespace();
            let name = words.next()?.trim_matches(|c: char| c == '(' || c == ')');
            if name.is_empty() || name == "*" {
                return None;
            }
            let bound = match (words.next(), words.next()) {
                (Some("as"), Some(alias)) => alias,
                _ => name,
            };
            Some((bound.to_owned(), format!("{module}.{name}")))
        })
        .collect()
}

/// Parses every definition in `source`.
///
/// A decorator that is not followed by another decorator or a `def`/`class` header is a
/// syntax error; half-typed decorators are the usual cause.
pub fn parse_definitions(source: &str, filename: Option<&Path>) -> Result<Vec<Definition>, EngineError> {
    let lines: Vec<&str> = source.lines().collect();
    let mut stack: Vec<Block> = Vec::new();
    let mut defs = Vec::new();
    let mut decorators: Vec<(usize, String)> = Vec::new();

    let located = |candidate: Candidate| match filename {
        Some(path) => candidate.with_module(path),
        None => candidate,
    };

    let mut idx = 0;
    while idx < lines.len() {
        let raw = lines[idx];
        let line = raw.trim_start();
        if line.is_empty() || line.starts_with('#') {
            idx += 1;
            continue;
        }

        let indent = indent_of(raw);
        while stack.last().is_some_and(|block| block.indent >= indent) {
            stack.pop();
        }
        let parents: Vec<String> = stack.iter().map(|block| block.name.clone()).collect();

        if let Some(caps) = decorator_re().captures(line) {
            decorators.push((idx + 1, caps[1].to_owned()));
            idx += 1;
            continue;
        }

        if let Some(caps) = def_re().captures(line) {
            let name = caps[1].to_owned();
            let params = caps.get(2).map(|m| split_params(m.as_str())).unwrap_or_default();
            let kind = if decorators.iter().any(|(_, deco)| deco == "property") {
                "property"
            } else {
                "function"
            };
            let mut candidate = Candidate::new(&name, kind)
                .with_description(format!("def {name}({})", params.join(", ")))
                .with_params(params.clone());
            if let Some(doc) = docstring_after(&lines, idx) {
                candidate = candidate.with_doc(doc);
            }
            defs.push(Definition::new(located(candidate), parents.clone()));

            let mut inner = parents;
            inner.push(name.clone());
            for param in params.iter().filter_map(|param| param_name(param)) {
                let candidate = Candidate::new(param, "param").with_description(format!("param {param}"));
                defs.push(Definition::new(located(candidate), inner.clone()));
            }
            stack.push(Block {
                indent,
                name,
                kind: BlockKind::Function,
            });
            decorators.clear();
            idx += 1;
            continue;
        }

        if let Some(caps) = class_re().captures(line) {
            let name = caps[1].to_owned();
            let description = match caps.get(2) {
                Some(bases) if !bases.as_str().trim().is_empty() => {
                    format!("class {name}({})", bases.as_str().trim())
                }
                _ => format!("class {name}"),
            };
            let mut candidate = Candidate::new(&name, "class").with_description(description);
            if let Some(doc) = docstring_after(&lines, idx) {
                candidate = candidate.with_doc(doc);
            }
            defs.push(Definition::new(located(candidate), parents));
            stack.push(Block {
                indent,
                name,
                kind: BlockKind::Class,
            });
            decorators.clear();
            idx += 1;
            continue;
        }

        if let Some((line_no, deco)) = decorators.first() {
            return Err(EngineError::Syntax {
                line: *line_no,
                message: format!("decorator @{deco} is not followed by a def or class"),
            });
        }

        if let Some(caps) = from_import_re().captures(line) {
            let module = caps[1].to_owned();
            let mut clause = caps[2].to_owned();
            if clause.contains('(') && !clause.contains(')') {
                while idx + 1 < lines.len() {
                    idx += 1;
                    clause.push(' ');
                    clause.push_str(lines[idx].trim());
                    if lines[idx].contains(')') {
                        break;
                    }
                }
            }
            for (bound, target) in from_bindings(&module, &clause) {
                let candidate = Candidate::new(&bound, "import")
                    .with_description(format!("from {module} import {bound}"));
                defs.push(Definition::import(located(candidate), parents.clone(), target));
            }
        } else if let Some(caps) = import_re().captures(line) {
            for (bound, target) in import_bindings(&caps[1]) {
                let candidate =
                    Candidate::new(&bound, "import").with_description(format!("import {target}"));
                defs.push(Definition::import(located(candidate), parents.clone(), target));
            }
        } else if let Some(caps) = assign_re().captures(line) {
            for name in caps[1].split(',').map(str::trim) {
                let candidate = Candidate::new(name, "statement").with_description(line.trim_end());
                defs.push(Definition::new(located(candidate), parents.clone()));
            }
        }

        if let Some(class_depth) = stack.iter().rposition(|block| block.kind == BlockKind::Class) {
            if class_depth + 1 < stack.len() {
                let owner: Vec<String> = stack[..=class_depth]
                    .iter()
                    .map(|block| block.name.clone())
                    .collect();
                for caps in self_attr_re().captures_iter(line) {
                    let candidate = Candidate::new(&caps[1], "instance")
                        .with_description(line.trim_end());
                    defs.push(Definition::new(located(candidate), owner.clone()));
                }
            }
        }
        idx += 1;
    }

    if let Some((line_no, deco)) = decorators.first() {
        return Err(EngineError::Syntax {
            line: *line_no,
            message: format!("decorator @{deco} is not followed by a def or class"),
        });
    }
    Ok(defs)
}

/// Modules and packages directly inside `dir`.
fn submodules(dir: &Path) -> Vec<Candidate> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<Candidate> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                let init = path.join("__init__.py");
                let name = path.file_name()?.to_str()?.to_owned();
                return init
                    .is_file()
                    .then(|| Candidate::new(name, "module").with_module(init));
            }
            if path.extension().is_some_and(|ext| ext == "py") {
                let stem = path.file_stem()?.to_str()?.to_owned();
                if stem != "__init__" {
                    return Some(Candidate::new(stem, "module").with_module(path));
                }
            }
            None
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn keep_prefixed(candidates: Vec<Candidate>, prefix: &str) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| candidate.name.starts_with(prefix))
        .filter(|candidate| seen.insert(candidate.name.clone()))
        .collect()
}

fn builtin_names() -> impl Iterator<Item = Candidate> {
    let functions = BUILTIN_FUNCTIONS
        .iter()
        .map(|name| Candidate::new(*name, "function").with_description(format!("builtins.{name}")));
    let classes = BUILTIN_CLASSES
        .iter()
        .map(|name| Candidate::new(*name, "class").with_description(format!("builtins.{name}")));
    let keywords = KEYWORDS.iter().map(|name| Candidate::keyword(*name));
    functions.chain(classes).chain(keywords)
}

/// The builtin engine: indentation and regular expressions, no evaluation.
#[derive(Debug, Default)]
pub struct LexicalEngine {
    _private: (),
}

impl LexicalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level names of a module file, plus its submodules when it is a package.
    fn file_members(&self, file: &Path, path: &[String]) -> Result<Vec<Candidate>, EngineError> {
        let source = std::fs::read_to_string(file).map_err(|source| EngineError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        let defs = parse_definitions(&source, Some(file))?;
        let mut out: Vec<Candidate> = members_of(&defs, path)
            .unwrap_or_default()
            .into_iter()
            .map(|def| def.candidate.clone())
            .collect();
        if path.is_empty() && file.file_name().is_some_and(|name| name == "__init__.py") {
            if let Some(dir) = file.parent() {
                out.extend(submodules(dir));
            }
        }
        Ok(out)
    }

    fn module_members(&self, module: &str, search_path: &[PathBuf]) -> Result<Vec<Candidate>, EngineError> {
        let Some(file) = find_module_file(module, search_path) else {
            return Ok(Vec::new());
        };
        let remainder = module_remainder(module, &file);
        self.file_members(&file, &remainder)
    }

    fn import_names(&self, token: &str, search_path: &[PathBuf]) -> Vec<Candidate> {
        let (package, prefix) = token.rsplit_once('.').unwrap_or(("", token));
        let mut out = Vec::new();
        if package.is_empty() {
            for dir in search_path {
                out.extend(submodules(dir));
            }
        } else {
            let relative: PathBuf = package.split('.').collect();
            for dir in search_path {
                let candidate = dir.join(&relative);
                if candidate.join("__init__.py").is_file() {
                    out.extend(submodules(&candidate));
                }
            }
        }
        keep_prefixed(out, prefix)
    }

    fn attribute_names(
        &self,
        object: &str,
        lines: &[String],
        line: usize,
        defs: &[Definition],
        search_path: &[PathBuf],
    ) -> Result<Vec<Candidate>, EngineError> {
        if object == "self" {
            let chain = scope_chain(lines, line, false);
            let class_depth = (0..chain.len()).rev().find(|&depth| {
                defs.iter().any(|def| {
                    def.candidate.kind == "class"
                        && def.parents.as_slice() == &chain[..depth]
                        && def.name() == chain[depth]
                })
            });
            let Some(depth) = class_depth else {
                return Ok(Vec::new());
            };
            let owner = &chain[..=depth];
            return Ok(members_of(defs, owner)
                .unwrap_or_default()
                .into_iter()
                .map(|def| def.candidate.clone())
                .collect());
        }

        if let Some(module) = full_module(lines, object) {
            return self.module_members(&module, search_path);
        }

        let last = object.rsplit('.').next().unwrap_or(object);
        let class = defs
            .iter()
            .find(|def| def.candidate.kind == "class" && def.name() == last);
        Ok(match class {
            Some(class) => {
                let mut path = class.parents.clone();
                path.push(last.to_owned());
                members_of(defs, &path)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|def| def.candidate.clone())
                    .collect()
            }
            None => Vec::new(),
        })
    }
}

impl CompletionEngine for LexicalEngine {
    fn version(&self) -> EngineVersion {
        EngineVersion {
            name: "kestrel-lexical".to_owned(),
            version: KESTREL_VERSION.to_owned(),
        }
    }

    fn complete(&mut self, query: &Query<'_>) -> Result<Vec<Candidate>, EngineError> {
        let defs = parse_definitions(query.source, query.filename)?;
        let lines: Vec<String> = query.source.lines().map(str::to_owned).collect();
        let line_no = query.line as usize;
        let text = line_no
            .checked_sub(1)
            .and_then(|idx| lines.get(idx))
            .map(String::as_str)
            .unwrap_or("");
        let mut column = (query.column as usize).min(text.len());
        while !text.is_char_boundary(column) {
            column -= 1;
        }
        let before = &text[..column];

        if let Some(caps) = from_names_re().captures(before) {
            let mut out = self.module_members(&caps[1], query.search_path)?;
            out.extend(self.import_names(&format!("{}.", &caps[1]), query.search_path));
            return Ok(keep_prefixed(out, &caps[2]));
        }
        if let Some(caps) = import_line_re().captures(before) {
            return Ok(self.import_names(&caps[1], query.search_path));
        }
        if let Some(caps) = dotted_re().captures(before) {
            let members = self.attribute_names(&caps[1], &lines, line_no, &defs, query.search_path)?;
            return Ok(keep_prefixed(members, &caps[2]));
        }

        let prefix = word_re()
            .captures(before)
            .and_then(|caps| caps.get(1))
            .map_or("", |m| m.as_str());
        let chain = scope_chain(&lines, line_no, false);
        let visible = defs
            .iter()
            .filter(|def| chain.starts_with(&def.parents))
            .rev()
            .map(|def| def.candidate.clone());
        Ok(keep_prefixed(visible.chain(builtin_names()).collect(), prefix))
    }

    fn definitions(
        &mut self,
        source: &str,
        filename: Option<&Path>,
    ) -> Result<Vec<Definition>, EngineError> {
        parse_definitions(source, filename)
    }

    fn resolve_import(&mut self, definition: &Definition, search_path: &[PathBuf]) -> Option<Definition> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut target = definition.import_target.clone()?;

        for _ in 0..MAX_IMPORT_DEPTH {
            if !seen.insert(target.clone()) {
                return None;
            }
            let file = find_module_file(&target, search_path)?;
            let remainder = module_remainder(&target, &file);
            let Some((name, path)) = remainder.split_last() else {
                let candidate = Candidate::new(definition.name(), "module")
                    .with_description(format!("module {target}"))
                    .with_module(file);
                return Some(Definition::new(candidate, definition.parents.clone()));
            };

            let source = std::fs::read_to_string(&file).ok()?;
            let defs = parse_definitions(&source, Some(&file)).ok()?;
            let found = members_of(&defs, path)?
                .into_iter()
                .find(|def| def.name() == name.as_str())?
                .clone();
            match found.import_target {
                Some(next) => target = next,
                None => {
                    let mut candidate = found.candidate;
                    candidate.name = definition.name().to_owned();
                    return Some(Definition::new(candidate, definition.parents.clone()));
                }
            }
        }
        None
    }
}
