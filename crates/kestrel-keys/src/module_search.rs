use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Decides whether a module name refers to an installed package.
///
/// Implemented by [`SysPathResolver`] for real interpreters; tests substitute fixed sets.
pub trait ModuleResolver: Send + Sync {
    fn is_package(&self, module: &str) -> bool;
}

/// Resolves packages against an interpreter's `sys.path`.
#[derive(Clone, Debug, Default)]
pub struct SysPathResolver {
    paths: Vec<PathBuf>,
}

impl SysPathResolver {
    /// Keeps only entries that are existing directories.
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().filter(|p| p.is_dir()).collect(),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl ModuleResolver for SysPathResolver {
    fn is_package(&self, module: &str) -> bool {
        if module.is_empty()
            || !module
                .chars()
                .all(|c| c == '.' || c == '_' || c.is_alphanumeric())
        {
            return false;
        }
        let Some(top) = module.split('.').next().filter(|top| !top.is_empty()) else {
            return false;
        };
        let prefix = format!("{top}.");

        self.paths.iter().any(|dir| {
            if dir.join(top).join("__init__.py").is_file() {
                return true;
            }
            // `top.py`, `top.pyi`, `top.cpython-312-x86_64-linux-gnu.so`, ...
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries.flatten().any(|entry| {
                        entry
                            .file_name()
                            .to_str()
                            .is_some_and(|name| name.starts_with(&prefix))
                    })
                })
                .unwrap_or(false)
        })
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn with_py_extension(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".py");
    PathBuf::from(name)
}

/// Finds the source file of `module` under one of `dirs`.
///
/// The dotted name may carry trailing attribute names (`pkg.mod.Class`): the search walks
/// upward from the deepest candidate until a `pkg/__init__.py` or `pkg.py` exists, stopping
/// at the top-level package. Leading dots are relative-import levels (`..pkg` is `../pkg`).
pub fn find_module_file<P: AsRef<Path>>(module: &str, dirs: &[P]) -> Option<PathBuf> {
    let trimmed = module.trim_start_matches('.');
    let levels = module.len() - trimmed.len();
    let parts: Vec<&str> = trimmed.split('.').filter(|p| !p.is_empty()).collect();
    let base = *parts.first()?;

    let mut relative = PathBuf::new();
    for _ in 1..levels {
        relative.push("..");
    }
    relative.extend(&parts);

    for dir in dirs {
        let mut search = normalize_lexically(&dir.as_ref().join(&relative));
        loop {
            let init = search.join("__init__.py");
            if init.is_file() {
                return Some(init);
            }
            let file = with_py_extension(&search);
            if file.is_file() {
                return Some(file);
            }
            if search.file_name().is_some_and(|name| name == base) {
                break;
            }
            if !search.pop() {
                break;
            }
        }
    }
    None
}
