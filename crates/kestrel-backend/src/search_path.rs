use std::path::{Path, PathBuf};

use kestrel_core::RequestOptions;

/// `site-packages` of a virtual environment, if it has one.
pub fn venv_site_packages(venv: &Path) -> Option<PathBuf> {
    if cfg!(windows) {
        let dir = venv.join("Lib").join("site-packages");
        return dir.is_dir().then_some(dir);
    }

    let mut versions: Vec<PathBuf> = std::fs::read_dir(venv.join("lib"))
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("python"))
        .map(|entry| entry.path().join("site-packages"))
        .filter(|dir| dir.is_dir())
        .collect();
    versions.sort();
    versions.pop()
}

/// The directory a buffer's imports are rooted at.
///
/// Walks up from the file's directory while `__init__.py` exists and returns the first
/// directory outside the package. A file that is not in a package but sits next to
/// sub-packages is its own root. Returns `None` when neither applies.
pub fn package_root(filename: &Path) -> Option<PathBuf> {
    let dirname = filename.parent()?;
    let mut scan = dirname;
    while scan.join("__init__.py").is_file() {
        match scan.parent() {
            Some(parent) => scan = parent,
            None => break,
        }
    }

    if scan != dirname {
        return Some(scan.to_path_buf());
    }

    let has_subpackage = std::fs::read_dir(dirname)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.path().join("__init__.py").is_file())
        })
        .unwrap_or(false);
    has_subpackage.then(|| dirname.to_path_buf())
}

/// Search path for one request.
///
/// Order: the file's package root, the virtual environment's `site-packages`, the
/// backend's base path, the file's directory, then the request's extra paths.
pub fn request_search_path(
    base: &[PathBuf],
    venv_site: Option<&Path>,
    filename: Option<&Path>,
    options: Option<&RequestOptions>,
) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::with_capacity(base.len() + 4);
    if let Some(site) = venv_site {
        paths.push(site.to_path_buf());
    }
    paths.extend(base.iter().cloned());

    if let Some(filename) = filename {
        if let Some(root) = package_root(filename) {
            if !paths.contains(&root) {
                paths.insert(0, root);
            }
        }
        if let Some(dirname) = filename.parent() {
            paths.push(dirname.to_path_buf());
        }
    }

    if let Some(options) = options {
        paths.extend(options.extra_path.iter().cloned());
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn package_root_is_outside_the_package() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("proj/app/__init__.py"));
        touch(&dir.path().join("proj/app/views/__init__.py"));
        let file = dir.path().join("proj/app/views/index.py");
        touch(&file);

        assert_eq!(package_root(&file), Some(dir.path().join("proj")));
    }

    #[test]
    fn script_next_to_subpackages_is_its_own_root() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("tool/lib/__init__.py"));
        let script = dir.path().join("tool/main.py");
        touch(&script);

        assert_eq!(package_root(&script), Some(dir.path().join("tool")));

        let lonely = dir.path().join("lonely/script.py");
        touch(&lonely);
        assert_eq!(package_root(&lonely), None);
    }

    #[test]
    fn request_path_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("proj/app/__init__.py"));
        let file = dir.path().join("proj/app/models.py");
        touch(&file);

        let base = vec![PathBuf::from("/usr/lib/python3")];
        let options = RequestOptions {
            extra_path: vec![PathBuf::from("/extra")],
            synthetic: None,
        };
        let paths = request_search_path(
            &base,
            Some(Path::new("/venv/site")),
            Some(&file),
            Some(&options),
        );

        assert_eq!(
            paths,
            vec![
                dir.path().join("proj"),
                PathBuf::from("/venv/site"),
                PathBuf::from("/usr/lib/python3"),
                dir.path().join("proj/app"),
                PathBuf::from("/extra"),
            ]
        );
    }

    #[test]
    fn finds_versioned_site_packages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib/python3.11/site-packages")).unwrap();

        assert_eq!(
            venv_site_packages(dir.path()),
            Some(dir.path().join("lib/python3.11/site-packages"))
        );
        assert_eq!(venv_site_packages(&dir.path().join("missing")), None);
    }
}
