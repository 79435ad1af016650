use std::sync::OnceLock;

use regex::Regex;

/// Import statements, including parenthesized multi-line ones. `[ \t]` keeps the
/// single-line forms from spanning lines.
fn import_statement_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?m)^[ \t]*(",
            r"from[ \t]+[\w.]+[ \t]+import\s+\([\s\w,]+\)|",
            r"from[ \t]+[\w.]+[ \t]+import[ \t\w,]+|",
            r"import[ \t]+\([\s\w,]+\)|",
            r"import[ \t]+[ \t\w,]+",
            r")"
        ))
        .expect("import statement regex should compile")
    })
}

/// Reconstructs the fully qualified module path of `object` from the buffer's imports.
///
/// `np.linalg` with `import numpy as np` yields `numpy.linalg`; `path.join` with
/// `from os import path` yields `os.path.join`. Returns `None` if no import binds the
/// leading name.
pub fn full_module(source: &[String], object: &str) -> Option<String> {
    let head = object.split('.').next().unwrap_or(object);
    if head.is_empty() {
        return None;
    }
    let binding = Regex::new(&format!(r"(?:(\S+)\s+as\s+)?\b{}\b", regex::escape(head))).ok()?;

    let text = source.join("\n");
    for statement in import_statement_re().find_iter(&text) {
        let normalized = statement.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
        let (module, names) = match normalized.strip_prefix("from ") {
            Some(rest) => match rest.split_once(' ') {
                Some((module, names)) => (Some(module), names),
                None => continue,
            },
            None => (None, normalized.as_str()),
        };

        let Some(caps) = binding.captures(names) else {
            continue;
        };

        let mut object = object.to_owned();
        if let Some(original) = caps.get(1) {
            // Aliased import: key on the real name, not the local alias.
            object = match object.split_once('.') {
                Some((_, tail)) => format!("{}.{tail}", original.as_str()),
                None => original.as_str().to_owned(),
            };
        }
        return Some(match module {
            Some(module) => format!("{module}.{object}"),
            None => object,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    #[test]
    fn plain_import() {
        let source = lines("import os\nimport sys, json\n");
        assert_eq!(full_module(&source, "os.path"), Some("os.path".to_owned()));
        assert_eq!(full_module(&source, "json"), Some("json".to_owned()));
    }

    #[test]
    fn aliased_import_uses_real_name() {
        let source = lines("import numpy as np\n");
        assert_eq!(
            full_module(&source, "np.linalg"),
            Some("numpy.linalg".to_owned())
        );
    }

    #[test]
    fn from_import_prepends_module() {
        let source = lines("from os import path\n");
        assert_eq!(full_module(&source, "path"), Some("os.path".to_owned()));
    }

    #[test]
    fn parenthesized_from_import() {
        let source = lines("from collections import (\n    OrderedDict,\n    defaultdict,\n)\n");
        assert_eq!(
            full_module(&source, "defaultdict"),
            Some("collections.defaultdict".to_owned())
        );
    }

    #[test]
    fn unknown_name() {
        let source = lines("import os\nfoo = 1\n");
        assert_eq!(full_module(&source, "foo"), None);
        assert_eq!(full_module(&source, "osx"), None);
    }
}
