use std::sync::OnceLock;

use regex::Regex;

fn block_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:def|class)\s+(\w+)").expect("block header regex should compile")
    })
}

fn class_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*class\s+(\w+)").expect("class header regex should compile"))
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Names of the `def`/`class` blocks enclosing `line` (1-based), outermost first.
///
/// Scans upward and takes every non-blank line whose indentation is smaller than the
/// smallest seen so far. Mixed tabs and spaces or multi-line headers can attribute a
/// line to the wrong block; that only costs cache sharing, never correctness.
pub fn scope_chain(source: &[String], line: usize, class_only: bool) -> Vec<String> {
    if line == 0 || line > source.len() {
        return Vec::new();
    }

    let pattern = if class_only {
        class_header_re()
    } else {
        block_header_re()
    };

    let start = line - 1;
    let mut indent = indent_of(&source[start]);
    let mut parents = Vec::new();
    for text in source[..start].iter().rev() {
        if indent == 0 {
            break;
        }
        let stripped = text.trim_start();
        let line_indent = text.len() - stripped.len();
        if stripped.is_empty() || line_indent >= indent {
            continue;
        }
        indent = line_indent;
        if let Some(name) = pattern.captures(stripped).and_then(|caps| caps.get(1)) {
            parents.push(name.as_str().to_owned());
        }
    }
    parents.reverse();
    parents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_owned).collect()
    }

    #[test]
    fn nested_functions() {
        let source = lines("def outer():\n    def inner():\n        foo.ba\n");
        assert_eq!(scope_chain(&source, 3, false), vec!["outer", "inner"]);
    }

    #[test]
    fn skips_siblings_and_blank_lines() {
        let source = lines(
            "class A:\n    def first(self):\n        pass\n\n    def second(self):\n        x = 1\n\n        self.x\n",
        );
        assert_eq!(scope_chain(&source, 8, false), vec!["A", "second"]);
        assert_eq!(scope_chain(&source, 8, true), vec!["A"]);
    }

    #[test]
    fn module_level_has_no_scope() {
        let source = lines("import os\nos.pa\n");
        assert!(scope_chain(&source, 2, false).is_empty());
    }

    #[test]
    fn out_of_range_line_is_empty() {
        let source = lines("x = 1\n");
        assert!(scope_chain(&source, 0, false).is_empty());
        assert!(scope_chain(&source, 5, false).is_empty());
    }

    #[test]
    fn deeper_blocks_do_not_enclose() {
        let source = lines("def f():\n    if x:\n        def g():\n            pass\n    y.\n");
        assert_eq!(scope_chain(&source, 5, false), vec!["f"]);
    }
}
