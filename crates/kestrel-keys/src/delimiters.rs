//! Bracket and quote balancing for the text left of the cursor.

const QUOTES: [char; 2] = ['"', '\''];

fn closer_for(c: char) -> Option<char> {
    match c {
        '(' => Some(')'),
        '{' => Some('}'),
        '[' => Some(']'),
        '"' => Some('"'),
        '\'' => Some('\''),
        _ => None,
    }
}

fn opener_for(c: char) -> Option<char> {
    match c {
        ')' => Some('('),
        '}' => Some('{'),
        ']' => Some('['),
        '"' => Some('"'),
        '\'' => Some('\''),
        _ => None,
    }
}

/// Result of scanning a line fragment for delimiters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Balance {
    pub balanced: bool,
    /// Innermost delimiter still open at the end of the text (or at the first mismatch).
    pub open: Option<char>,
}

/// Tests whether `text` has balanced brackets and quotes.
///
/// Backslash escapes the following character. Brackets inside an open string are ignored.
pub fn balance(text: &str) -> Balance {
    let mut stack: Vec<char> = Vec::new();
    let mut skip = false;
    let mut open = None;
    let mut open_str: Option<char> = None;

    for c in text.chars() {
        if c == '\\' {
            skip = true;
            continue;
        }
        if skip {
            skip = false;
            continue;
        }

        match closer_for(c) {
            Some(closer) if open_str.is_none() => {
                if QUOTES.contains(&closer) {
                    open_str = Some(closer);
                }
                open = Some(c);
                stack.push(closer);
            }
            _ => {
                if opener_for(c).is_none() {
                    continue;
                }
                if open_str == Some(c) {
                    open_str = None;
                }
                if open_str.is_none() && stack.pop() != Some(c) {
                    return Balance {
                        balanced: false,
                        open,
                    };
                }
                open = stack.last().and_then(|closer| opener_for(*closer));
            }
        }
    }

    Balance {
        balanced: stack.is_empty(),
        open,
    }
}

/// Extracts the object whose attribute is being completed.
///
/// `os.path.jo` yields `os.path`; `re.search(x.spl` yields `x`. Returns `None` when the
/// trailing expression has no dot or the cursor sits inside an unterminated string.
pub fn split_module(text: &str) -> Option<&str> {
    let mut text = text;
    let balance = balance(text);
    if !balance.balanced {
        match balance.open {
            Some(open) if !QUOTES.contains(&open) => {
                if let Some(idx) = text.rfind(open) {
                    text = &text[idx + open.len_utf8()..];
                }
            }
            _ => return None,
        }
    }

    let start = text
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(idx, c)| idx + c.len_utf8())
        .unwrap_or(0);
    let trailing = &text[start..];
    trailing.rsplit_once('.').map(|(object, _)| object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_text() {
        assert!(balance("foo(bar[0], {1: 2})").balanced);
        assert!(balance(r#"x = "(" + y"#).balanced);
        assert!(balance(r#"x = "a\"b""#).balanced);
    }

    #[test]
    fn reports_innermost_open_delimiter() {
        assert_eq!(
            balance("foo(bar[0"),
            Balance {
                balanced: false,
                open: Some('[')
            }
        );
        assert_eq!(balance("x = 'abc").open, Some('\''));
    }

    #[test]
    fn mismatched_closer_is_unbalanced() {
        assert!(!balance("foo)").balanced);
        assert!(!balance("foo(]").balanced);
    }

    #[test]
    fn split_module_examples() {
        assert_eq!(split_module("foo.ba"), Some("foo"));
        assert_eq!(split_module("x = os.path.jo"), Some("os.path"));
        assert_eq!(split_module("re.search(x.spl"), Some("x"));
        assert_eq!(split_module("call(a, b.c"), Some("b"));
        assert_eq!(split_module("foo"), None);
        assert_eq!(split_module("x = 'os.pa"), None);
        assert_eq!(split_module("foo."), Some("foo"));
    }
}
