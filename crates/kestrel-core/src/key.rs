use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the semantic scope of a completion request.
///
/// Two requests with equal keys are expected to produce equal candidates, modulo the
/// freshness of the key's dependency files.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKey {
    /// `import ` statements without a resolvable module token.
    Import,
    /// `from X imp|`: the only sensible completion is the `import` keyword.
    ImportKeyword,
    /// Names that are always available (builtins), merged into variable completions.
    Boilerplate,
    /// An uncacheable request routed through the pool under an ephemeral id.
    Direct { id: u64 },
    /// A module found on the interpreter's search path.
    Package { module: String },
    /// A module found relative to the buffer or an extra search path.
    Local { module: String },
    /// Names importable from `module` in a `from module import ...` statement.
    From { module: String },
    /// Attribute access on `object` inside a lexical scope of one file.
    ScopedDot {
        file_hash: String,
        scope: Vec<String>,
        object: String,
    },
    /// Bare-name completion inside a lexical scope of one file.
    ScopedVars { file_hash: String, scope: Vec<String> },
}

/// Category of a [`CacheKey`], used for eviction and freshness policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyCategory {
    Import,
    ImportKeyword,
    Boilerplate,
    Direct,
    Package,
    Local,
    From,
    Dot,
    Vars,
}

impl KeyCategory {
    /// The trailing tag of the key's tuple form.
    pub fn tag(self) -> &'static str {
        match self {
            KeyCategory::Import => "import~",
            KeyCategory::ImportKeyword => "importkeyword~",
            KeyCategory::Boilerplate => "boilerplate~",
            KeyCategory::Direct => "direct~",
            KeyCategory::Package => "package",
            KeyCategory::Local => "local",
            KeyCategory::From => "from",
            KeyCategory::Dot => "dot",
            KeyCategory::Vars => "vars",
        }
    }

    /// Low-cardinality categories that the reaper never evicts.
    pub fn is_reaper_exempt(self) -> bool {
        matches!(
            self,
            KeyCategory::Package
                | KeyCategory::Local
                | KeyCategory::Boilerplate
                | KeyCategory::Import
        )
    }

    /// Scoped categories track live edits, so a cached entry is only ever a placeholder.
    pub fn is_always_stale(self) -> bool {
        matches!(self, KeyCategory::Dot | KeyCategory::Vars)
    }
}

impl CacheKey {
    pub fn category(&self) -> KeyCategory {
        match self {
            CacheKey::Import => KeyCategory::Import,
            CacheKey::ImportKeyword => KeyCategory::ImportKeyword,
            CacheKey::Boilerplate => KeyCategory::Boilerplate,
            CacheKey::Direct { .. } => KeyCategory::Direct,
            CacheKey::Package { .. } => KeyCategory::Package,
            CacheKey::Local { .. } => KeyCategory::Local,
            CacheKey::From { .. } => KeyCategory::From,
            CacheKey::ScopedDot { .. } => KeyCategory::Dot,
            CacheKey::ScopedVars { .. } => KeyCategory::Vars,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.category().tag()
    }

    /// Module name for module-scoped keys.
    pub fn module(&self) -> Option<&str> {
        match self {
            CacheKey::Package { module } | CacheKey::Local { module } | CacheKey::From { module } => {
                Some(module)
            }
            _ => None,
        }
    }

    /// Lexical scope chain for scope-tagged keys (outermost first).
    pub fn scope(&self) -> Option<&[String]> {
        match self {
            CacheKey::ScopedDot { scope, .. } | CacheKey::ScopedVars { scope, .. } => Some(scope),
            _ => None,
        }
    }

    /// Whether results for this key are written to the cache store at all.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, CacheKey::Direct { .. })
    }

    /// Whether the key shadows to disk (module results keyed by module name alone).
    pub fn is_persisted(&self) -> bool {
        matches!(self, CacheKey::Package { .. })
    }

    /// Sentinels answered by the dispatcher without consulting a backend.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, CacheKey::Import | CacheKey::ImportKeyword)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Import | CacheKey::ImportKeyword | CacheKey::Boilerplate => {
                write!(f, "({:?},)", self.tag())
            }
            CacheKey::Direct { id } => write!(f, "({id}, {:?})", self.tag()),
            CacheKey::Package { module } | CacheKey::Local { module } | CacheKey::From { module } => {
                write!(f, "({module:?}, {:?})", self.tag())
            }
            CacheKey::ScopedDot {
                file_hash,
                scope,
                object,
            } => write!(f, "({file_hash:?}, {scope:?}, {object:?}, {:?})", self.tag()),
            CacheKey::ScopedVars { file_hash, scope } => {
                write!(f, "({file_hash:?}, {scope:?}, {:?})", self.tag())
            }
        }
    }
}
