use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single completion candidate produced by the analysis engine.
///
/// Candidates are immutable once produced; presentation (abbreviation, docstring
/// trimming) is left to the editor layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Source file the name was defined in, when known.
    #[serde(default)]
    pub module: Option<PathBuf>,
    pub name: String,
    /// Kind tag (`function`, `class`, `module`, `statement`, `keyword`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Call signature parameters for callables.
    #[serde(default)]
    pub params: Option<Vec<String>>,
    #[serde(default)]
    pub doc: Option<String>,
}

impl Candidate {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            module: None,
            name: name.into(),
            kind: kind.into(),
            description: String::new(),
            params: None,
            doc: None,
        }
    }

    pub fn keyword(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: format!("keyword {name}"),
            ..Self::new(name, "keyword")
        }
    }

    pub fn with_module(mut self, module: impl Into<PathBuf>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_params(mut self, params: Vec<String>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

/// Fallback source handed to the engine when the real buffer yields nothing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticSource {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

/// Request-specific options carried alongside a completion request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Extra search paths for module resolution.
    #[serde(default)]
    pub extra_path: Vec<PathBuf>,
    #[serde(default)]
    pub synthetic: Option<SyntheticSource>,
}

impl RequestOptions {
    pub fn is_empty(&self) -> bool {
        self.extra_path.is_empty() && self.synthetic.is_none()
    }
}
