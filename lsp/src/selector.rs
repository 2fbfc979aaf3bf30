//! Which documents the client forwards to the server.

use std::path::Path;

use url::Url;

/// Language id of Rust sources.
pub const RUST_LANGUAGE_ID: &str = "rust";

/// Language id for a path, inferred from its extension.
#[must_use]
pub fn language_id_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    let id = match ext.to_ascii_lowercase().as_str() {
        "rs" => RUST_LANGUAGE_ID,
        "toml" => "toml",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "py" => "python",
        _ => return None,
    };
    Some(id)
}

/// One clause of a [`DocumentSelector`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub scheme: Option<String>,
    pub language: Option<String>,
}

impl DocumentFilter {
    /// Files on disk in the given language.
    pub fn file_language(language: impl Into<String>) -> Self {
        Self {
            scheme: Some("file".to_string()),
            language: Some(language.into()),
        }
    }

    fn matches(&self, uri: &Url, language_id: &str) -> bool {
        self.scheme.as_deref().is_none_or(|s| s == uri.scheme())
            && self.language.as_deref().is_none_or(|l| l == language_id)
    }
}

/// A document is selected when any filter matches it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    #[must_use]
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        Self { filters }
    }

    /// Rust files on disk.
    #[must_use]
    pub fn rust_files() -> Self {
        Self::new(vec![DocumentFilter::file_language(RUST_LANGUAGE_ID)])
    }

    #[must_use]
    pub fn matches(&self, uri: &Url, language_id: &str) -> bool {
        self.filters.iter().any(|f| f.matches(uri, language_id))
    }

    #[must_use]
    pub fn filters(&self) -> &[DocumentFilter] {
        &self.filters
    }
}
