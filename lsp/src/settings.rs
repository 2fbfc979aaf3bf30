//! The `safety-tool` settings namespace.
//!
//! Settings come from TOML files holding a single `[safety-tool]` table:
//!
//! ```toml
//! [safety-tool]
//! trace = "messages"
//! env = { SAFETY_LSP = "./target/debug/safety-lsp", SP_FILE = "${workspaceFolder}/tags.toml" }
//! ```
//!
//! Files are layered user → workspace → explicit. `env` tables merge per key
//! with later files winning. Everything is validated here so the launch code
//! only ever sees well-formed environment entries.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::launch::{SERVER_OVERRIDE_VAR, SPEC_FILE_VAR};
use crate::types::TraceLevel;

pub const SETTINGS_NAMESPACE: &str = "safety-tool";

/// Settings file looked up at the root of the first workspace folder.
pub const WORKSPACE_SETTINGS_FILE: &str = ".safety-tool.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings at {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings at {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid environment variable name {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("value of environment variable {key} contains a NUL byte")]
    InvalidValue { key: String },
    #[error("SAFETY_LSP is set but empty")]
    EmptyServerOverride,
}

impl SettingsError {
    /// The file the error came from, when there is one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => Some(path),
            Self::InvalidKey { .. } | Self::InvalidValue { .. } | Self::EmptyServerOverride => {
                None
            }
        }
    }
}

/// Environment values may be written as strings, integers, or booleans.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Text(String),
    Integer(i64),
    Flag(bool),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Integer(n) => n.to_string(),
            Self::Flag(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsSection {
    #[serde(default)]
    env: BTreeMap<String, EnvValue>,
    trace: Option<TraceLevel>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(rename = "safety-tool")]
    section: Option<SettingsSection>,
}

/// A settings file to consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsSource {
    path: PathBuf,
    required: bool,
}

impl SettingsSource {
    /// Skipped silently when the file does not exist.
    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }

    /// A missing file is an error.
    pub fn required(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: true,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `~/.safety-tool/settings.toml`.
#[must_use]
pub fn user_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".safety-tool").join("settings.toml"))
}

/// The usual lookup order: user file, workspace file, then `explicit`.
#[must_use]
pub fn default_sources(
    workspace_root: Option<&Path>,
    explicit: Option<&Path>,
) -> Vec<SettingsSource> {
    let mut sources = Vec::new();
    if let Some(path) = user_settings_path() {
        sources.push(SettingsSource::optional(path));
    }
    if let Some(root) = workspace_root {
        sources.push(SettingsSource::optional(root.join(WORKSPACE_SETTINGS_FILE)));
    }
    if let Some(path) = explicit {
        sources.push(SettingsSource::required(path));
    }
    sources
}

/// Expand `${workspaceFolder}` and `${env:NAME}` in a settings value.
///
/// Unknown variables, and `${workspaceFolder}` with no folder open, are left
/// as written. A missing environment variable expands to nothing.
#[must_use]
pub fn substitute_variables(value: &str, workspace_root: Option<&Path>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        let verbatim = &rest[start..start + 2 + end + 1];

        match (name, name.strip_prefix("env:")) {
            (_, Some(var)) => out.push_str(&env::var(var).unwrap_or_default()),
            ("workspaceFolder", None) => match workspace_root {
                Some(root) => out.push_str(&root.to_string_lossy()),
                None => out.push_str(verbatim),
            },
            _ => out.push_str(verbatim),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn validate_entry(key: &str, value: &str) -> Result<(), SettingsError> {
    let reason = if key.is_empty() {
        Some("name is empty")
    } else if key.contains('=') {
        Some("name contains '='")
    } else if key.contains('\0') {
        Some("name contains a NUL byte")
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(SettingsError::InvalidKey {
            key: key.to_string(),
            reason,
        });
    }
    if value.contains('\0') {
        return Err(SettingsError::InvalidValue {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Validated contents of the `safety-tool` namespace.
///
/// The two variables the client itself cares about are pulled out of the
/// environment table; [`Settings::env_overrides`] puts them back so the
/// server sees exactly what the user wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    server_override: Option<String>,
    spec_file: Option<String>,
    extra_env: BTreeMap<String, String>,
    trace: TraceLevel,
}

impl Settings {
    /// Build settings from an already-merged environment table.
    pub fn from_env(env: BTreeMap<String, String>) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        for (key, value) in env {
            validate_entry(&key, &value)?;
            match key.as_str() {
                SERVER_OVERRIDE_VAR => {
                    if value.trim().is_empty() {
                        return Err(SettingsError::EmptyServerOverride);
                    }
                    settings.server_override = Some(value);
                }
                SPEC_FILE_VAR => settings.spec_file = Some(value),
                _ => {
                    settings.extra_env.insert(key, value);
                }
            }
        }
        Ok(settings)
    }

    /// Parse a single settings document.
    pub fn parse(
        text: &str,
        origin: &Path,
        workspace_root: Option<&Path>,
    ) -> Result<Self, SettingsError> {
        let section = parse_section(text, origin)?;
        Self::merge(vec![section], workspace_root)
    }

    /// Read and merge `sources` in order.
    pub fn load(
        sources: &[SettingsSource],
        workspace_root: Option<&Path>,
    ) -> Result<Self, SettingsError> {
        let mut sections = Vec::new();
        for source in sources {
            let text = match fs::read_to_string(&source.path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound && !source.required => {
                    tracing::trace!(path = %source.path.display(), "No settings file");
                    continue;
                }
                Err(err) => {
                    return Err(SettingsError::Read {
                        path: source.path.clone(),
                        source: err,
                    });
                }
            };
            tracing::debug!(path = %source.path.display(), "Loaded settings");
            sections.push(parse_section(&text, &source.path)?);
        }
        Self::merge(sections, workspace_root)
    }

    fn merge(
        sections: Vec<SettingsSection>,
        workspace_root: Option<&Path>,
    ) -> Result<Self, SettingsError> {
        let mut env = BTreeMap::new();
        let mut trace = TraceLevel::default();
        for section in sections {
            for (key, value) in section.env {
                let value = substitute_variables(&value.into_string(), workspace_root);
                env.insert(key, value);
            }
            if let Some(level) = section.trace {
                trace = level;
            }
        }
        Ok(Self::from_env(env)?.with_trace(trace))
    }

    pub fn with_trace(mut self, trace: TraceLevel) -> Self {
        self.trace = trace;
        self
    }

    /// Binary named by `SAFETY_LSP`, if the user set one.
    #[must_use]
    pub fn server_override(&self) -> Option<&str> {
        self.server_override.as_deref()
    }

    /// Tag specification path from `SP_FILE`, if the user set one.
    #[must_use]
    pub fn spec_file(&self) -> Option<&str> {
        self.spec_file.as_deref()
    }

    #[must_use]
    pub fn trace(&self) -> TraceLevel {
        self.trace
    }

    /// Every user-supplied environment variable, recognised keys included.
    #[must_use]
    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        let mut env = self.extra_env.clone();
        if let Some(server) = &self.server_override {
            env.insert(SERVER_OVERRIDE_VAR.to_string(), server.clone());
        }
        if let Some(spec) = &self.spec_file {
            env.insert(SPEC_FILE_VAR.to_string(), spec.clone());
        }
        env
    }
}

fn parse_section(text: &str, origin: &Path) -> Result<SettingsSection, SettingsError> {
    let file: SettingsFile = toml::from_str(text).map_err(|source| SettingsError::Parse {
        path: origin.to_path_buf(),
        source,
    })?;
    Ok(file.section.unwrap_or_default())
}
