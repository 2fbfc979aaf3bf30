//! Public types shared between the client and its host.
//!
//! The host reads [`ClientState`], receives [`ClientEvent`]s, and gets
//! [`Hover`] and [`CompletionItem`] values back from queries.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How much of the JSON-RPC traffic is written to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    /// Method names and ids only.
    Messages,
    /// Full message bodies.
    Verbose,
}

impl TraceLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Messages => "messages",
            Self::Verbose => "verbose",
        }
    }
}

/// Lifecycle of a language client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Inactive,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Why the server went away without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStopReason {
    /// The server closed its stdout.
    Exited,
    /// The stream from the server could not be read.
    Failed(String),
}

/// Severity of a `window/logMessage` or `window/showMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageType {
    Error = 1,
    Warning = 2,
    Info = 3,
    Log = 4,
}

impl MessageType {
    /// Convert from the LSP numeric value.
    ///
    /// Unknown values are treated as plain log output.
    #[must_use]
    pub fn from_lsp(value: u64) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Log,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Log => "log",
        }
    }
}

/// Something the server told the client outside a request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `window/logMessage`.
    LogMessage { kind: MessageType, message: String },
    /// `window/showMessage`; meant for the user rather than the log.
    ShowMessage { kind: MessageType, message: String },
    /// The server process ended or its stream broke.
    ServerStopped { reason: ServerStopReason },
}

/// Zero-based line and UTF-16 column, as LSP counts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Hover result with markup flattened to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hover {
    pub contents: String,
}

/// A completion candidate offered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionItem {
    pub label: String,
    pub detail: Option<String>,
    pub documentation: Option<String>,
}

/// Kind of change reported for a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeType {
    Created = 1,
    Changed = 2,
    Deleted = 3,
}

/// A change to a file matching the client's watch pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileChangeType,
}
