//! Errors surfaced by the language client.

use crate::protocol::PathToUriError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The executable could not be located.
    #[error("{command} not found")]
    ServerNotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The server rejected `initialize` or never answered it.
    #[error("server initialization failed: {0}")]
    Initialize(String),
    /// An operation needed a running server and there is none.
    #[error("language client is not running")]
    NotRunning,
    #[error("invalid file watch pattern: {0}")]
    Pattern(String),
    #[error("failed to watch workspace files")]
    Watch(#[from] notify_debouncer_mini::notify::Error),
    #[error(transparent)]
    Uri(#[from] PathToUriError),
    /// Communication with the server broke down.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
