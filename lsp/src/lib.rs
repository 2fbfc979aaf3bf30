//! Language client for the `safety-lsp` tag checker.
//!
//! The host activates an [`Extension`], which launches `safety-lsp`, keeps it
//! in sync with open Rust documents and workspace `.clientrc` files, and shuts
//! it down on deactivation.

pub mod codec;
pub mod launch;
pub mod selector;
pub mod settings;
pub mod types;

pub(crate) mod protocol;
pub(crate) mod server;
pub(crate) mod watcher;

mod client;
mod error;
mod extension;

#[cfg(test)]
mod test_support;

pub use client::{ClientHandle, ClientOptions, LanguageClient};
pub use error::ClientError;
pub use extension::{
    CLIENT_ID, CLIENT_NAME, Extension, HostContext, client_options, server_options,
};
pub use launch::{LaunchDescriptor, LaunchMode, ServerOptions};
pub use protocol::PathToUriError;
pub use selector::DocumentSelector;
pub use settings::{Settings, SettingsError, SettingsSource};
pub use types::{
    ClientEvent, ClientState, CompletionItem, FileChangeType, FileEvent, Hover, MessageType,
    Position, ServerStopReason, TraceLevel,
};
pub use watcher::CLIENT_CONFIG_GLOB;
