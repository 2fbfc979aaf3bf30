//! Launch descriptors for the `safety-lsp` process.
//!
//! A descriptor is pure data: which executable, where to run it, and which
//! variables to add to its environment. Turning it into a process happens in
//! [`LaunchDescriptor::command`], which is the only place the executable is
//! looked up.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::error::ClientError;
use crate::settings::Settings;

/// Executable used when `SAFETY_LSP` is not set.
pub const DEFAULT_SERVER_COMMAND: &str = "safety-lsp";

/// Always passed to the server so it skips its own environment check.
pub const DISABLE_CHECK_VAR: &str = "SP_DISABLE_CHECK";

/// Names the server binary to run instead of [`DEFAULT_SERVER_COMMAND`].
pub const SERVER_OVERRIDE_VAR: &str = "SAFETY_LSP";

/// Points the server at a tag specification file.
pub const SPEC_FILE_VAR: &str = "SP_FILE";

/// Executable, working directory, and environment for the server process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchDescriptor {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl LaunchDescriptor {
    /// Resolve the descriptor from settings and the open workspace folders.
    ///
    /// The working directory is the first folder, or unset when none is
    /// open. User overrides win over the fixed `SP_DISABLE_CHECK=1`.
    #[must_use]
    pub fn resolve(settings: &Settings, workspace_folders: &[PathBuf]) -> Self {
        let command = settings
            .server_override()
            .unwrap_or(DEFAULT_SERVER_COMMAND)
            .to_string();

        let mut env = BTreeMap::from([(DISABLE_CHECK_VAR.to_string(), "1".to_string())]);
        env.extend(settings.env_overrides());

        Self {
            command,
            cwd: workspace_folders.first().cloned(),
            env,
        }
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Locate the executable.
    ///
    /// Bare names are searched on `PATH`, preferring a `PATH` given in the
    /// descriptor's own environment. Relative paths are taken relative to the
    /// working directory.
    pub fn resolve_program(&self) -> Result<PathBuf, ClientError> {
        let search_path: Option<OsString> = self
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| env::var_os("PATH"));

        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => env::current_dir().map_err(|source| ClientError::Spawn {
                command: self.command.clone(),
                source,
            })?,
        };

        which::which_in(&self.command, search_path, cwd).map_err(|source| {
            ClientError::ServerNotFound {
                command: self.command.clone(),
                source,
            }
        })
    }

    /// Build the process command with piped stdio.
    ///
    /// The child inherits the host environment with the descriptor's
    /// variables layered on top, and is killed if its handle is dropped.
    pub fn command(&self) -> Result<Command, ClientError> {
        let program = self.resolve_program()?;
        let mut cmd = Command::new(program);
        cmd.envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }
}

/// Which of the two launch configurations to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchMode {
    #[default]
    Run,
    Debug,
}

/// Launch configurations for normal and debug sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerOptions {
    pub run: LaunchDescriptor,
    pub debug: LaunchDescriptor,
}

impl ServerOptions {
    /// Use one descriptor for both modes.
    #[must_use]
    pub fn same(descriptor: LaunchDescriptor) -> Self {
        Self {
            run: descriptor.clone(),
            debug: descriptor,
        }
    }

    #[must_use]
    pub fn select(&self, mode: LaunchMode) -> &LaunchDescriptor {
        match mode {
            LaunchMode::Run => &self.run,
            LaunchMode::Debug => &self.debug,
        }
    }
}
