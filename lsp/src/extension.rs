//! Extension lifecycle: activate once, deactivate once.
//!
//! [`Extension`] owns the one client it creates. Deactivation consumes the
//! extension, so a client can only be stopped once and an extension that was
//! never activated has nothing to stop.

use std::future::Future;
use std::path::{Path, PathBuf};

use crate::client::{ClientHandle, ClientOptions, LanguageClient};
use crate::error::ClientError;
use crate::launch::{LaunchDescriptor, LaunchMode, ServerOptions};
use crate::selector::DocumentSelector;
use crate::settings::Settings;
use crate::watcher::CLIENT_CONFIG_GLOB;

/// Identifier of the client, also its settings namespace.
pub const CLIENT_ID: &str = "safety-tool";

/// Human-readable name shown in logs.
pub const CLIENT_NAME: &str = "safety-tool";

/// What the host knows at activation time.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    settings: Settings,
    workspace_folders: Vec<PathBuf>,
    launch_mode: LaunchMode,
}

impl HostContext {
    pub fn new(settings: Settings, workspace_folders: Vec<PathBuf>) -> Self {
        Self {
            settings,
            workspace_folders,
            launch_mode: LaunchMode::Run,
        }
    }

    #[must_use]
    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = mode;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn workspace_folders(&self) -> &[PathBuf] {
        &self.workspace_folders
    }

    /// The first workspace folder, if any.
    pub fn workspace_root(&self) -> Option<&Path> {
        self.workspace_folders.first().map(PathBuf::as_path)
    }

    pub fn launch_mode(&self) -> LaunchMode {
        self.launch_mode
    }
}

/// Run and debug launch the same way.
#[must_use]
pub fn server_options(host: &HostContext) -> ServerOptions {
    ServerOptions::same(LaunchDescriptor::resolve(
        host.settings(),
        host.workspace_folders(),
    ))
}

/// Rust files on disk, with `.clientrc` changes reported to the server.
#[must_use]
pub fn client_options(host: &HostContext) -> ClientOptions {
    ClientOptions {
        document_selector: DocumentSelector::rust_files(),
        file_events: Some(CLIENT_CONFIG_GLOB.to_string()),
        workspace_root: host.workspace_root().map(Path::to_path_buf),
        trace: host.settings().trace(),
    }
}

pub struct Extension<C = LanguageClient> {
    client: Option<C>,
}

impl<C> Default for Extension<C> {
    fn default() -> Self {
        Self { client: None }
    }
}

impl Extension<LanguageClient> {
    /// Create the client and start it.
    ///
    /// A server that fails to start is reported by the client and does not
    /// fail activation; the client is kept so deactivation can still run.
    pub async fn activate(host: &HostContext) -> Self {
        let mode = host.launch_mode();
        Self::activate_with(host, |id, name, server, options| {
            LanguageClient::new(id, name, server, options).with_launch_mode(mode)
        })
        .await
    }
}

impl<C: ClientHandle> Extension<C> {
    /// [`Extension::activate`] with a custom client constructor.
    pub async fn activate_with<F>(host: &HostContext, make_client: F) -> Self
    where
        F: FnOnce(&str, &str, ServerOptions, ClientOptions) -> C,
    {
        let server = server_options(host);
        let options = client_options(host);
        tracing::info!(
            command = server.run.program(),
            cwd = ?server.run.cwd(),
            trace = options.trace.as_str(),
            "Activating {CLIENT_NAME}"
        );

        let mut client = make_client(CLIENT_ID, CLIENT_NAME, server, options);
        if client.start().await.is_err() {
            tracing::debug!("Continuing without a running server");
        }
        Self {
            client: Some(client),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.client.is_some()
    }

    pub fn client(&self) -> Option<&C> {
        self.client.as_ref()
    }

    pub fn client_mut(&mut self) -> Option<&mut C> {
        self.client.as_mut()
    }

    /// Stop the client, if one was created.
    ///
    /// `None` means there was never a client. Otherwise the returned future
    /// completes once the client has stopped.
    pub fn deactivate(
        self,
    ) -> Option<impl Future<Output = Result<(), ClientError>> + Send + 'static> {
        self.client.map(ClientHandle::stop)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::launch::DISABLE_CHECK_VAR;
    use crate::types::{ClientState, TraceLevel};

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct CountingClient {
        counters: Arc<Counters>,
        fail_start: bool,
        server: ServerOptions,
        options: ClientOptions,
    }

    impl ClientHandle for CountingClient {
        async fn start(&mut self) -> Result<(), ClientError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(ClientError::NotRunning);
            }
            Ok(())
        }

        fn stop(self) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
            async move {
                self.counters.stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn activate_counting(
        host: &HostContext,
        fail_start: bool,
    ) -> (Extension<CountingClient>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let shared = counters.clone();
        let extension = Extension::activate_with(host, move |id, name, server, options| {
            assert_eq!(id, CLIENT_ID);
            assert_eq!(name, CLIENT_NAME);
            CountingClient {
                counters: shared,
                fail_start,
                server,
                options,
            }
        })
        .await;
        (extension, counters)
    }

    fn host(env: &[(&str, &str)], folders: &[&str]) -> HostContext {
        let env: BTreeMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let settings = Settings::from_env(env).unwrap();
        HostContext::new(settings, folders.iter().map(PathBuf::from).collect())
    }

    #[test]
    fn test_deactivate_without_activate_is_none() {
        assert!(Extension::<CountingClient>::default().deactivate().is_none());
        assert!(Extension::<LanguageClient>::default().deactivate().is_none());
    }

    #[tokio::test]
    async fn test_activate_starts_once_and_deactivate_stops_once() {
        let (extension, counters) = activate_counting(&host(&[], &["/work"]), false).await;
        assert!(extension.is_active());
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);

        extension.deactivate().unwrap().await.unwrap();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_keeps_client_for_deactivate() {
        let (extension, counters) = activate_counting(&host(&[], &[]), true).await;
        assert!(extension.client().is_some());

        extension.deactivate().unwrap().await.unwrap();
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activate_passes_resolved_options() {
        let (extension, _) = activate_counting(
            &host(
                &[("SAFETY_LSP", "/opt/safety-lsp"), ("RUST_LOG", "debug")],
                &["/work", "/other"],
            ),
            false,
        )
        .await;
        let client = extension.client().unwrap();

        assert_eq!(client.server.run, client.server.debug);
        assert_eq!(client.server.run.program(), "/opt/safety-lsp");
        assert_eq!(client.server.run.cwd(), Some(Path::new("/work")));
        assert_eq!(client.server.run.env()[DISABLE_CHECK_VAR], "1");
        assert_eq!(client.server.run.env()["RUST_LOG"], "debug");

        assert_eq!(client.options.file_events.as_deref(), Some("**/.clientrc"));
        assert_eq!(client.options.workspace_root.as_deref(), Some(Path::new("/work")));
        assert_eq!(client.options.document_selector, DocumentSelector::rust_files());
        assert_eq!(client.options.trace, TraceLevel::Off);
    }

    #[tokio::test]
    async fn test_activate_with_missing_server_is_inactive_but_deactivates() {
        let host = host(&[("SAFETY_LSP", "/nonexistent/safety-lsp-missing")], &[]);
        let extension = Extension::activate(&host).await;
        assert_eq!(
            extension.client().map(LanguageClient::state),
            Some(ClientState::Inactive)
        );
        extension.deactivate().unwrap().await.unwrap();
    }
}
