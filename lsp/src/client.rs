//! `LanguageClient`: one server session as the editor host sees it.
//!
//! The client owns the server process for its lifetime. `start` spawns and
//! initializes it, documents matching the selector are synchronized, and
//! `stop` shuts the server down. A server that dies on its own is noticed on
//! the next event drain and the client falls back to `Inactive`.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::launch::{LaunchMode, ServerOptions};
use crate::protocol::{self, SyncKind};
use crate::selector::{self, DocumentSelector};
use crate::server::{Notifier, RunningServer};
use crate::types::{
    ClientEvent, ClientState, CompletionItem, FileEvent, Hover, Position, ServerStopReason,
    TraceLevel,
};
use crate::watcher::FileWatcher;

const EVENT_CHANNEL_CAPACITY: usize = 256;

const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Anything the extension can start once and stop once.
pub trait ClientHandle: Sized + Send + 'static {
    fn start(&mut self) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Consumes the handle; the returned future owns everything it needs.
    fn stop(self) -> impl Future<Output = Result<(), ClientError>> + Send + 'static;
}

/// How the client talks to the server, independent of how it is launched.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub document_selector: DocumentSelector,
    /// Workspace files whose changes are reported to the server.
    pub file_events: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub trace: TraceLevel,
}

#[derive(Debug)]
struct OpenDocument {
    version: i32,
}

pub struct LanguageClient {
    id: String,
    name: String,
    server_options: ServerOptions,
    options: ClientOptions,
    mode: LaunchMode,
    state: ClientState,
    server: Option<RunningServer>,
    watcher: Option<FileWatcher>,
    forwarder: Option<JoinHandle<()>>,
    /// Open documents by URI.
    documents: HashMap<String, OpenDocument>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: mpsc::Receiver<ClientEvent>,
}

impl LanguageClient {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        server_options: ServerOptions,
        options: ClientOptions,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            name: name.into(),
            server_options,
            options,
            mode: LaunchMode::default(),
            state: ClientState::Inactive,
            server: None,
            watcher: None,
            forwarder: None,
            documents: HashMap::new(),
            event_tx,
            event_rx,
        }
    }

    #[must_use]
    pub fn with_launch_mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn server_options(&self) -> &ServerOptions {
        &self.server_options
    }

    /// Spawn the server and run the initialize handshake.
    ///
    /// Starting a client that is not `Inactive` does nothing.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.state != ClientState::Inactive {
            tracing::debug!(client = %self.id, state = %self.state, "Start ignored");
            return Ok(());
        }
        self.state = ClientState::Starting;

        let descriptor = self.server_options.select(self.mode);
        tracing::info!(
            client = %self.id,
            command = descriptor.program(),
            "Starting language server"
        );
        let spawned =
            RunningServer::spawn(descriptor, self.options.trace, self.event_tx.clone()).await;
        let result = match spawned {
            Ok(server) => self.handshake(server).await,
            Err(e) => Err(e),
        };
        self.finish_start(result)
    }

    /// Start against an already connected server.
    #[cfg(test)]
    pub(crate) async fn start_connected(
        &mut self,
        server: RunningServer,
    ) -> Result<(), ClientError> {
        self.state = ClientState::Starting;
        let result = self.handshake(server).await;
        self.finish_start(result)
    }

    /// Sender that feeds this client's event stream.
    #[cfg(test)]
    pub(crate) fn event_tx(&self) -> mpsc::Sender<ClientEvent> {
        self.event_tx.clone()
    }

    async fn handshake(&mut self, mut server: RunningServer) -> Result<(), ClientError> {
        let root = self
            .options
            .workspace_root
            .as_deref()
            .map(protocol::path_to_file_uri)
            .transpose()?;
        server.initialize(root.as_ref(), self.options.trace).await?;

        if let (Some(glob), Some(root)) =
            (&self.options.file_events, &self.options.workspace_root)
        {
            let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
            match FileWatcher::start(root, glob, tx) {
                Ok(watcher) => {
                    self.forwarder = Some(tokio::spawn(forward_file_events(rx, server.notifier())));
                    self.watcher = Some(watcher);
                }
                // The session is still useful without change notifications.
                Err(e) => tracing::warn!(client = %self.id, "Not watching {glob}: {e}"),
            }
        }

        self.server = Some(server);
        Ok(())
    }

    fn finish_start(&mut self, result: Result<(), ClientError>) -> Result<(), ClientError> {
        match result {
            Ok(()) => {
                self.state = ClientState::Running;
                tracing::info!(client = %self.id, "{} started", self.name);
                Ok(())
            }
            Err(e) => {
                tracing::error!(client = %self.id, "{} failed to start: {e}", self.name);
                self.detach();
                self.state = ClientState::Inactive;
                Err(e)
            }
        }
    }

    /// Drop the server and everything tied to it. The child is killed on drop.
    fn detach(&mut self) {
        self.watcher = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.server = None;
        self.documents.clear();
    }

    fn running_server(&mut self) -> Result<&mut RunningServer, ClientError> {
        self.server.as_mut().ok_or(ClientError::NotRunning)
    }

    /// URI and language of `path` when the selector accepts it.
    fn selected(&self, path: &Path) -> Result<Option<(String, &'static str)>, ClientError> {
        let Some(language_id) = selector::language_id_for_path(path) else {
            return Ok(None);
        };
        let uri = protocol::path_to_file_uri(path)?;
        if !self.options.document_selector.matches(&uri, language_id) {
            return Ok(None);
        }
        Ok(Some((uri.to_string(), language_id)))
    }

    /// Open a document. Returns whether it was forwarded to the server.
    ///
    /// Opening an already open document sends its new text as a change.
    /// Servers that did not ask for open/close notifications get none.
    pub async fn did_open(&mut self, path: &Path, text: &str) -> Result<bool, ClientError> {
        let Some((uri, language_id)) = self.selected(path)? else {
            return Ok(false);
        };
        if self.documents.contains_key(&uri) {
            return self.send_change(uri, text).await;
        }

        let server = self.running_server()?;
        let announce = server.capabilities().open_close;
        if announce {
            server
                .notify(
                    "textDocument/didOpen",
                    Some(protocol::did_open_params(&uri, language_id, 1, text)),
                )
                .await?;
        }
        // Tracked either way so change versions keep counting.
        self.documents.insert(uri, OpenDocument { version: 1 });
        Ok(announce)
    }

    /// Replace a document's text, opening it first if needed.
    pub async fn did_change(&mut self, path: &Path, text: &str) -> Result<bool, ClientError> {
        let Some((uri, _)) = self.selected(path)? else {
            return Ok(false);
        };
        if !self.documents.contains_key(&uri) {
            return self.did_open(path, text).await;
        }
        self.send_change(uri, text).await
    }

    async fn send_change(&mut self, uri: String, text: &str) -> Result<bool, ClientError> {
        let server = self.running_server()?;
        if server.capabilities().sync == SyncKind::None {
            return Ok(false);
        }
        let Some(document) = self.documents.get(&uri) else {
            return Ok(false);
        };
        let version = document.version + 1;

        let server = self.running_server()?;
        server
            .notify(
                "textDocument/didChange",
                Some(protocol::did_change_params(&uri, version, text)),
            )
            .await?;
        if let Some(document) = self.documents.get_mut(&uri) {
            document.version = version;
        }
        Ok(true)
    }

    pub async fn did_close(&mut self, path: &Path) -> Result<bool, ClientError> {
        let Some((uri, _)) = self.selected(path)? else {
            return Ok(false);
        };
        if !self.documents.contains_key(&uri) {
            return Ok(false);
        }
        let server = self.running_server()?;
        if !server.capabilities().open_close {
            self.documents.remove(&uri);
            return Ok(false);
        }
        server
            .notify(
                "textDocument/didClose",
                Some(protocol::did_close_params(&uri)),
            )
            .await?;
        self.documents.remove(&uri);
        Ok(true)
    }

    /// Hover at `position`; `None` when the server has nothing or no hover support.
    pub async fn hover(
        &mut self,
        path: &Path,
        position: Position,
    ) -> Result<Option<Hover>, ClientError> {
        let Some((uri, _)) = self.selected(path)? else {
            return Ok(None);
        };
        let server = self.running_server()?;
        if !server.capabilities().hover {
            return Ok(None);
        }
        let result = server
            .request(
                "textDocument/hover",
                Some(protocol::text_document_position_params(&uri, position)),
            )
            .await?;
        let hover = protocol::parse_hover(result).context("decoding hover result")?;
        Ok(hover)
    }

    pub async fn completion(
        &mut self,
        path: &Path,
        position: Position,
    ) -> Result<Vec<CompletionItem>, ClientError> {
        let Some((uri, _)) = self.selected(path)? else {
            return Ok(Vec::new());
        };
        let server = self.running_server()?;
        if !server.capabilities().completion {
            return Ok(Vec::new());
        }
        let result = server
            .request(
                "textDocument/completion",
                Some(protocol::text_document_position_params(&uri, position)),
            )
            .await?;
        let items = protocol::parse_completion(result).context("decoding completion result")?;
        Ok(items)
    }

    /// Wait for the next event from the server.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        let event = self.event_rx.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// The next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        let event = self.event_rx.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    fn observe(&mut self, event: &ClientEvent) {
        let ClientEvent::ServerStopped { reason } = event else {
            return;
        };
        if self.server.is_none() {
            return;
        }
        match reason {
            ServerStopReason::Exited => tracing::info!(client = %self.id, "Language server exited"),
            ServerStopReason::Failed(msg) => {
                tracing::warn!(client = %self.id, error = %msg, "Language server failed");
            }
        }
        self.detach();
        self.state = ClientState::Inactive;
    }

    /// Shut the server down. Stopping a client with no server is a no-op.
    pub async fn stop(mut self) -> Result<(), ClientError> {
        let Some(server) = self.server.take() else {
            tracing::debug!(client = %self.id, "Stop requested but no server is running");
            return Ok(());
        };
        self.state = ClientState::Stopping;
        tracing::info!(client = %self.id, "Stopping {}", self.name);
        self.detach();
        server.shutdown().await;
        self.state = ClientState::Inactive;
        Ok(())
    }
}

impl ClientHandle for LanguageClient {
    fn start(&mut self) -> impl Future<Output = Result<(), ClientError>> + Send {
        LanguageClient::start(self)
    }

    fn stop(self) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        LanguageClient::stop(self)
    }
}

async fn forward_file_events(mut rx: mpsc::Receiver<Vec<FileEvent>>, notifier: Notifier) {
    while let Some(batch) = rx.recv().await {
        tracing::debug!(count = batch.len(), "Forwarding watched file changes");
        let params = protocol::did_change_watched_files_params(&batch);
        if let Err(e) = notifier
            .notify("workspace/didChangeWatchedFiles", Some(params))
            .await
        {
            tracing::debug!("Stopped forwarding file changes: {e:#}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::launch::LaunchDescriptor;
    use crate::settings::Settings;
    use crate::test_support::{FakeServer, connect_fake};
    use crate::types::MessageType;
    use crate::watcher::CLIENT_CONFIG_GLOB;

    fn options() -> ClientOptions {
        ClientOptions {
            document_selector: DocumentSelector::rust_files(),
            ..ClientOptions::default()
        }
    }

    fn client_with(options: ClientOptions) -> LanguageClient {
        let descriptor = LaunchDescriptor::resolve(&Settings::default(), &[]);
        LanguageClient::new("test", "Test Client", ServerOptions::same(descriptor), options)
    }

    async fn running_client(
        fake: FakeServer,
    ) -> (LanguageClient, JoinHandle<Vec<serde_json::Value>>) {
        let mut client = client_with(options());
        let (server, handle) = connect_fake(fake, client.event_tx());
        client.start_connected(server).await.unwrap();
        (client, handle)
    }

    fn methods(frames: &[serde_json::Value]) -> Vec<&str> {
        frames.iter().filter_map(|f| f["method"].as_str()).collect()
    }

    #[test]
    fn test_new_client_is_inactive() {
        let client = client_with(options());
        assert_eq!(client.state(), ClientState::Inactive);
        assert_eq!(client.id(), "test");
    }

    #[tokio::test]
    async fn test_start_connected_runs() {
        let (client, handle) = running_client(FakeServer::safety_lsp()).await;
        assert_eq!(client.state(), ClientState::Running);
        client.stop().await.unwrap();
        let frames = handle.await.unwrap();
        assert_eq!(methods(&frames), ["initialize", "initialized", "shutdown", "exit"]);
    }

    #[tokio::test]
    async fn test_initialized_log_message_is_delivered() {
        let (mut client, _handle) = running_client(FakeServer::safety_lsp()).await;
        let event = tokio::time::timeout(Duration::from_secs(5), client.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ClientEvent::LogMessage {
                kind: MessageType::Info,
                message: "[initialized] safety-tool server initialized!".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_start_failure_returns_to_inactive() {
        let mut client = client_with(options());
        let (server, _handle) = connect_fake(FakeServer::rejecting_initialize(), client.event_tx());
        let err = client.start_connected(server).await.unwrap_err();
        assert!(matches!(err, ClientError::Initialize(_)));
        assert_eq!(client.state(), ClientState::Inactive);
        // Still stoppable afterwards.
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_fails() {
        let mut settings_env = BTreeMap::new();
        settings_env.insert(
            "SAFETY_LSP".to_string(),
            "/nonexistent/safety-lsp-missing".to_string(),
        );
        let settings = Settings::from_env(settings_env).unwrap();
        let descriptor = LaunchDescriptor::resolve(&settings, &[]);
        let mut client =
            LanguageClient::new("test", "Test Client", ServerOptions::same(descriptor), options());

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, ClientError::ServerNotFound { .. }));
        assert_eq!(client.state(), ClientState::Inactive);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        client_with(options()).stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_document_sync_respects_selector() {
        let (mut client, handle) = running_client(FakeServer::safety_lsp()).await;
        let lib = Path::new("/work/src/lib.rs");

        assert!(client.did_open(lib, "fn main() {}").await.unwrap());
        assert!(!client.did_open(Path::new("/work/Cargo.toml"), "").await.unwrap());
        assert!(client.did_change(lib, "fn main() { }").await.unwrap());
        assert!(client.did_close(lib).await.unwrap());
        assert!(!client.did_close(lib).await.unwrap());

        client.stop().await.unwrap();
        let frames = handle.await.unwrap();
        assert_eq!(
            methods(&frames),
            [
                "initialize",
                "initialized",
                "textDocument/didOpen",
                "textDocument/didChange",
                "textDocument/didClose",
                "shutdown",
                "exit"
            ]
        );
        assert_eq!(frames[2]["params"]["textDocument"]["languageId"], "rust");
        assert_eq!(frames[2]["params"]["textDocument"]["version"], 1);
        assert_eq!(frames[3]["params"]["textDocument"]["version"], 2);
    }

    #[tokio::test]
    async fn test_no_document_sync_without_capability() {
        let (mut client, handle) = running_client(FakeServer::without_document_sync()).await;
        let lib = Path::new("/work/src/lib.rs");

        assert!(!client.did_open(lib, "fn main() {}").await.unwrap());
        assert!(!client.did_change(lib, "fn main() { }").await.unwrap());
        assert!(!client.did_close(lib).await.unwrap());
        // Queries still work against an unsynchronised server.
        assert!(client.hover(lib, Position::new(0, 0)).await.unwrap().is_some());

        client.stop().await.unwrap();
        let frames = handle.await.unwrap();
        assert!(
            !methods(&frames)
                .iter()
                .any(|m| m.starts_with("textDocument/did"))
        );
    }

    #[tokio::test]
    async fn test_change_before_open_opens() {
        let (mut client, handle) = running_client(FakeServer::safety_lsp()).await;
        assert!(client.did_change(Path::new("/work/a.rs"), "x").await.unwrap());
        client.stop().await.unwrap();
        let frames = handle.await.unwrap();
        assert_eq!(methods(&frames)[2], "textDocument/didOpen");
    }

    #[tokio::test]
    async fn test_hover_and_completion() {
        let (mut client, _handle) = running_client(FakeServer::safety_lsp()).await;
        let lib = Path::new("/work/src/lib.rs");

        let hover = client.hover(lib, Position::new(0, 3)).await.unwrap();
        assert_eq!(hover.unwrap().contents, "**ValidPtr**");

        let items = client.completion(lib, Position::new(0, 3)).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "ValidPtr");
        assert_eq!(items[0].detail.as_deref(), Some("precond"));

        // Outside the selector: no request at all.
        let none = client
            .hover(Path::new("/work/README.md"), Position::new(0, 0))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_operations_need_running_server() {
        let mut client = client_with(options());
        let err = client
            .did_open(Path::new("/work/a.rs"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotRunning));
    }

    #[tokio::test]
    async fn test_server_exit_returns_client_to_inactive() {
        let (mut client, _handle) = running_client(FakeServer::exiting_after_initialize()).await;
        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ClientEvent::ServerStopped { .. }) = client.next_event().await {
                    break;
                }
            }
        })
        .await;
        assert!(stopped.is_ok());
        assert_eq!(client.state(), ClientState::Inactive);
        client.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watched_file_changes_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client_with(ClientOptions {
            file_events: Some(CLIENT_CONFIG_GLOB.to_string()),
            workspace_root: Some(dir.path().to_path_buf()),
            ..options()
        });
        let (server, handle) = connect_fake(FakeServer::safety_lsp(), client.event_tx());
        client.start_connected(server).await.unwrap();

        std::fs::write(dir.path().join(".clientrc"), "x").unwrap();
        // Debounce plus backend latency.
        tokio::time::sleep(Duration::from_secs(2)).await;

        client.stop().await.unwrap();
        let frames = handle.await.unwrap();
        let change = frames
            .iter()
            .find(|f| f["method"] == "workspace/didChangeWatchedFiles")
            .expect("change notification");
        let uri = change["params"]["changes"][0]["uri"].as_str().unwrap();
        assert!(uri.ends_with("/.clientrc"));
        let root_uri = frames[0]["params"]["rootUri"].as_str().unwrap();
        assert!(root_uri.starts_with("file://"));
    }
}
