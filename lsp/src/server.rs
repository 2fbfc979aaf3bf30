//! Server handle: owns the child process and the JSON-RPC plumbing.
//!
//! A reader task dispatches everything the server sends; a writer task owns
//! the server's stdin. Requests are matched to responses through the
//! `pending` map of oneshot senders.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::ClientError;
use crate::launch::LaunchDescriptor;
use crate::protocol::{
    self, Incoming, LogMessageParams, Notification, Request, Response, ServerCapabilities,
};
use crate::types::{ClientEvent, MessageType, ServerStopReason, TraceLevel};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Log target for lines the server writes to stderr.
const STDERR_TARGET: &str = "safety_lsp::stderr";

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

fn trace_frame(trace: TraceLevel, direction: &'static str, frame: &serde_json::Value) {
    if trace == TraceLevel::Off {
        return;
    }
    let method = frame.get("method").and_then(serde_json::Value::as_str);
    let id = frame.get("id");
    if trace == TraceLevel::Verbose {
        tracing::debug!(direction, ?method, ?id, body = %frame, "lsp message");
    } else {
        tracing::debug!(direction, ?method, ?id, "lsp message");
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: STDERR_TARGET, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading server stderr: {e}");
                break;
            }
        }
    }
}

/// Cloneable handle for sending notifications from other tasks.
#[derive(Clone)]
pub(crate) struct Notifier {
    writer_tx: mpsc::Sender<WriterCommand>,
}

impl Notifier {
    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow!("writer channel closed"))
    }
}

pub(crate) struct RunningServer {
    child: Option<Child>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: u64,
    pending: PendingMap,
    /// Set once the reader has stopped; nothing sent after that gets an answer.
    reader_closed: Arc<AtomicBool>,
    capabilities: ServerCapabilities,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl RunningServer {
    /// Spawn the process described by `descriptor` and wire up its streams.
    ///
    /// The server is not initialized yet; call [`RunningServer::initialize`].
    pub async fn spawn(
        descriptor: &LaunchDescriptor,
        trace: TraceLevel,
        event_tx: mpsc::Sender<ClientEvent>,
    ) -> Result<Self, ClientError> {
        let mut cmd = descriptor.command()?;
        let mut child = cmd.spawn().map_err(|source| ClientError::Spawn {
            command: descriptor.program().to_string(),
            source,
        })?;
        tracing::info!(
            command = descriptor.program(),
            pid = child.id(),
            cwd = ?descriptor.cwd(),
            "Spawned language server"
        );

        let stdout = child.stdout.take().context("no stdout from child")?;
        let stdin = child.stdin.take().context("no stdin from child")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let mut server = Self::connect(stdout, stdin, trace, event_tx);
        server.child = Some(child);
        Ok(server)
    }

    /// Speak JSON-RPC over an arbitrary stream pair.
    pub fn connect<R, W>(
        reader: R,
        writer: W,
        trace: TraceLevel,
        event_tx: mpsc::Sender<ClientEvent>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_pending = pending.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        trace_frame(trace, "send", &frame);
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.close().await;
                        break;
                    }
                }
            }
            // Nothing queued after this point will reach the server.
            writer_pending.lock().await.clear();
        });

        let reader_closed = Arc::new(AtomicBool::new(false));
        let reader_done = reader_closed.clone();
        let reader_pending = pending.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            let reason = loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        trace_frame(trace, "recv", &frame);
                        Self::dispatch_frame(&frame, &reader_pending, &event_tx, &reader_writer_tx)
                            .await;
                    }
                    Ok(None) => {
                        tracing::info!("Language server closed its output");
                        break ServerStopReason::Exited;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read from language server: {e}");
                        break ServerStopReason::Failed(e.to_string());
                    }
                }
            };
            // Outstanding requests can never be answered now.
            reader_done.store(true, Ordering::SeqCst);
            reader_pending.lock().await.clear();
            let _ = event_tx.send(ClientEvent::ServerStopped { reason }).await;
        });

        Self {
            child: None,
            writer_tx,
            next_id: 1,
            pending,
            reader_closed,
            capabilities: ServerCapabilities::default(),
            reader_handle,
            writer_handle,
        }
    }

    async fn dispatch_frame(
        frame: &serde_json::Value,
        pending: &Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
        event_tx: &mpsc::Sender<ClientEvent>,
        writer_tx: &mpsc::Sender<WriterCommand>,
    ) {
        let Some(incoming) = Incoming::parse(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            Incoming::Response { id, body } => {
                let sender = pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => tracing::debug!(id, "Response to unknown request"),
                }
            }
            Incoming::ServerRequest { id, method, params } => {
                let response = Self::answer_server_request(id, &method, params.as_ref());
                match serde_json::to_value(&response) {
                    Ok(frame) => {
                        let _ = writer_tx.send(WriterCommand::Send(frame)).await;
                    }
                    Err(e) => tracing::warn!("Failed to serialize reply to {method}: {e}"),
                }
            }
            Incoming::Notification { method, params } => {
                Self::handle_notification(&method, params, event_tx);
            }
        }
    }

    /// Servers block on some of their own requests, so every one gets a reply.
    fn answer_server_request(
        id: serde_json::Value,
        method: &str,
        params: Option<&serde_json::Value>,
    ) -> Response {
        match method {
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => Response::ok(id, serde_json::Value::Null),
            "workspace/configuration" => {
                // No server-side settings; one null per requested section.
                let count = params
                    .and_then(|p| p.get("items"))
                    .and_then(serde_json::Value::as_array)
                    .map_or(0, Vec::len);
                Response::ok(id, serde_json::Value::Array(vec![serde_json::Value::Null; count]))
            }
            _ => {
                tracing::debug!("Server sent request {method}; replying method not found");
                Response::method_not_found(id, method)
            }
        }
    }

    fn handle_notification(
        method: &str,
        params: Option<serde_json::Value>,
        event_tx: &mpsc::Sender<ClientEvent>,
    ) {
        let event = match method {
            "window/logMessage" | "window/showMessage" => {
                let Some(parsed) = params
                    .and_then(|p| serde_json::from_value::<LogMessageParams>(p).ok())
                else {
                    tracing::debug!("Malformed {method} params");
                    return;
                };
                let kind = MessageType::from_lsp(parsed.kind);
                match kind {
                    MessageType::Error => {
                        tracing::error!(kind = kind.label(), "{}", parsed.message);
                    }
                    MessageType::Warning => {
                        tracing::warn!(kind = kind.label(), "{}", parsed.message);
                    }
                    MessageType::Info | MessageType::Log => {
                        tracing::info!(kind = kind.label(), "{}", parsed.message);
                    }
                }
                if method == "window/showMessage" {
                    ClientEvent::ShowMessage {
                        kind,
                        message: parsed.message,
                    }
                } else {
                    ClientEvent::LogMessage {
                        kind,
                        message: parsed.message,
                    }
                }
            }
            _ => {
                tracing::trace!("Ignoring notification {method}");
                return;
            }
        };

        // Messages are advisory; drop them rather than stall the reader.
        if event_tx.try_send(event).is_err() {
            tracing::trace!("Event channel full, dropping {method}");
        }
    }

    /// Run the `initialize` / `initialized` handshake.
    pub async fn initialize(
        &mut self,
        root: Option<&Url>,
        trace: TraceLevel,
    ) -> Result<(), ClientError> {
        let params = protocol::initialize_params(root, trace);
        let body = self
            .send_request("initialize", Some(params), REQUEST_TIMEOUT)
            .await
            .map_err(|e| ClientError::Initialize(format!("{e:#}")))?;

        if let Some(message) = protocol::response_error(&body) {
            return Err(ClientError::Initialize(message));
        }
        self.capabilities = ServerCapabilities::from_initialize_result(&body);
        tracing::debug!(capabilities = ?self.capabilities, "Server initialized");

        self.notify("initialized", Some(serde_json::json!({})))
            .await?;
        Ok(())
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Send a request and return its `result`, or fail with the server's error.
    pub async fn request(
        &mut self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut body = self.send_request(method, params, REQUEST_TIMEOUT).await?;
        if let Some(message) = protocol::response_error(&body) {
            bail!("{method} failed: {message}");
        }
        Ok(body
            .get_mut("result")
            .map(serde_json::Value::take)
            .unwrap_or_default())
    }

    async fn send_request(
        &mut self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        {
            // Checked under the lock the reader clears, so a request either
            // sees the flag or is dropped by that clear.
            let mut pending = self.pending.lock().await;
            if self.reader_closed.load(Ordering::SeqCst) {
                bail!("server closed its output before {method}");
            }
            pending.insert(id, tx);
        }

        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            bail!("writer channel closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                bail!("server went away before answering {method}");
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("{method} timed out");
            }
        }
    }

    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<()> {
        self.notifier().notify(method, params).await
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            writer_tx: self.writer_tx.clone(),
        }
    }

    /// `shutdown`, `exit`, then wait briefly before killing. Consumes self.
    pub async fn shutdown(mut self) {
        match self
            .send_request("shutdown", None, SHUTDOWN_TIMEOUT)
            .await
        {
            Ok(body) if protocol::response_error(&body).is_none() => {
                let _ = self.notify("exit", None).await;
            }
            Ok(body) => tracing::debug!(
                "Server refused shutdown: {}",
                protocol::response_error(&body).unwrap_or_default()
            ),
            Err(e) => tracing::debug!("Shutdown request failed: {e:#}"),
        }

        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        // Let `exit` reach the server before deciding to kill it.
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.writer_handle)
            .await
            .is_err()
        {
            self.writer_handle.abort();
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Language server exited"),
                Ok(Err(e)) => tracing::warn!("Failed to wait for language server: {e}"),
                Err(_) => {
                    tracing::debug!("Language server didn't exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
        self.reader_handle.abort();
    }
}
