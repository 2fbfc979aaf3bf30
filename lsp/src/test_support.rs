//! In-memory stand-in for `safety-lsp`, driven over a duplex stream.

use tokio::io::{DuplexStream, duplex, split};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::server::RunningServer;
use crate::types::{ClientEvent, TraceLevel};

#[derive(Debug, Clone, Copy)]
pub(crate) struct FakeServer {
    reject_initialize: bool,
    exit_after_initialize: bool,
    close_output_after_initialize: bool,
    document_sync: bool,
}

impl FakeServer {
    /// Answers like the real server: hover, completion, full sync.
    pub fn safety_lsp() -> Self {
        Self {
            reject_initialize: false,
            exit_after_initialize: false,
            close_output_after_initialize: false,
            document_sync: true,
        }
    }

    pub fn rejecting_initialize() -> Self {
        Self {
            reject_initialize: true,
            ..Self::safety_lsp()
        }
    }

    pub fn exiting_after_initialize() -> Self {
        Self {
            exit_after_initialize: true,
            ..Self::safety_lsp()
        }
    }

    /// Stops writing after `initialize` but keeps reading until `exit`.
    pub fn closing_output_after_initialize() -> Self {
        Self {
            close_output_after_initialize: true,
            ..Self::safety_lsp()
        }
    }

    /// Leaves `textDocumentSync` out of its capabilities.
    pub fn without_document_sync() -> Self {
        Self {
            document_sync: false,
            ..Self::safety_lsp()
        }
    }

    /// Serve until `exit` or EOF; returns every frame received.
    pub async fn run(self, io: DuplexStream) -> Vec<serde_json::Value> {
        let (read, write) = split(io);
        let mut reader = FrameReader::new(read);
        let mut writer = Some(FrameWriter::new(write));
        let mut seen = Vec::new();

        while let Ok(Some(frame)) = reader.read_frame().await {
            seen.push(frame.clone());
            let id = frame.get("id").cloned();
            let method = frame["method"].as_str().unwrap_or_default().to_string();

            let reply = match (method.as_str(), id) {
                ("exit", _) => break,
                ("initialize", Some(id)) if self.reject_initialize => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32602, "message": "unsupported client" }
                }),
                ("initialize", Some(id)) => {
                    let mut capabilities = serde_json::json!({
                        "hoverProvider": true,
                        "completionProvider": {}
                    });
                    if self.document_sync {
                        capabilities["textDocumentSync"] =
                            serde_json::json!({ "openClose": true, "change": 1 });
                    }
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": { "capabilities": capabilities }
                    })
                }
                ("initialized", None) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "window/logMessage",
                    "params": { "type": 3, "message": "[initialized] safety-tool server initialized!" }
                }),
                ("textDocument/hover", Some(id)) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "contents": { "kind": "markdown", "value": "**ValidPtr**" } }
                }),
                ("textDocument/completion", Some(id)) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": [{ "label": "ValidPtr", "detail": "precond" }]
                }),
                (_, Some(id)) => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": null }),
                (_, None) => continue,
            };

            let Some(out) = writer.as_mut() else {
                continue;
            };
            if out.write_frame(&reply).await.is_err() {
                break;
            }
            if method == "initialize" && self.exit_after_initialize {
                break;
            }
            if method == "initialize" && self.close_output_after_initialize {
                // Shutting down the write half is EOF for the client's reader.
                let _ = out.close().await;
                writer = None;
            }
        }
        seen
    }
}

/// A [`RunningServer`] wired to a fake, plus the fake's task.
pub(crate) fn connect_fake(
    fake: FakeServer,
    event_tx: mpsc::Sender<ClientEvent>,
) -> (RunningServer, JoinHandle<Vec<serde_json::Value>>) {
    let (client_io, server_io) = duplex(64 * 1024);
    let handle = tokio::spawn(fake.run(server_io));
    let (read, write) = split(client_io);
    let server = RunningServer::connect(read, write, TraceLevel::Verbose, event_tx);
    (server, handle)
}
