//! JSON-RPC message shapes exchanged with the server.
//!
//! Only the subset of LSP the client actually uses is modelled. Outgoing
//! params are built with `serde_json::json!`; incoming payloads are parsed
//! into small private structs and converted to the public types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{CompletionItem, FileEvent, Hover, Position, TraceLevel};

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// Reply to a request the server sent us.
///
/// Exactly one of `result` and `error` is serialized; a `null` result is
/// still emitted as `"result": null`.
#[derive(Debug, Serialize)]
pub(crate) struct Response {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn method_not_found(id: serde_json::Value, method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
            }),
        }
    }
}

/// Classification of a frame read from the server.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

impl Incoming {
    /// Returns `None` for frames that are none of the three shapes, and for
    /// responses whose id we could never have issued.
    pub fn parse(frame: &serde_json::Value) -> Option<Self> {
        let id = frame.get("id");
        let method = frame
            .get("method")
            .and_then(serde_json::Value::as_str)
            .map(String::from);
        let is_response = frame.get("result").is_some() || frame.get("error").is_some();
        let params = frame.get("params").cloned();

        match (id, method) {
            (Some(id), None) if is_response => Some(Self::Response {
                id: id.as_u64()?,
                body: frame.clone(),
            }),
            (Some(id), Some(method)) => Some(Self::ServerRequest {
                id: id.clone(),
                method,
                params,
            }),
            (None, Some(method)) => Some(Self::Notification { method, params }),
            _ => None,
        }
    }
}

/// Pull the error message out of a response body, if it carries one.
pub(crate) fn response_error(body: &serde_json::Value) -> Option<String> {
    let error = body.get("error")?;
    Some(
        error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    )
}

pub(crate) fn initialize_params(root: Option<&Url>, trace: TraceLevel) -> serde_json::Value {
    let folders = root.map(|uri| {
        let name = uri
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .unwrap_or("workspace")
            .to_string();
        serde_json::json!([{ "uri": uri.as_str(), "name": name }])
    });

    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
        "rootUri": root.map(Url::as_str),
        "trace": trace.as_str(),
        "capabilities": {
            "workspace": {
                "workspaceFolders": true,
                "configuration": true,
                "didChangeWatchedFiles": { "dynamicRegistration": false }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "hover": {
                    "contentFormat": ["markdown", "plaintext"]
                },
                "completion": {
                    "completionItem": {
                        "snippetSupport": false,
                        "documentationFormat": ["markdown", "plaintext"]
                    }
                }
            },
            "window": { "workDoneProgress": true }
        },
        "workspaceFolders": folders
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn text_document_position_params(uri: &str, position: Position) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": position
    })
}

/// Events whose path cannot be expressed as a URI are dropped.
pub(crate) fn did_change_watched_files_params(events: &[FileEvent]) -> serde_json::Value {
    let changes: Vec<serde_json::Value> = events
        .iter()
        .filter_map(|event| {
            let uri = path_to_file_uri(&event.path).ok()?;
            Some(serde_json::json!({ "uri": uri.as_str(), "type": event.kind as u8 }))
        })
        .collect();
    serde_json::json!({ "changes": changes })
}

/// How the server wants document changes delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SyncKind {
    #[default]
    None,
    Full,
    Incremental,
}

impl SyncKind {
    fn from_lsp(value: Option<u64>) -> Self {
        match value {
            Some(1) => Self::Full,
            Some(2) => Self::Incremental,
            _ => Self::None,
        }
    }
}

/// `textDocumentSync`, either a bare kind or `TextDocumentSyncOptions`.
///
/// Omitted means no sync at all. A bare kind other than `None` implies
/// open/close notifications; the options form only has them when asked.
fn text_document_sync(value: Option<&serde_json::Value>) -> (bool, SyncKind) {
    match value {
        Some(serde_json::Value::Number(n)) => {
            let kind = SyncKind::from_lsp(n.as_u64());
            (kind != SyncKind::None, kind)
        }
        Some(options @ serde_json::Value::Object(_)) => {
            let open_close = options
                .get("openClose")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let change = options.get("change").and_then(serde_json::Value::as_u64);
            let kind = SyncKind::from_lsp(change);
            (open_close, kind)
        }
        _ => (false, SyncKind::None),
    }
}

/// What the server said it can do in its `initialize` result.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerCapabilities {
    pub hover: bool,
    pub completion: bool,
    /// Whether the server wants `didOpen` / `didClose`.
    pub open_close: bool,
    pub sync: SyncKind,
}

impl ServerCapabilities {
    pub fn from_initialize_result(body: &serde_json::Value) -> Self {
        let caps = &body["result"]["capabilities"];
        let enabled = |key: &str| match caps.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Null) | None => false,
            Some(_) => true,
        };
        let (open_close, sync) = text_document_sync(caps.get("textDocumentSync"));
        Self {
            hover: enabled("hoverProvider"),
            completion: enabled("completionProvider"),
            open_close,
            sync,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogMessageParams {
    #[serde(rename = "type")]
    pub kind: u64,
    pub message: String,
}

/// Hover contents are a `MarkupContent`, a `MarkedString`, or an array of
/// `MarkedString`s.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HoverContents {
    Markup { value: String },
    Plain(String),
    Many(Vec<MarkedString>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MarkedString {
    Plain(String),
    Code { value: String },
}

impl MarkedString {
    fn into_text(self) -> String {
        match self {
            Self::Plain(text) | Self::Code { value: text } => text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HoverResult {
    contents: HoverContents,
}

pub(crate) fn parse_hover(result: serde_json::Value) -> serde_json::Result<Option<Hover>> {
    let Some(hover) = serde_json::from_value::<Option<HoverResult>>(result)? else {
        return Ok(None);
    };
    let contents = match hover.contents {
        HoverContents::Markup { value } | HoverContents::Plain(value) => value,
        HoverContents::Many(parts) => parts
            .into_iter()
            .map(MarkedString::into_text)
            .collect::<Vec<_>>()
            .join("\n\n"),
    };
    Ok(Some(Hover { contents }))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Documentation {
    Plain(String),
    Markup { value: String },
}

#[derive(Debug, Deserialize)]
struct RawCompletionItem {
    label: String,
    detail: Option<String>,
    documentation: Option<Documentation>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompletionResponse {
    Items(Vec<RawCompletionItem>),
    List { items: Vec<RawCompletionItem> },
}

pub(crate) fn parse_completion(
    result: serde_json::Value,
) -> serde_json::Result<Vec<CompletionItem>> {
    let Some(response) = serde_json::from_value::<Option<CompletionResponse>>(result)? else {
        return Ok(Vec::new());
    };
    let (CompletionResponse::Items(items) | CompletionResponse::List { items }) = response;
    Ok(items
        .into_iter()
        .map(|item| CompletionItem {
            label: item.label,
            detail: item.detail,
            documentation: item.documentation.map(|doc| match doc {
                Documentation::Plain(text) | Documentation::Markup { value: text } => text,
            }),
        })
        .collect())
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<Url, PathToUriError> {
    Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
