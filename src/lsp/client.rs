//! Typed LSP client
//!
//! Drives the initialize/shutdown handshake and the document and workspace
//! notifications a TOML editor integration needs, on top of [`JsonRpcClient`].

use crate::io::transport::Transport;
use crate::lsp::jsonrpc_utils;
use crate::lsp::protocol::{
    JsonRpcClient, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, DidChangeTextDocumentParams,
    DidChangeWatchedFilesClientCapabilities, DidChangeWatchedFilesParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, DidSaveTextDocumentParams, FileEvent,
    GotoCapability, HoverClientCapabilities, InitializeParams, InitializeResult, InitializedParams,
    InlayHintClientCapabilities, MarkupKind, MessageType, PublishDiagnosticsClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentSyncClientCapabilities, Uri, VersionedTextDocumentIdentifier,
    WindowClientCapabilities, WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("LSP client not initialized")]
    NotInitialized,

    #[error("LSP protocol error: {0}")]
    Protocol(String),

    #[error("Invalid document URI: {0}")]
    InvalidUri(String),

    #[error("LSP request timed out: {method}")]
    RequestTimeout { method: String },
}

/// Convert a `url::Url` into the URI type lsp-types expects
pub fn to_lsp_uri(url: &Url) -> Result<Uri, LspError> {
    url.as_str()
        .parse::<Uri>()
        .map_err(|_| LspError::InvalidUri(url.to_string()))
}

pub struct LspClient {
    rpc_client: JsonRpcClient,
    client_info: ClientInfo,
    request_timeout: Duration,
    initialized: bool,
}

impl LspClient {
    pub async fn new<T: Transport + 'static>(
        transport: T,
        client_info: ClientInfo,
        request_timeout: Duration,
    ) -> Self {
        let rpc_client = JsonRpcClient::new(transport);
        rpc_client.on_request(handle_server_request).await;
        rpc_client.on_notification(log_server_notification).await;

        Self {
            rpc_client,
            client_info,
            request_timeout,
            initialized: false,
        }
    }

    /// Perform `initialize` then `initialized`
    pub async fn initialize(
        &mut self,
        root: Option<&Url>,
        timeout: Duration,
    ) -> Result<InitializeResult, LspError> {
        if self.initialized {
            return Err(LspError::Protocol("Client already initialized".to_string()));
        }

        info!("Initializing LSP client");

        let root_uri = root.map(to_lsp_uri).transpose()?;
        let workspace_folders = match (root, &root_uri) {
            (Some(url), Some(uri)) => Some(vec![WorkspaceFolder {
                uri: uri.clone(),
                name: workspace_name(url),
            }]),
            _ => None,
        };

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            #[allow(deprecated)]
            root_path: None,
            #[allow(deprecated)]
            root_uri,
            initialization_options: None,
            capabilities: client_capabilities(),
            trace: None,
            workspace_folders,
            client_info: Some(self.client_info.clone()),
            locale: None,
            work_done_progress_params: Default::default(),
        };

        let result: InitializeResult = self
            .rpc_client
            .request_with_timeout("initialize", Some(params), timeout)
            .await
            .map_err(|e| timeout_as("initialize", e))?;

        debug!("LSP server capabilities: {:?}", result.capabilities);

        self.rpc_client
            .notify("initialized", Some(InitializedParams {}))?;
        self.initialized = true;

        match &result.server_info {
            Some(server) => info!(
                "LSP client initialized against {} {}",
                server.name,
                server.version.as_deref().unwrap_or("")
            ),
            None => info!("LSP client initialized"),
        }
        Ok(result)
    }

    /// Send `shutdown` then `exit`; a no-op before initialization
    pub async fn shutdown(&mut self) -> Result<(), LspError> {
        if !self.initialized {
            return Ok(());
        }

        info!("Shutting down LSP client");
        self.initialized = false;

        let _: Value = self
            .rpc_client
            .request_with_timeout("shutdown", None::<Value>, self.request_timeout)
            .await
            .map_err(|e| timeout_as("shutdown", e))?;
        self.rpc_client.notify("exit", None::<Value>)?;

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Flush queued messages and drop the connection
    pub async fn close(&mut self) {
        self.initialized = false;
        self.rpc_client.close().await;
    }

    // ------------------------------------------------------------------
    // Document and workspace notifications
    // ------------------------------------------------------------------

    pub fn did_open(
        &self,
        url: &Url,
        language_id: &str,
        version: i32,
        text: String,
    ) -> Result<(), LspError> {
        self.ensure_initialized()?;
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: to_lsp_uri(url)?,
                language_id: language_id.to_string(),
                version,
                text,
            },
        };
        Ok(self.rpc_client.notify("textDocument/didOpen", Some(params))?)
    }

    /// Full-text change
    pub fn did_change(&self, url: &Url, version: i32, text: String) -> Result<(), LspError> {
        self.ensure_initialized()?;
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: to_lsp_uri(url)?,
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        };
        Ok(self
            .rpc_client
            .notify("textDocument/didChange", Some(params))?)
    }

    pub fn did_save(&self, url: &Url, text: Option<String>) -> Result<(), LspError> {
        self.ensure_initialized()?;
        let params = DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: to_lsp_uri(url)?,
            },
            text,
        };
        Ok(self.rpc_client.notify("textDocument/didSave", Some(params))?)
    }

    pub fn did_close(&self, url: &Url) -> Result<(), LspError> {
        self.ensure_initialized()?;
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: to_lsp_uri(url)?,
            },
        };
        Ok(self
            .rpc_client
            .notify("textDocument/didClose", Some(params))?)
    }

    pub fn did_change_watched_files(&self, changes: Vec<FileEvent>) -> Result<(), LspError> {
        self.ensure_initialized()?;
        if changes.is_empty() {
            return Ok(());
        }
        Ok(self.rpc_client.notify(
            "workspace/didChangeWatchedFiles",
            Some(DidChangeWatchedFilesParams { changes }),
        )?)
    }

    fn ensure_initialized(&self) -> Result<(), LspError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LspError::NotInitialized)
        }
    }
}

fn timeout_as(method: &str, error: JsonRpcError) -> LspError {
    match error {
        JsonRpcError::Timeout => LspError::RequestTimeout {
            method: method.to_string(),
        },
        e => LspError::JsonRpc(e),
    }
}

fn workspace_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Capabilities advertised in `initialize`
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            workspace_folders: Some(true),
            did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                dynamic_registration: Some(false),
                relative_pattern_support: Some(false),
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            }),
            completion: Some(CompletionClientCapabilities::default()),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            inlay_hint: Some(InlayHintClientCapabilities::default()),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Answer a request initiated by the server
///
/// Progress tokens and capability registrations are acknowledged without
/// further action. Configuration requests get one `null` per item, meaning
/// "use your defaults".
pub fn handle_server_request(request: JsonRpcRequest) -> JsonRpcResponse {
    debug!("Server request: {}", request.method);

    match request.method.as_str() {
        "window/workDoneProgress/create" | "client/registerCapability" => {
            jsonrpc_utils::null_success_response(request.id)
        }
        "workspace/configuration" => {
            let items = request
                .params
                .as_ref()
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            jsonrpc_utils::success_response(request.id, Value::Array(vec![Value::Null; items]))
        }
        method => {
            warn!("Unhandled server request: {}", method);
            jsonrpc_utils::method_not_found_response(request.id, method)
        }
    }
}

/// Trace the notifications a TOML server is known to push
pub fn log_server_notification(notification: JsonRpcNotification) {
    let params = notification.params.unwrap_or(Value::Null);
    match notification.method.as_str() {
        "window/logMessage" | "window/showMessage" => {
            let message = params.get("message").and_then(Value::as_str).unwrap_or("");
            let kind = params
                .get("type")
                .cloned()
                .and_then(|t| serde_json::from_value::<MessageType>(t).ok());
            match kind {
                Some(k) if k == MessageType::ERROR => error!("confit-lsp: {}", message),
                Some(k) if k == MessageType::WARNING => warn!("confit-lsp: {}", message),
                Some(k) if k == MessageType::INFO => info!("confit-lsp: {}", message),
                _ => debug!("confit-lsp: {}", message),
            }
        }
        "textDocument/publishDiagnostics" => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or("");
            let count = params
                .get("diagnostics")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            debug!("Diagnostics for {}: {} item(s)", uri, count);
        }
        method => trace!("Ignoring server notification: {}", method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::MockTransport;
    use crate::lsp::framing::LspFraming;
    use serde_json::json;

    fn request(id: Value, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_progress_create_acknowledged() {
        let response = handle_server_request(request(
            json!(1),
            "window/workDoneProgress/create",
            Some(json!({"token": "indexing"})),
        ));
        assert_eq!(response.id, json!(1));
        assert_eq!(response.result, Some(Value::Null));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_register_capability_acknowledged() {
        let response = handle_server_request(request(
            json!("r1"),
            "client/registerCapability",
            Some(json!({"registrations": []})),
        ));
        assert_eq!(response.result, Some(Value::Null));
    }

    #[test]
    fn test_configuration_gets_one_null_per_item() {
        let response = handle_server_request(request(
            json!(9),
            "workspace/configuration",
            Some(json!({"items": [{"section": "confit"}, {"section": "confit.schema"}]})),
        ));
        assert_eq!(response.result, Some(json!([null, null])));
    }

    #[test]
    fn test_unknown_request_is_method_not_found() {
        let response = handle_server_request(request(json!(2), "workspace/applyEdit", None));
        let error = response.error.expect("error expected");
        assert_eq!(error.code, jsonrpc_utils::error_codes::METHOD_NOT_FOUND);
        assert!(response.result.is_none());
    }

    #[test]
    fn test_capabilities_cover_toml_features() {
        let caps = client_capabilities();
        let text = caps.text_document.as_ref().unwrap();
        assert_eq!(text.synchronization.as_ref().unwrap().did_save, Some(true));
        assert!(text.hover.is_some());
        assert!(text.completion.is_some());
        assert!(text.definition.is_some());
        assert!(text.inlay_hint.is_some());
        assert!(text.publish_diagnostics.is_some());
        assert!(
            caps.workspace
                .as_ref()
                .unwrap()
                .did_change_watched_files
                .is_some()
        );
    }

    #[test]
    fn test_workspace_name_is_last_segment() {
        let url = Url::parse("file:///home/dev/projects/site/").unwrap();
        assert_eq!(workspace_name(&url), "site");
    }

    #[test]
    fn test_to_lsp_uri_keeps_text() {
        let url = Url::parse("file:///srv/app/pyproject.toml").unwrap();
        let uri = to_lsp_uri(&url).unwrap();
        assert_eq!(
            serde_json::to_value(&uri).unwrap(),
            json!("file:///srv/app/pyproject.toml")
        );
    }

    #[tokio::test]
    async fn test_document_sync_requires_initialization() {
        let client = LspClient::new(
            MockTransport::new(),
            ClientInfo {
                name: "confit-client".to_string(),
                version: None,
            },
            Duration::from_millis(50),
        )
        .await;
        let url = Url::parse("file:///srv/app/Cargo.toml").unwrap();

        assert!(matches!(
            client.did_open(&url, "toml", 1, String::new()),
            Err(LspError::NotInitialized)
        ));
        assert!(matches!(
            client.did_change_watched_files(vec![]),
            Err(LspError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize_is_noop() {
        let mut client = LspClient::new(
            MockTransport::new(),
            ClientInfo {
                name: "confit-client".to_string(),
                version: None,
            },
            Duration::from_millis(50),
        )
        .await;
        assert!(client.shutdown().await.is_ok());
        assert!(!client.is_initialized());
    }

    /// A scripted server: answers `initialize` and `shutdown`, and asks for
    /// configuration once the client reports `initialized`
    fn scripted_server() -> MockTransport {
        MockTransport::new().responding_with(|sent| {
            let (_, body) = sent.split_once("\r\n\r\n").unwrap();
            let body: Value = serde_json::from_str(body).unwrap();
            let reply = match body["method"].as_str() {
                Some("initialize") => json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "result": {"capabilities": {}, "serverInfo": {"name": "confit-lsp"}}
                }),
                Some("shutdown") => json!({"jsonrpc": "2.0", "id": body["id"], "result": null}),
                Some("initialized") => json!({
                    "jsonrpc": "2.0",
                    "id": "cfg-1",
                    "method": "workspace/configuration",
                    "params": {"items": [{"section": "confit"}]}
                }),
                _ => return Vec::new(),
            };
            vec![LspFraming::<MockTransport>::frame(&reply.to_string())]
        })
    }

    fn sent_bodies(transport: &MockTransport) -> Vec<Value> {
        transport
            .sent_messages()
            .iter()
            .map(|framed| {
                let (_, body) = framed.split_once("\r\n\r\n").unwrap();
                serde_json::from_str(body).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_handshake_and_shutdown_reach_server() {
        let transport = scripted_server();
        let mut client = LspClient::new(
            transport.clone(),
            ClientInfo {
                name: "confit-client".to_string(),
                version: Some("0.1.0".to_string()),
            },
            Duration::from_secs(5),
        )
        .await;
        let root = Url::parse("file:///srv/app/").unwrap();

        let result = client
            .initialize(Some(&root), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.server_info.unwrap().name, "confit-lsp");
        assert!(client.is_initialized());

        let cargo = Url::parse("file:///srv/app/Cargo.toml").unwrap();
        client
            .did_open(&cargo, "toml", 1, "[package]".to_string())
            .unwrap();

        client.shutdown().await.unwrap();
        client.close().await;

        let sent = sent_bodies(&transport);
        let methods: Vec<&str> = sent
            .iter()
            .filter_map(|body| body["method"].as_str())
            .collect();
        assert_eq!(
            methods,
            vec![
                "initialize",
                "initialized",
                "textDocument/didOpen",
                "shutdown",
                "exit"
            ]
        );

        let initialize = &sent[0]["params"];
        assert_eq!(initialize["rootUri"], "file:///srv/app/");
        assert_eq!(initialize["workspaceFolders"][0]["name"], "app");
        assert_eq!(initialize["clientInfo"]["name"], "confit-client");

        let reply = sent
            .iter()
            .find(|body| body["id"] == "cfg-1")
            .expect("configuration request answered");
        assert_eq!(reply["result"], json!([null]));
    }
}
