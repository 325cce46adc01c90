//! JSON-RPC 2.0 over a framed transport
//!
//! Correlates responses with outstanding requests, dispatches server
//! notifications, and answers server-to-client requests through a handler.

use crate::io::transport::Transport;
use crate::lsp::framing::LspFraming;
use crate::lsp::jsonrpc_utils::{self, JSONRPC_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// How long `close` waits for queued messages to reach the transport
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound message sorted by shape
#[derive(Debug)]
pub enum InboundMessage {
    Response(JsonRpcResponse),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl InboundMessage {
    /// Classify a raw message: `method` + `id` is a request, `method` alone a
    /// notification, `id` without `method` a response.
    pub fn parse(message: &str) -> Result<Self, JsonRpcError> {
        let value: Value = serde_json::from_str(message)
            .map_err(|e| JsonRpcError::ParseError(e.to_string()))?;

        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        let parsed = match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(InboundMessage::Request),
            (true, false) => serde_json::from_value(value).map(InboundMessage::Notification),
            (false, _) => serde_json::from_value(value).map(InboundMessage::Response),
        };
        parsed.map_err(|e| JsonRpcError::InvalidRequest(e.to_string()))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("JSON-RPC parse error: {0}")]
    ParseError(String),

    #[error("JSON-RPC invalid message: {0}")]
    InvalidRequest(String),

    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Request was cancelled")]
    RequestCancelled,
}

// ============================================================================
// JSON-RPC Client
// ============================================================================

type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync>;
type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Work for the I/O task, handled in order
enum Outbound {
    Message(String),
    /// Acknowledged once everything queued before it has been written
    Flush(oneshot::Sender<()>),
}

/// Handlers shared between the client and its I/O task
#[derive(Default)]
struct Handlers {
    notification: Option<NotificationHandler>,
    request: Option<RequestHandler>,
}

pub struct JsonRpcClient {
    outbound_sender: mpsc::UnboundedSender<Outbound>,
    request_id: AtomicU64,
    pending_requests: PendingRequests,
    handlers: Arc<Mutex<Handlers>>,
    shutdown: CancellationToken,
}

impl JsonRpcClient {
    /// Take ownership of the transport and spawn the I/O task
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        let transport = Arc::new(Mutex::new(LspFraming::new(transport)));
        let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let handlers = Arc::new(Mutex::new(Handlers::default()));
        let shutdown = CancellationToken::new();

        let task_pending = Arc::clone(&pending_requests);
        let task_handlers = Arc::clone(&handlers);
        let task_shutdown = shutdown.clone();
        let reply_sender = outbound_sender.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_shutdown.cancelled() => break,
                    Some(outbound) = outbound_receiver.recv() => match outbound {
                        Outbound::Message(message) => {
                            let mut transport = transport.lock().await;
                            if let Err(e) = transport.send(&message).await {
                                error!("Failed to send message to server: {}", e);
                                break;
                            }
                        }
                        Outbound::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    },
                    result = async {
                        let mut transport = transport.lock().await;
                        transport.receive().await
                    } => {
                        match result {
                            Ok(message) => {
                                Self::dispatch(&message, &task_pending, &task_handlers, &reply_sender).await;
                            }
                            Err(e) => {
                                debug!("Server connection closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            // Wake anyone still waiting on a response
            task_pending.lock().await.clear();
            let _ = transport.lock().await.close().await;
            trace!("JSON-RPC I/O task finished");
        });

        Self {
            outbound_sender,
            request_id: AtomicU64::new(1),
            pending_requests,
            handlers,
            shutdown,
        }
    }

    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        self.handlers.lock().await.notification = Some(Arc::new(handler));
    }

    pub async fn on_request<F>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync + 'static,
    {
        self.handlers.lock().await.request = Some(Arc::new(handler));
    }

    async fn dispatch(
        message: &str,
        pending_requests: &PendingRequests,
        handlers: &Arc<Mutex<Handlers>>,
        reply_sender: &mpsc::UnboundedSender<Outbound>,
    ) {
        trace!("JsonRpcClient: received {}", message);

        match InboundMessage::parse(message) {
            Ok(InboundMessage::Response(response)) => {
                let Some(id) = response.id.as_u64() else {
                    warn!("Response with non-numeric id: {}", response.id);
                    return;
                };
                match pending_requests.lock().await.remove(&id) {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => debug!("Response for unknown request {}", id),
                }
            }
            Ok(InboundMessage::Request(request)) => {
                let handler = handlers.lock().await.request.clone();
                let response = match handler {
                    Some(handler) => handler(request),
                    None => jsonrpc_utils::method_not_found_response(request.id, &request.method),
                };
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        let _ = reply_sender.send(Outbound::Message(json));
                    }
                    Err(e) => error!("Failed to serialize reply: {}", e),
                }
            }
            Ok(InboundMessage::Notification(notification)) => {
                let handler = handlers.lock().await.notification.clone();
                if let Some(handler) = handler {
                    handler(notification);
                }
            }
            Err(e) => warn!("Dropping unparseable message from server: {}", e),
        }
    }

    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Duration,
    ) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (response_sender, response_receiver) = oneshot::channel();
        self.pending_requests.lock().await.insert(id, response_sender);

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: params
                .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
                .transpose()?,
        };
        let json = serde_json::to_string(&request).map_err(JsonRpcError::Serialization)?;
        debug!("JsonRpcClient: sending request {} ({})", method, id);

        if self.outbound_sender.send(Outbound::Message(json)).is_err() {
            self.pending_requests.lock().await.remove(&id);
            return Err(JsonRpcError::Transport("Outbound channel closed".to_string()));
        }

        let response = match tokio::time::timeout(timeout, response_receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(JsonRpcError::RequestCancelled),
            Err(_) => {
                self.pending_requests.lock().await.remove(&id);
                return Err(JsonRpcError::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        // A missing result is read as null, which `()` and `Option<_>` accept
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(JsonRpcError::Deserialization)
    }

    pub fn notify<P>(&self, method: &str, params: Option<P>) -> Result<(), JsonRpcError>
    where
        P: Serialize,
    {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: params
                .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
                .transpose()?,
        };
        let json = serde_json::to_string(&notification).map_err(JsonRpcError::Serialization)?;
        debug!("JsonRpcClient: sending notification {}", method);

        self.outbound_sender
            .send(Outbound::Message(json))
            .map_err(|_| JsonRpcError::Transport("Outbound channel closed".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.outbound_sender.is_closed()
    }

    /// Write out everything already queued, then cancel outstanding
    /// requests and stop the I/O task
    pub async fn close(&self) {
        let (ack_sender, ack) = oneshot::channel();
        if self.outbound_sender.send(Outbound::Flush(ack_sender)).is_ok()
            && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, ack).await.is_err()
        {
            warn!("Timed out flushing queued messages before close");
        }

        self.pending_requests.lock().await.clear();
        self.shutdown.cancel();
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
