//! WebSocket bridge to the engine sidecar.
//!
//! The sidecar hosts the browser-automation engine and exchanges JSON text
//! frames with the gateway:
//!
//! - request: `{"id": "gw-1", "method": "sendMessage", "params": {...}}`
//! - response: `{"id": "gw-1", "result": ...}` or `{"id": "gw-1", "error": {"message": "..."}}`
//! - event: `{"event": "qr", "data": "..."}`

use super::{
    BRIDGE_CLOSED_REASON, ChatSummary, ClientInfo, ConnectionState, Engine, EngineError,
    EngineEvent, EngineFactory, EventBus, MessageContent, SentMessage,
};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;
type Waiter = oneshot::Sender<Result<Value, EngineError>>;

/// Launch options forwarded to the sidecar on `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeOptions {
    pub session_dir: PathBuf,
    pub headless: bool,
    pub browser_args: Vec<String>,
    pub executable_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: &'a str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct BridgeFailure {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeFrame {
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<BridgeFailure>,
    },
}

/// State shared between an engine handle and its read pump.
struct BridgeShared {
    waiters: DashMap<String, Waiter>,
    events: Arc<EventBus>,
    info: RwLock<Option<ClientInfo>>,
    closing: AtomicBool,
}

impl BridgeShared {
    fn new(events: Arc<EventBus>) -> Self {
        Self {
            waiters: DashMap::new(),
            events,
            info: RwLock::new(None),
            closing: AtomicBool::new(false),
        }
    }

    fn set_info(&self, info: Option<ClientInfo>) {
        *self.info.write().expect("RwLock should not be poisoned") = info;
    }

    fn handle_frame(&self, raw: &str) {
        let frame = match serde_json::from_str::<BridgeFrame>(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Gateway/Bridge", "Dropping undecodable engine frame: {e}");
                return;
            }
        };

        match frame {
            BridgeFrame::Event { event, data } => match event_from_wire(&event, data) {
                Some(evt) => {
                    debug!(target: "Gateway/Bridge", "<-- event {}", evt.name());
                    match &evt {
                        EngineEvent::Ready(Some(info)) => self.set_info(Some(info.clone())),
                        EngineEvent::Disconnected(_) => self.set_info(None),
                        _ => {}
                    }
                    self.events.dispatch(&evt);
                }
                None => debug!(target: "Gateway/Bridge", "Ignoring engine event `{event}`"),
            },
            BridgeFrame::Response { id, result, error } => {
                let outcome = match error {
                    Some(failure) => Err(EngineError::Rejected(failure.message)),
                    None => Ok(result),
                };
                match self.waiters.remove(&id) {
                    Some((_, waiter)) => {
                        if waiter.send(outcome).is_err() {
                            warn!(target: "Gateway/Bridge", "Waiter for request {id} was dropped before its response arrived.");
                        }
                    }
                    None => {
                        warn!(target: "Gateway/Bridge", "Received response for unknown request {id}")
                    }
                }
            }
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<String> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for id in pending {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                let _ = waiter.send(Err(EngineError::Disconnected));
            }
        }
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn event_from_wire(name: &str, data: Value) -> Option<EngineEvent> {
    match name {
        "qr" => data.as_str().map(|code| EngineEvent::Qr(code.to_string())),
        "authenticated" => Some(EngineEvent::Authenticated),
        "ready" => Some(EngineEvent::Ready(serde_json::from_value(data).ok())),
        "auth_failure" => Some(EngineEvent::AuthFailure(value_text(data))),
        "change_state" => Some(EngineEvent::ChangeState(value_text(data))),
        "disconnected" => Some(EngineEvent::Disconnected(value_text(data))),
        _ => None,
    }
}

fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(body) => json!({ "type": "text", "body": body }),
        MessageContent::Media(media) => json!({
            "type": "media",
            "mimetype": media.mime_type,
            "data": STANDARD.encode(&media.data),
            "filename": media.filename,
        }),
    }
}

async fn read_pump(mut stream: WsStream, shared: Arc<BridgeShared>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => shared.handle_frame(text.as_str()),
            Ok(Message::Close(frame)) => {
                debug!(target: "Gateway/Bridge", "Engine closed the bridge: {frame:?}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "Gateway/Bridge", "Bridge read error: {e}");
                break;
            }
        }
    }

    shared.fail_pending();
    shared.set_info(None);
    if !shared.closing.load(Ordering::SeqCst) {
        warn!(target: "Gateway/Bridge", "Bridge closed unexpectedly");
        shared
            .events
            .dispatch(&EngineEvent::Disconnected(BRIDGE_CLOSED_REASON.to_string()));
    }
}

pub struct BridgeEngine {
    sink: Mutex<Option<WsSink>>,
    shared: Arc<BridgeShared>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    id_counter: AtomicU64,
    options: BridgeOptions,
    request_timeout: Duration,
}

impl BridgeEngine {
    fn next_request_id(&self) -> String {
        format!("gw-{}", self.id_counter.fetch_add(1, Ordering::Relaxed))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, EngineError> {
        let id = self.next_request_id();
        let frame = serde_json::to_string(&BridgeRequest {
            id: &id,
            method,
            params,
        })
        .map_err(|e| EngineError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.waiters.insert(id.clone(), tx);

        {
            let mut sink_guard = self.sink.lock().await;
            let Some(sink) = sink_guard.as_mut() else {
                self.shared.waiters.remove(&id);
                return Err(EngineError::Disconnected);
            };
            debug!(target: "Gateway/Bridge", "--> {method} ({id})");
            if let Err(e) = sink.send(Message::text(frame)).await {
                self.shared.waiters.remove(&id);
                warn!(target: "Gateway/Bridge", "Failed to send {method}: {e}");
                return Err(EngineError::Disconnected);
            }
        }

        let value = match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(EngineError::Disconnected),
            Err(_) => {
                self.shared.waiters.remove(&id);
                return Err(EngineError::Timeout(method.to_string()));
            }
        };

        serde_json::from_value(value).map_err(|e| EngineError::Protocol(format!("{method}: {e}")))
    }
}

#[async_trait]
impl Engine for BridgeEngine {
    async fn initialize(&self) -> Result<(), EngineError> {
        let params =
            serde_json::to_value(&self.options).map_err(|e| EngineError::Protocol(e.to_string()))?;
        self.call::<Value>("initialize", params).await.map(|_| ())
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let result = self.call::<Value>("destroy", Value::Null).await.map(|_| ());

        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(reader) = self
            .reader
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        {
            reader.abort();
        }
        self.shared.fail_pending();
        self.shared.set_info(None);
        result
    }

    async fn send_message(
        &self,
        to: &str,
        content: &MessageContent,
    ) -> Result<SentMessage, EngineError> {
        self.call(
            "sendMessage",
            json!({ "chatId": to, "content": content_to_wire(content) }),
        )
        .await
    }

    async fn get_chats(&self) -> Result<Vec<ChatSummary>, EngineError> {
        self.call("getChats", Value::Null).await
    }

    async fn get_chat_by_id(&self, chat_id: &str) -> Result<Option<ChatSummary>, EngineError> {
        self.call("getChatById", json!({ "chatId": chat_id })).await
    }

    async fn get_number_id(&self, number: &str) -> Result<Option<String>, EngineError> {
        self.call("getNumberId", json!({ "number": number })).await
    }

    async fn get_state(&self) -> Result<Option<ConnectionState>, EngineError> {
        self.call("getState", Value::Null).await
    }

    async fn info(&self) -> Option<ClientInfo> {
        self.shared
            .info
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }
}

/// Dials the engine sidecar once per created handle.
pub struct BridgeEngineFactory {
    url: String,
    options: BridgeOptions,
    request_timeout: Duration,
}

impl BridgeEngineFactory {
    pub fn new(url: impl Into<String>, options: BridgeOptions, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            options,
            request_timeout,
        }
    }
}

#[async_trait]
impl EngineFactory for BridgeEngineFactory {
    async fn create_engine(&self, events: Arc<EventBus>) -> Result<Arc<dyn Engine>, EngineError> {
        info!(target: "Gateway/Bridge", "Dialing engine at {}", self.url);
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();

        let shared = Arc::new(BridgeShared::new(events));
        let reader = tokio::spawn(read_pump(stream, shared.clone()));

        Ok(Arc::new(BridgeEngine {
            sink: Mutex::new(Some(sink)),
            shared,
            reader: std::sync::Mutex::new(Some(reader)),
            id_counter: AtomicU64::new(1),
            options: self.options.clone(),
            request_timeout: self.request_timeout,
        }))
    }
}
