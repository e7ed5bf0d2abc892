use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::engine::{
    AckLevel, ChatSummary, ClientInfo, ConnectionState, Engine, EngineError, EngineFactory,
    EventBus, MessageContent, SentMessage,
};
use crate::lifecycle::ProcessTerminator;

/// In-memory engine with scripted lookups and send failures.
#[derive(Default)]
pub struct MockEngine {
    pub number_ids: Mutex<HashMap<String, String>>,
    pub chats: Mutex<Vec<ChatSummary>>,
    pub state: Mutex<Option<ConnectionState>>,
    pub identity: Mutex<Option<ClientInfo>>,
    pub send_failures: Mutex<VecDeque<EngineError>>,
    pub sent: Mutex<Vec<(String, MessageContent)>>,
    pub state_probes: AtomicUsize,
    pub chat_fetches: AtomicUsize,
    pub initialized: AtomicUsize,
    pub destroyed: AtomicBool,
    pub fail_initialize: AtomicBool,
    pub fail_state_probe: AtomicBool,
    pub fail_number_lookup: AtomicBool,
    failures_used: AtomicUsize,
    initialize_gate: Option<Arc<Notify>>,
}

impl MockEngine {
    pub fn connected() -> Self {
        let engine = Self::default();
        *engine.state.lock().unwrap() = Some(ConnectionState::Connected);
        engine
    }

    /// Makes `initialize` block until the gate is notified.
    pub fn with_initialize_gate(mut self, gate: Arc<Notify>) -> Self {
        self.initialize_gate = Some(gate);
        self
    }

    pub fn with_number(self, digits: &str, address: &str) -> Self {
        self.number_ids
            .lock()
            .unwrap()
            .insert(digits.to_string(), address.to_string());
        self
    }

    pub fn with_chat(self, id: &str, name: &str, is_group: bool) -> Self {
        self.chats.lock().unwrap().push(ChatSummary {
            id: id.to_string(),
            name: name.to_string(),
            is_group,
        });
        self
    }

    pub fn fail_sends(self, failures: impl IntoIterator<Item = EngineError>) -> Self {
        self.send_failures.lock().unwrap().extend(failures);
        self
    }

    pub fn set_state(&self, state: Option<ConnectionState>) {
        *self.state.lock().unwrap() = state;
    }

    pub fn sent(&self) -> Vec<(String, MessageContent)> {
        self.sent.lock().unwrap().clone()
    }

    /// Every `send_message` call, failed or not.
    pub fn send_attempts(&self) -> usize {
        self.sent.lock().unwrap().len() + self.failures_used.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn initialize(&self) -> Result<(), EngineError> {
        if let Some(gate) = &self.initialize_gate {
            gate.notified().await;
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("browser failed to launch".into()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(
        &self,
        to: &str,
        content: &MessageContent,
    ) -> Result<SentMessage, EngineError> {
        if let Some(failure) = self.send_failures.lock().unwrap().pop_front() {
            self.failures_used.fetch_add(1, Ordering::SeqCst);
            return Err(failure);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), content.clone()));
        Ok(SentMessage {
            id: format!("3EB0MOCK{:04}", sent.len()),
            to: to.to_string(),
            ack: AckLevel::Server,
        })
    }

    async fn get_chats(&self) -> Result<Vec<ChatSummary>, EngineError> {
        self.chat_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.chats.lock().unwrap().clone())
    }

    async fn get_chat_by_id(&self, chat_id: &str) -> Result<Option<ChatSummary>, EngineError> {
        Ok(self
            .chats
            .lock()
            .unwrap()
            .iter()
            .find(|chat| chat.id == chat_id)
            .cloned())
    }

    async fn get_number_id(&self, number: &str) -> Result<Option<String>, EngineError> {
        if self.fail_number_lookup.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("Evaluation failed: lookup".into()));
        }
        Ok(self.number_ids.lock().unwrap().get(number).cloned())
    }

    async fn get_state(&self) -> Result<Option<ConnectionState>, EngineError> {
        self.state_probes.fetch_add(1, Ordering::SeqCst);
        if self.fail_state_probe.load(Ordering::SeqCst) {
            return Err(EngineError::Disconnected);
        }
        Ok(*self.state.lock().unwrap())
    }

    async fn info(&self) -> Option<ClientInfo> {
        self.identity.lock().unwrap().clone()
    }
}

type EngineBuilder = Box<dyn Fn() -> MockEngine + Send + Sync>;

/// Hands out fresh [`MockEngine`]s and remembers every one it created.
pub struct MockEngineFactory {
    build: EngineBuilder,
    created: Mutex<Vec<Arc<MockEngine>>>,
    create_calls: AtomicUsize,
    create_gate: Mutex<Option<Arc<Notify>>>,
    /// Number of upcoming `create_engine` calls that fail with `Connect`.
    pub connect_failures: AtomicUsize,
}

impl MockEngineFactory {
    pub fn new(build: impl Fn() -> MockEngine + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            created: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            create_gate: Mutex::new(None),
            connect_failures: AtomicUsize::new(0),
        }
    }

    /// Makes later `create_engine` calls block until the gate is notified.
    pub fn gate_creation(&self, gate: Arc<Notify>) {
        *self.create_gate.lock().unwrap() = Some(gate);
    }

    /// Every `create_engine` call, including ones still blocked or refused.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn latest(&self) -> Arc<MockEngine> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no engine has been created yet")
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create_engine(&self, _events: Arc<EventBus>) -> Result<Arc<dyn Engine>, EngineError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.create_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let pending = self.connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.connect_failures.store(pending - 1, Ordering::SeqCst);
            return Err(EngineError::Connect("connection refused".into()));
        }
        let engine = Arc::new((self.build)());
        self.created.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}

/// Records terminate calls instead of exiting, along with whether the watched
/// path still existed at that moment.
pub struct RecordingTerminator {
    watched: PathBuf,
    exits: Mutex<Vec<(i32, bool)>>,
}

impl RecordingTerminator {
    pub fn watching(path: &Path) -> Self {
        Self {
            watched: path.to_path_buf(),
            exits: Mutex::new(Vec::new()),
        }
    }

    pub fn exits(&self) -> Vec<(i32, bool)> {
        self.exits.lock().unwrap().clone()
    }
}

impl ProcessTerminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        let exists = self.watched.exists();
        self.exits.lock().unwrap().push((code, exists));
    }
}

/// Polls `condition` until it holds, failing the test after about two seconds.
pub async fn settle(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition did not settle in time");
}
