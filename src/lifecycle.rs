//! Ownership of the single engine handle and its recovery paths.

use crate::engine::{
    BRIDGE_CLOSED_REASON, Engine, EngineError, EngineEvent, EngineFactory, EventBus, EventHandler,
};
use crate::error::GatewayError;
use crate::session::SessionTracker;
use log::{debug, error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;

const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Ends the hosting process. The gateway relies on an external supervisor to
/// start it again.
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, code: i32);
}

pub struct ExitProcess;

impl ProcessTerminator for ExitProcess {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Whether a disconnect reason means the account was logged out remotely.
pub fn is_logout_reason(reason: &str) -> bool {
    reason.to_uppercase().contains("LOGOUT")
}

pub struct LifecycleManager {
    factory: Arc<dyn EngineFactory>,
    tracker: Arc<SessionTracker>,
    events: Arc<EventBus>,
    handle: RwLock<Option<Arc<dyn Engine>>>,
    initializing: AtomicBool,
    /// Set once a forced logout or shutdown begins. No handle is installed after that.
    closed: AtomicBool,
    generation: AtomicU64,
    session_dir: PathBuf,
    terminator: Arc<dyn ProcessTerminator>,
}

impl LifecycleManager {
    /// Builds the manager and wires the tracker and the manager's own event
    /// handler onto a fresh event bus. No engine handle exists until
    /// [`initialize`](Self::initialize) runs.
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        tracker: Arc<SessionTracker>,
        session_dir: impl Into<PathBuf>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        events.add_handler(tracker.clone());

        let manager = Arc::new(Self {
            factory,
            tracker,
            events: events.clone(),
            handle: RwLock::new(None),
            initializing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            session_dir: session_dir.into(),
            terminator,
        });

        events.add_handler(Arc::new(LifecycleEventHandler {
            manager: Arc::downgrade(&manager),
        }));
        manager
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn tracker(&self) -> Arc<SessionTracker> {
        self.tracker.clone()
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Number of engine handles created so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn engine(&self) -> Result<Arc<dyn Engine>, GatewayError> {
        self.handle
            .read()
            .await
            .clone()
            .ok_or(GatewayError::NotReady(None))
    }

    /// Creates the engine handle. Single-flight: a concurrent call fails with
    /// `AlreadyInitializing`, and a call while a handle is live fails with
    /// `AlreadyInitialized`.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyInitializing);
        }
        let _guard = scopeguard::guard((), |_| {
            self.initializing.store(false, Ordering::SeqCst);
        });

        if self.handle.read().await.is_some() {
            return Err(GatewayError::AlreadyInitialized);
        }
        self.start_engine().await
    }

    /// Keeps calling [`initialize`](Self::initialize) while the engine cannot
    /// be reached, backing off a little more each time.
    pub async fn initialize_with_retry(&self) -> Result<(), GatewayError> {
        self.retry_while_unreachable(move || self.initialize()).await
    }

    /// [`soft_reinit`](Self::soft_reinit), repeated with the same backoff while
    /// the engine cannot be reached.
    pub async fn soft_reinit_with_retry(&self) -> Result<(), GatewayError> {
        self.retry_while_unreachable(move || self.soft_reinit()).await
    }

    async fn retry_while_unreachable<F, Fut>(&self, mut attempt: F) -> Result<(), GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), GatewayError>>,
    {
        let mut failures: u32 = 0;
        loop {
            match attempt().await {
                Err(GatewayError::Engine(EngineError::Connect(e)))
                    if !self.closed.load(Ordering::SeqCst) =>
                {
                    failures += 1;
                    let delay =
                        Duration::from_secs(u64::from(failures) * 2).min(MAX_CONNECT_BACKOFF);
                    warn!(
                        target: "Gateway/Lifecycle",
                        "Engine unreachable ({e}), retrying in {delay:?} (attempt {failures})"
                    );
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn start_engine(&self) -> Result<(), GatewayError> {
        self.tracker.reset();

        let engine = self.factory.create_engine(self.events.clone()).await?;
        {
            // Checked under the write lock so teardown in hard_reinit cannot interleave.
            let mut handle = self.handle.write().await;
            if self.closed.load(Ordering::SeqCst) {
                drop(handle);
                warn!(target: "Gateway/Lifecycle", "Discarding engine handle created while shutting down");
                if let Err(e) = engine.destroy().await {
                    warn!(target: "Gateway/Lifecycle", "Engine destroy failed, continuing: {e}");
                }
                return Err(GatewayError::ShuttingDown);
            }
            *handle = Some(engine.clone());
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(target: "Gateway/Lifecycle", "Engine handle #{generation} created, initializing");

        if let Err(e) = engine.initialize().await {
            error!(target: "Gateway/Lifecycle", "Engine handle #{generation} failed to initialize: {e}");
            self.teardown().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn teardown(&self) {
        let previous = self.handle.write().await.take();
        if let Some(engine) = previous {
            if let Err(e) = engine.destroy().await {
                warn!(target: "Gateway/Lifecycle", "Engine destroy failed, continuing: {e}");
            }
        }
    }

    /// Replaces the engine handle without touching persisted credentials.
    /// Sends already holding the old handle are not cancelled.
    pub async fn soft_reinit(&self) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyInitializing);
        }
        let _guard = scopeguard::guard((), |_| {
            self.initializing.store(false, Ordering::SeqCst);
        });

        warn!(target: "Gateway/Lifecycle", "Soft reinit: recreating engine handle, keeping session storage");
        self.teardown().await;
        self.start_engine().await
    }

    /// Recovery after a forced logout. Destroys the handle, deletes the
    /// session directory, then ends the process with status 1. The steps run
    /// in that order so a restarted process cannot pick up the revoked
    /// credentials. Returns only when the terminator does not exit.
    pub async fn hard_reinit(&self, reason: &str) -> Result<(), GatewayError> {
        self.closed.store(true, Ordering::SeqCst);
        error!(target: "Gateway/Lifecycle", "{}", GatewayError::ForcedLogout(reason.to_string()));
        if self.initializing.swap(true, Ordering::SeqCst) {
            warn!(target: "Gateway/Lifecycle", "Engine (re)initialization in flight during forced logout, its handle will be discarded");
        }

        self.teardown().await;
        let wiped = wipe_session_dir(&self.session_dir).await;
        match &wiped {
            Ok(()) => info!(target: "Gateway/Lifecycle", "Removed session storage at {}", self.session_dir.display()),
            Err(e) => error!(target: "Gateway/Lifecycle", "Failed to remove session storage: {e}"),
        }

        warn!(target: "Gateway/Lifecycle", "Exiting so the supervisor restarts with a fresh session");
        self.terminator.terminate(1);
        wiped
    }

    /// Destroys the handle for a graceful stop.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.teardown().await;
        info!(target: "Gateway/Lifecycle", "Engine shut down");
    }

    /// Fetches the chat list, which also nudges the engine to finish loading.
    pub async fn prefetch_chats(&self) -> Result<usize, GatewayError> {
        let engine = self.engine().await?;
        Ok(engine.get_chats().await?.len())
    }
}

async fn wipe_session_dir(path: &Path) -> Result<(), GatewayError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(target: "Gateway/Lifecycle", "Session storage {} already absent", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

struct LifecycleEventHandler {
    manager: Weak<LifecycleManager>,
}

impl EventHandler for LifecycleEventHandler {
    fn handle_event(&self, event: &EngineEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        match event {
            EngineEvent::Authenticated => {
                tokio::spawn(async move {
                    match manager.prefetch_chats().await {
                        Ok(count) => info!(target: "Gateway/Lifecycle", "Prefetch chats ok ({count})"),
                        Err(e) => warn!(target: "Gateway/Lifecycle", "Prefetch chats failed: {e}"),
                    }
                });
            }
            EngineEvent::Disconnected(reason) if is_logout_reason(reason) => {
                let reason = reason.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.hard_reinit(&reason).await {
                        error!(target: "Gateway/Lifecycle", "Hard reinit did not complete cleanly: {e}");
                    }
                });
            }
            EngineEvent::Disconnected(reason) if reason == BRIDGE_CLOSED_REASON => {
                tokio::spawn(async move {
                    warn!(target: "Gateway/Lifecycle", "Engine link lost, recreating the handle");
                    match manager.soft_reinit_with_retry().await {
                        Ok(()) => info!(target: "Gateway/Lifecycle", "Engine handle recreated after link loss"),
                        Err(e) => warn!(target: "Gateway/Lifecycle", "Recovery after link loss did not run: {e}"),
                    }
                });
            }
            _ => {}
        }
    }
}
