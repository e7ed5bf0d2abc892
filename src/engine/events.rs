use super::ClientInfo;
use std::sync::{Arc, RwLock};

/// Lifecycle events published by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A new login challenge is available for scanning.
    Qr(String),
    Authenticated,
    Ready(Option<ClientInfo>),
    AuthFailure(String),
    ChangeState(String),
    Disconnected(String),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Qr(_) => "qr",
            EngineEvent::Authenticated => "authenticated",
            EngineEvent::Ready(_) => "ready",
            EngineEvent::AuthFailure(_) => "auth_failure",
            EngineEvent::ChangeState(_) => "change_state",
            EngineEvent::Disconnected(_) => "disconnected",
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &EngineEvent);
}

/// Fans engine events out to every registered handler, in registration order.
#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn dispatch(&self, event: &EngineEvent) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &EngineEvent) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, event.name()));
        }
    }

    #[test]
    fn dispatch_reaches_handlers_in_registration_order() {
        let bus = EventBus::new();

        let log = Arc::new(Mutex::new(Vec::new()));
        bus.add_handler(Arc::new(Recorder {
            label: "first",
            log: log.clone(),
        }));
        bus.add_handler(Arc::new(Recorder {
            label: "second",
            log: log.clone(),
        }));

        bus.dispatch(&EngineEvent::Authenticated);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:authenticated", "second:authenticated"]
        );
    }
}
