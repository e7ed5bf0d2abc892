use crate::engine::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    /// Sending was attempted while the session is not ready. Carries the engine
    /// state when one could be read.
    #[error("Client not connected (state={}).", .0.as_deref().unwrap_or("null"))]
    NotReady(Option<String>),
    #[error("{0}")]
    TargetNotFound(String),
    #[error("{0}")]
    TransientSendFailure(String),
    #[error("Client not ready after {attempts} send attempts; connection is being reinitialized, retry later.")]
    ConnectionNotReady { attempts: u32 },
    #[error("forced logout ({0}); session storage discarded")]
    ForcedLogout(String),
    #[error("engine initialization is already in progress")]
    AlreadyInitializing,
    #[error("engine is already initialized")]
    AlreadyInitialized,
    #[error("gateway is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("session storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("QR rendering failed: {0}")]
    QrRender(String),
}
