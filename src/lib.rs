pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod qr_cache;
pub mod qr_render;
pub mod send;
pub mod session;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use lifecycle::LifecycleManager;
pub use send::{MessageSender, RetryPolicy};
pub use session::SessionTracker;
