//! Outbound message delivery: target resolution, failure classification and
//! the transient-failure retry loop.

use crate::engine::{Engine, EngineError, MediaPayload, MessageContent, SentMessage};
use crate::error::GatewayError;
use crate::lifecycle::LifecycleManager;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Where a message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A phone number in any human format; only its digits are used.
    Phone(String),
    Group(GroupRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRef {
    Id(String),
    Name(String),
}

impl GroupRef {
    /// Values containing `@` are protocol addresses, anything else is a display name.
    pub fn parse(value: &str) -> Self {
        if value.contains('@') {
            GroupRef::Id(value.to_string())
        } else {
            GroupRef::Name(value.to_string())
        }
    }
}

pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Resolves a target to the protocol address the engine sends to.
pub async fn resolve_target(engine: &dyn Engine, target: &Target) -> Result<String, GatewayError> {
    match target {
        Target::Phone(raw) => {
            let digits = normalize_phone(raw);
            let not_found = || {
                GatewayError::TargetNotFound(format!("Number {raw} is not registered on WhatsApp"))
            };
            if digits.is_empty() {
                return Err(not_found());
            }
            match engine.get_number_id(&digits).await {
                Ok(Some(address)) => Ok(address),
                Ok(None) => Err(not_found()),
                Err(e) => {
                    debug!(target: "Gateway/Send", "Number lookup for {digits} failed, treating as unregistered: {e}");
                    Err(not_found())
                }
            }
        }
        Target::Group(GroupRef::Id(id)) => match engine.get_chat_by_id(id).await? {
            Some(chat) if chat.is_group => Ok(chat.id),
            _ => Err(GatewayError::TargetNotFound("Group not found".into())),
        },
        Target::Group(GroupRef::Name(name)) => engine
            .get_chats()
            .await?
            .into_iter()
            .find(|chat| chat.is_group && chat.name == *name)
            .map(|chat| chat.id)
            .ok_or_else(|| GatewayError::TargetNotFound("Group not found".into())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The engine's page context went away mid-call.
    EvaluationContext,
    TransportDisconnected,
    NotReady,
    /// Generic script evaluation failure inside the engine.
    Evaluation,
    Permanent,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }
}

/// Lowercase substrings of engine failure messages worth retrying. Checked in order.
pub const TRANSIENT_SIGNATURES: &[(&str, FailureKind)] = &[
    ("execution context was destroyed", FailureKind::EvaluationContext),
    ("cannot find context with specified id", FailureKind::EvaluationContext),
    ("target closed", FailureKind::TransportDisconnected),
    ("session closed", FailureKind::TransportDisconnected),
    ("disconnected", FailureKind::TransportDisconnected),
    ("not ready", FailureKind::NotReady),
    ("evaluation failed", FailureKind::Evaluation),
];

pub fn classify_failure(message: &str) -> FailureKind {
    let message = message.to_lowercase();
    TRANSIENT_SIGNATURES
        .iter()
        .find(|(signature, _)| message.contains(signature))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Permanent)
}

pub fn classify_engine_error(error: &EngineError) -> FailureKind {
    match error {
        EngineError::Disconnected | EngineError::Connect(_) => FailureKind::TransportDisconnected,
        EngineError::Timeout(_) => FailureKind::NotReady,
        EngineError::Rejected(message) => classify_failure(message),
        EngineError::Protocol(_) => FailureKind::Permanent,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(800),
            multiplier: 1.5,
            max_delay: Duration::from_millis(4000),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_millis = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(max_millis).round() as u64)
    }

    /// Every delay the policy can produce, one per gap between attempts.
    pub fn delays(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|attempt| self.delay_after(attempt)).collect()
    }
}

pub struct MessageSender {
    lifecycle: Arc<LifecycleManager>,
    policy: RetryPolicy,
}

impl MessageSender {
    pub fn new(lifecycle: Arc<LifecycleManager>, policy: RetryPolicy) -> Self {
        Self { lifecycle, policy }
    }

    /// Sends a text message. Phone targets get the transient-failure retry;
    /// group targets are attempted once.
    pub async fn send_text(&self, target: &Target, text: &str) -> Result<SentMessage, GatewayError> {
        // The handle is captured once; a reinit during the send does not redirect it.
        let engine = self.lifecycle.engine().await?;
        let to = resolve_target(engine.as_ref(), target).await?;
        let content = MessageContent::Text(text.to_string());

        match target {
            Target::Phone(_) => self.deliver_with_retry(engine.as_ref(), &to, &content).await,
            Target::Group(_) => deliver_once(engine.as_ref(), &to, &content).await,
        }
    }

    pub async fn send_media(&self, target: &Target, media: MediaPayload) -> Result<SentMessage, GatewayError> {
        let engine = self.lifecycle.engine().await?;
        let to = resolve_target(engine.as_ref(), target).await?;
        deliver_once(engine.as_ref(), &to, &MessageContent::Media(media)).await
    }

    async fn deliver_with_retry(
        &self,
        engine: &dyn Engine,
        to: &str,
        content: &MessageContent,
    ) -> Result<SentMessage, GatewayError> {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let error = match engine.send_message(to, content).await {
                Ok(sent) => {
                    if attempt > 1 {
                        info!(target: "Gateway/Send", "Delivered to {to} on attempt {attempt}");
                    }
                    return Ok(sent);
                }
                Err(e) => e,
            };

            let kind = classify_engine_error(&error);
            if !kind.is_transient() {
                return Err(error.into());
            }
            if attempt == max_attempts {
                warn!(target: "Gateway/Send", "Attempt {attempt}/{max_attempts} to {to} failed ({kind:?}): {error}");
                break;
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                target: "Gateway/Send",
                "Attempt {attempt}/{max_attempts} to {to} failed ({kind:?}): {error}; retrying in {delay:?}"
            );
            sleep(delay).await;

            match engine.get_state().await {
                Ok(state) => debug!(
                    target: "Gateway/Send",
                    "Engine state before retry: {}",
                    state.map_or("null", |s| s.as_str())
                ),
                Err(e) => debug!(target: "Gateway/Send", "State probe failed before retry: {e}"),
            }
        }

        warn!(target: "Gateway/Send", "Giving up on {to} after {max_attempts} attempts, scheduling soft reinit");
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            if let Err(e) = lifecycle.soft_reinit().await {
                warn!(target: "Gateway/Send", "Soft reinit after send exhaustion failed: {e}");
            }
        });
        Err(GatewayError::ConnectionNotReady {
            attempts: max_attempts,
        })
    }
}

async fn deliver_once(
    engine: &dyn Engine,
    to: &str,
    content: &MessageContent,
) -> Result<SentMessage, GatewayError> {
    engine.send_message(to, content).await.map_err(|e| {
        if classify_engine_error(&e).is_transient() {
            GatewayError::TransientSendFailure(e.to_string())
        } else {
            e.into()
        }
    })
}
