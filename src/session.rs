//! Authentication phase tracking driven by engine events.

use crate::engine::{ClientInfo, EngineEvent, EventHandler};
use crate::qr_cache::{QrCache, QrChallenge};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const QR_SIGNAL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Unauthenticated,
    QrPending,
    Authenticated,
    Ready,
    Disconnected,
}

impl AuthPhase {
    /// True once the engine has confirmed an identity for this session.
    pub fn is_authenticated(self) -> bool {
        matches!(self, AuthPhase::Authenticated | AuthPhase::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthPhase::Unauthenticated => "unauthenticated",
            AuthPhase::QrPending => "qr_pending",
            AuthPhase::Authenticated => "authenticated",
            AuthPhase::Ready => "ready",
            AuthPhase::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published to QR waiters when a challenge is issued or a login completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrSignal {
    Issued(QrChallenge),
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: AuthPhase,
    pub me: Option<ClientInfo>,
    pub qr_required: bool,
    /// Last state name reported through `change_state`.
    pub engine_state: Option<String>,
}

struct SessionState {
    phase: AuthPhase,
    qr: QrCache,
    identity: Option<ClientInfo>,
    engine_state: Option<String>,
}

/// Owns the authentication phase and the QR cache behind one lock, so every
/// phase transition and its QR side effect are observed together.
pub struct SessionTracker {
    state: Mutex<SessionState>,
    qr_signals: broadcast::Sender<QrSignal>,
}

impl SessionTracker {
    pub fn new(qr_ttl: Duration) -> Self {
        let (qr_signals, _) = broadcast::channel(QR_SIGNAL_CAPACITY);
        Self {
            state: Mutex::new(SessionState {
                phase: AuthPhase::Unauthenticated,
                qr: QrCache::new(qr_ttl),
                identity: None,
                engine_state: None,
            }),
            qr_signals,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .expect("session state lock should not be poisoned")
    }

    pub fn phase(&self) -> AuthPhase {
        self.lock().phase
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            phase: state.phase,
            me: state.identity.clone(),
            qr_required: !state.phase.is_authenticated() && state.qr.is_active_at(now),
            engine_state: state.engine_state.clone(),
        }
    }

    /// The cached challenge, if one is live and no identity is confirmed yet.
    pub fn current_qr(&self) -> Option<QrChallenge> {
        let state = self.lock();
        if state.phase.is_authenticated() {
            return None;
        }
        state.qr.current().cloned()
    }

    /// Number of callers currently blocked in [`wait_for_qr`](Self::wait_for_qr).
    pub fn qr_listener_count(&self) -> usize {
        self.qr_signals.receiver_count()
    }

    /// Returns the live challenge, or waits up to `ceiling` for the next one.
    /// Returns `None` on timeout, or when a login completes first. Resets and
    /// disconnects do not end the wait.
    pub async fn wait_for_qr(&self, ceiling: Duration) -> Option<QrChallenge> {
        // Subscribe before looking at the cache so a challenge issued in between is not missed.
        let mut signals = self.qr_signals.subscribe();

        if self.phase().is_authenticated() {
            return None;
        }
        if let Some(challenge) = self.current_qr() {
            return Some(challenge);
        }

        let waited = tokio::time::timeout(ceiling, async {
            loop {
                match signals.recv().await {
                    Ok(QrSignal::Issued(challenge)) => return Some(challenge),
                    Ok(QrSignal::Authenticated) => return None,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(target: "Gateway/Session", "QR waiter lagged by {skipped} signals");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await;

        waited.unwrap_or_else(|_| {
            debug!(target: "Gateway/Session", "No QR challenge within {}s", ceiling.as_secs());
            None
        })
    }

    fn publish(&self, signal: QrSignal) {
        // No receivers is the common case.
        let _ = self.qr_signals.send(signal);
    }

    /// Back to `Unauthenticated` for a freshly created engine handle.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.phase = AuthPhase::Unauthenticated;
            state.qr.clear();
            state.identity = None;
            state.engine_state = None;
        }
        debug!(target: "Gateway/Session", "Session state reset");
    }

    pub fn on_qr(&self, payload: &str) {
        let challenge = {
            let mut state = self.lock();
            if state.phase.is_authenticated() {
                warn!(target: "Gateway/Session", "Ignoring QR challenge while {}", state.phase);
                return;
            }
            state.phase = AuthPhase::QrPending;
            state.qr.record(payload)
        };
        info!(target: "Gateway/Session", "QR updated");
        self.publish(QrSignal::Issued(challenge));
    }

    pub fn on_authenticated(&self) {
        {
            let mut state = self.lock();
            state.phase = AuthPhase::Authenticated;
            state.qr.clear();
        }
        info!(target: "Gateway/Session", "AUTHENTICATED");
        self.publish(QrSignal::Authenticated);
    }

    pub fn on_ready(&self, identity: Option<ClientInfo>) {
        {
            let mut state = self.lock();
            if !state.phase.is_authenticated() {
                debug!(target: "Gateway/Session", "Ready arrived while {}, treating as authenticated", state.phase);
                state.phase = AuthPhase::Authenticated;
            }
            state.qr.clear();
            state.phase = AuthPhase::Ready;
            if identity.is_some() {
                state.identity = identity;
            }
        }
        info!(target: "Gateway/Session", "READY");
        self.publish(QrSignal::Authenticated);
    }

    pub fn on_auth_failure(&self, message: &str) {
        let phase = self.phase();
        error!(target: "Gateway/Session", "AUTH FAILURE while {phase}: {message}");
    }

    pub fn on_change_state(&self, engine_state: &str) {
        self.lock().engine_state = Some(engine_state.to_string());
        info!(target: "Gateway/Session", "STATE {engine_state}");
    }

    pub fn on_disconnected(&self, reason: &str) {
        {
            let mut state = self.lock();
            state.phase = AuthPhase::Disconnected;
            state.qr.clear();
            state.identity = None;
        }
        error!(target: "Gateway/Session", "DISCONNECTED: {reason}");
    }
}

impl EventHandler for SessionTracker {
    fn handle_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Qr(payload) => self.on_qr(payload),
            EngineEvent::Authenticated => self.on_authenticated(),
            EngineEvent::Ready(identity) => self.on_ready(identity.clone()),
            EngineEvent::AuthFailure(message) => self.on_auth_failure(message),
            EngineEvent::ChangeState(engine_state) => self.on_change_state(engine_state),
            EngineEvent::Disconnected(reason) => self.on_disconnected(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qr_cache::DEFAULT_QR_TTL;
    use chrono::TimeDelta;
    use std::sync::Arc;

    fn tracker() -> SessionTracker {
        SessionTracker::new(DEFAULT_QR_TTL)
    }

    fn identity() -> ClientInfo {
        ClientInfo {
            wid: "6281234567890@c.us".into(),
            pushname: Some("Ops".into()),
        }
    }

    #[test]
    fn qr_event_moves_to_pending_and_requires_scan() {
        let tracker = tracker();
        assert_eq!(tracker.phase(), AuthPhase::Unauthenticated);

        tracker.handle_event(&EngineEvent::Qr("2@abc".into()));

        assert_eq!(tracker.phase(), AuthPhase::QrPending);
        assert_eq!(tracker.current_qr().unwrap().payload, "2@abc");
        assert!(tracker.snapshot().qr_required);
    }

    #[test]
    fn authenticated_clears_a_fresh_challenge() {
        let tracker = tracker();
        tracker.handle_event(&EngineEvent::Qr("2@abc".into()));
        tracker.handle_event(&EngineEvent::Authenticated);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Authenticated);
        assert!(!snapshot.qr_required);
        assert!(tracker.current_qr().is_none());
    }

    #[test]
    fn ready_clears_cache_and_populates_identity() {
        let tracker = tracker();
        tracker.handle_event(&EngineEvent::Qr("2@abc".into()));
        tracker.handle_event(&EngineEvent::Authenticated);
        tracker.handle_event(&EngineEvent::Ready(Some(identity())));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Ready);
        assert_eq!(snapshot.me, Some(identity()));
        assert!(!snapshot.qr_required);
    }

    #[test]
    fn ready_without_prior_authenticated_still_ends_ready_with_empty_cache() {
        let tracker = tracker();
        tracker.handle_event(&EngineEvent::Qr("2@abc".into()));
        tracker.handle_event(&EngineEvent::Ready(None));

        assert_eq!(tracker.phase(), AuthPhase::Ready);
        assert!(tracker.current_qr().is_none());
    }

    #[test]
    fn qr_is_ignored_once_authenticated() {
        let tracker = tracker();
        tracker.handle_event(&EngineEvent::Authenticated);
        tracker.handle_event(&EngineEvent::Ready(Some(identity())));
        tracker.handle_event(&EngineEvent::Qr("late".into()));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Ready);
        assert!(!snapshot.qr_required);
        assert!(tracker.current_qr().is_none());
    }

    #[test]
    fn auth_failure_keeps_the_current_phase() {
        let tracker = tracker();
        tracker.handle_event(&EngineEvent::Qr("2@abc".into()));
        tracker.handle_event(&EngineEvent::AuthFailure("restore failed".into()));
        assert_eq!(tracker.phase(), AuthPhase::QrPending);

        let fresh = SessionTracker::new(DEFAULT_QR_TTL);
        fresh.handle_event(&EngineEvent::AuthFailure("restore failed".into()));
        assert_eq!(fresh.phase(), AuthPhase::Unauthenticated);
    }

    #[test]
    fn disconnect_clears_state_and_reset_starts_over() {
        let tracker = tracker();
        tracker.handle_event(&EngineEvent::Ready(Some(identity())));
        tracker.handle_event(&EngineEvent::ChangeState("CONFLICT".into()));
        tracker.handle_event(&EngineEvent::Disconnected("NAVIGATION".into()));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase, AuthPhase::Disconnected);
        assert!(snapshot.me.is_none());
        assert_eq!(snapshot.engine_state.as_deref(), Some("CONFLICT"));

        tracker.reset();
        assert_eq!(tracker.phase(), AuthPhase::Unauthenticated);
        assert!(tracker.snapshot().engine_state.is_none());
    }

    #[test]
    fn expired_challenge_is_not_required() {
        let tracker = tracker();
        tracker.handle_event(&EngineEvent::Qr("2@abc".into()));

        let later = Utc::now() + TimeDelta::seconds(121);
        assert!(!tracker.snapshot_at(later).qr_required);
        assert_eq!(tracker.snapshot_at(later).phase, AuthPhase::QrPending);
    }

    #[tokio::test]
    async fn wait_returns_live_challenge_immediately() {
        let tracker = tracker();
        tracker.on_qr("2@abc");

        let challenge = tracker.wait_for_qr(Duration::from_secs(30)).await;
        assert_eq!(challenge.unwrap().payload, "2@abc");
        assert_eq!(tracker.qr_listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_releases_listener() {
        let tracker = tracker();

        for _ in 0..3 {
            assert!(tracker.wait_for_qr(Duration::from_secs(30)).await.is_none());
            assert_eq!(tracker.qr_listener_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_receives_the_next_challenge() {
        let tracker = Arc::new(tracker());
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_for_qr(Duration::from_secs(30)).await }
        });

        while tracker.qr_listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        tracker.on_qr("2@next");

        let challenge = waiter.await.unwrap().unwrap();
        assert_eq!(challenge.payload, "2@next");
        assert_eq!(tracker.qr_listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ends_early_when_authentication_clears_the_cache() {
        let tracker = Arc::new(tracker());
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_for_qr(Duration::from_secs(30)).await }
        });

        while tracker.qr_listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        tracker.on_authenticated();

        assert!(waiter.await.unwrap().is_none());
        assert_eq!(tracker.qr_listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_and_disconnect_keep_the_waiter_waiting() {
        let tracker = Arc::new(tracker());
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_for_qr(Duration::from_secs(30)).await }
        });

        while tracker.qr_listener_count() == 0 {
            tokio::task::yield_now().await;
        }
        tracker.reset();
        tracker.on_disconnected("NAVIGATION");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!waiter.is_finished());
        assert_eq!(tracker.qr_listener_count(), 1);

        tracker.on_qr("2@after-restart");
        let challenge = waiter.await.unwrap().unwrap();
        assert_eq!(challenge.payload, "2@after-restart");
        assert_eq!(tracker.qr_listener_count(), 0);
    }
}
