//! The per-session state machine.
//!
//! One task per session consumes connector events strictly in order.
//! Callbacks are queued on the session's [`OrderedNotifier`] so a slow
//! backend never holds up event processing.
//!
//! On teardown the user's cleanup ticket stays held until the inactive
//! callback has been delivered, so a restarted session's callbacks can never
//! overtake it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use relay_core::{ConnectorEvent, ConnectorState};

use crate::notifier::{Notification, OrderedNotifier};
use crate::pairing::PairingArtifact;
use crate::registry::{SessionHandle, SessionRegistry};

const EVENT_BUFFER: usize = 64;
const DESTROY_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn spawn(registry: Arc<SessionRegistry>, handle: SessionHandle) -> JoinHandle<()> {
    let span = info_span!(
        "session",
        user_id = %handle.user_id(),
        session_id = %handle.session_id()
    );
    let (notifications, _worker) = OrderedNotifier::spawn(handle.user_id().clone(), registry.notifier());
    let lifecycle = Lifecycle {
        registry,
        handle,
        notifications,
    };
    tokio::spawn(lifecycle.run().instrument(span))
}

struct Lifecycle {
    registry: Arc<SessionRegistry>,
    handle: SessionHandle,
    notifications: OrderedNotifier,
}

/// Why a session ended.
struct Termination {
    state: ConnectorState,
    reason: String,
}

impl Lifecycle {
    async fn run(self) {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

        let connector = Arc::clone(self.handle.connector());
        let failures = tx.clone();
        tokio::spawn(
            async move {
                if let Err(e) = connector.initialize(tx).await {
                    warn!(error = %e, kind = e.error_kind(), "connector initialize failed");
                    let _ = failures
                        .send(ConnectorEvent::Disconnected {
                            reason: format!("initialize failed: {e}"),
                        })
                        .await;
                }
            }
            .in_current_span(),
        );

        let cancel = self.handle.cancel_token().clone();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("lifecycle cancelled");
                    return;
                }
                event = rx.recv() => event,
            };

            let event = event.unwrap_or_else(|| ConnectorEvent::Disconnected {
                reason: "event stream closed".into(),
            });
            if let Some(termination) = self.apply(event) {
                self.terminate(termination).await;
                return;
            }
        }
    }

    /// Apply one event. Returns a termination for terminal events.
    fn apply(&self, event: ConnectorEvent) -> Option<Termination> {
        let state = self.handle.state();
        debug!(event = event.event_type(), state = %state, "connector event");

        match event {
            ConnectorEvent::Pairing { code } => {
                if !state.accepts_pairing() {
                    debug!(state = %state, "ignoring pairing code");
                    return None;
                }
                if self.handle.has_pairing_token(&code) {
                    debug!("pairing code unchanged");
                    return None;
                }
                match self.registry.renderer().render(&code) {
                    Ok(encoded) => {
                        self.handle.set_pairing(PairingArtifact {
                            token: code,
                            encoded: encoded.clone(),
                        });
                        info!("pairing code generated");
                        self.notifications.send(Notification::Pairing { qr_code: encoded });
                    }
                    Err(e) => warn!(error = %e, "dropping pairing code"),
                }
                None
            }
            ConnectorEvent::Ready => {
                if state == ConnectorState::Ready {
                    debug!("duplicate ready event");
                    return None;
                }
                self.handle.clear_pairing();
                self.handle.transition(ConnectorState::Ready);
                info!("client ready");
                self.notifications.send(Notification::Status { active: true });
                None
            }
            ConnectorEvent::Message { from, body } => {
                if state == ConnectorState::Ready {
                    self.notifications.send(Notification::Message { from, body });
                } else {
                    debug!(state = %state, "dropping message received before ready");
                }
                None
            }
            ConnectorEvent::Disconnected { reason } => Some(Termination {
                state: ConnectorState::Disconnected,
                reason,
            }),
            ConnectorEvent::AuthFailure { message } => Some(Termination {
                state: ConnectorState::AuthFailed,
                reason: message,
            }),
        }
    }

    /// Tear down a terminal session: destroy the connector, drop the
    /// record, schedule directory cleanup, then report inactive. A failed
    /// destroy does not stop the remaining steps.
    async fn terminate(self, termination: Termination) {
        let Termination { state, reason } = termination;
        self.handle.transition(state);
        self.handle.clear_pairing();
        info!(state = %state, reason = %reason, "session ended");

        match tokio::time::timeout(DESTROY_TIMEOUT, self.handle.connector().destroy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to destroy connector"),
            Err(_) => warn!(timeout_secs = DESTROY_TIMEOUT.as_secs(), "connector destroy timed out"),
        }

        let user_id = self.handle.user_id();
        let ticket = self.registry.cleanup().reserve(user_id);
        if !self.registry.remove_session(user_id, self.handle.session_id()) {
            debug!("session record already replaced or removed");
        }

        let (delivered, released) = oneshot::channel();
        if let Some(ticket) = ticket {
            self.registry.cleanup().spawn_with_release(ticket, async move {
                let _ = released.await;
            });
        }

        self.notifications.send(Notification::Status { active: false });
        self.notifications.send(Notification::Flushed(delivered));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifyCall;
    use crate::registry::StartOutcome;
    use crate::test_support::Harness;
    use relay_core::{EngineError, UserId};
    use relay_engine::mock::MockConnector;

    fn pairing(code: &str) -> ConnectorEvent {
        ConnectorEvent::Pairing { code: code.into() }
    }

    #[tokio::test]
    async fn pairing_then_ready() {
        let h = Harness::new();
        let user = UserId::new("1");
        h.registry.start(user.clone());
        let mock = h.factory.connector(&user).unwrap();
        assert!(h.wait_initialized(&mock).await);

        mock.emit(pairing("tok-1")).await;
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 1).await);
        assert_eq!(h.registry.state(&user), Some(ConnectorState::AwaitingPairing));
        let code = h.registry.pairing(&user).unwrap();
        assert!(code.starts_with("data:image/svg+xml;base64,"));
        assert_eq!(
            h.notifier.calls()[0],
            NotifyCall::Pairing {
                user_id: user.clone(),
                qr_code: code
            }
        );

        mock.emit(ConnectorEvent::Ready).await;
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);
        assert_eq!(h.registry.state(&user), Some(ConnectorState::Ready));
        assert!(h.registry.pairing(&user).is_none());
        assert_eq!(
            h.notifier.calls()[1],
            NotifyCall::Status {
                user_id: user.clone(),
                active: true
            }
        );
    }

    #[tokio::test]
    async fn pairing_refresh_replaces_code() {
        let h = Harness::with_template(|_| MockConnector::new().with_events(vec![pairing("a"), pairing("b")]));
        let user = UserId::new("1");
        h.registry.start(user.clone());

        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);
        let latest = h.registry.pairing(&user).unwrap();
        assert_eq!(
            h.notifier.calls()[1],
            NotifyCall::Pairing {
                user_id: user,
                qr_code: latest
            }
        );
    }

    #[tokio::test]
    async fn repeated_pairing_code_is_not_resent() {
        let h = Harness::with_template(|_| {
            MockConnector::new().with_events(vec![pairing("a"), pairing("a"), pairing("b")])
        });
        let user = UserId::new("1");
        h.registry.start(user.clone());

        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);
        let calls = h.notifier.calls();
        assert_ne!(calls[0], calls[1]);
        assert_eq!(
            calls[1],
            NotifyCall::Pairing {
                user_id: user.clone(),
                qr_code: h.registry.pairing(&user).unwrap()
            }
        );
    }

    #[tokio::test]
    async fn ready_ignores_later_pairing_codes() {
        let h = Harness::with_template(|_| {
            MockConnector::new().with_events(vec![ConnectorEvent::Ready, pairing("late")])
        });
        let user = UserId::new("2");
        h.registry.start(user.clone());
        let mock = h.factory.connector(&user).unwrap();

        assert!(h.notifier.wait_for(Harness::WAIT, |c| !c.is_empty()).await);
        // A message after the pairing code proves the code was processed.
        mock.emit(ConnectorEvent::Message {
            from: "bob".into(),
            body: "hi".into(),
        })
        .await;
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);

        let calls = h.notifier.calls();
        assert!(matches!(calls[0], NotifyCall::Status { active: true, .. }));
        assert!(matches!(calls[1], NotifyCall::Message { .. }));
        assert_eq!(h.registry.state(&user), Some(ConnectorState::Ready));
        assert!(h.registry.pairing(&user).is_none());
    }

    #[tokio::test]
    async fn messages_before_ready_are_dropped() {
        let h = Harness::with_template(|_| {
            MockConnector::new().with_events(vec![
                ConnectorEvent::Message {
                    from: "early".into(),
                    body: "x".into(),
                },
                ConnectorEvent::Ready,
                ConnectorEvent::Message {
                    from: "bob".into(),
                    body: "hello".into(),
                },
            ])
        });
        let user = UserId::new("3");
        h.registry.start(user.clone());

        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);
        let calls = h.notifier.calls();
        assert_eq!(
            calls[1],
            NotifyCall::Message {
                user_id: user,
                from: "bob".into(),
                body: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn disconnect_tears_down_even_if_destroy_fails() {
        let h = Harness::with_template(|_| {
            MockConnector::new()
                .with_events(vec![ConnectorEvent::Ready])
                .with_destroy_error(EngineError::Request("browser crashed".into()))
        });
        let user = UserId::new("4");
        let dir = h.root.path().join("user-4");
        std::fs::create_dir_all(&dir).unwrap();

        h.registry.start(user.clone());
        let mock = h.factory.connector(&user).unwrap();
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 1).await);

        mock.emit(ConnectorEvent::Disconnected {
            reason: "NAVIGATION".into(),
        })
        .await;
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);

        assert_eq!(mock.destroy_calls(), 1);
        assert!(h.registry.lookup(&user).is_none());
        assert_eq!(
            h.notifier.calls()[1],
            NotifyCall::Status {
                user_id: user.clone(),
                active: false
            }
        );
        assert!(h.wait_cleaned(&user).await);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let h = Harness::with_template(|_| {
            MockConnector::new().with_events(vec![
                pairing("tok"),
                ConnectorEvent::AuthFailure {
                    message: "restore failed".into(),
                },
            ])
        });
        let user = UserId::new("5");
        h.registry.start(user.clone());

        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);
        let calls = h.notifier.calls();
        assert!(matches!(calls[0], NotifyCall::Pairing { .. }));
        assert!(matches!(calls[1], NotifyCall::Status { active: false, .. }));
        assert!(h.registry.lookup(&user).is_none());
        assert_eq!(h.factory.connector(&user).unwrap().destroy_calls(), 1);
    }

    #[tokio::test]
    async fn initialize_failure_counts_as_disconnect() {
        let h = Harness::with_template(|_| {
            MockConnector::new().with_init_error(EngineError::Unavailable("engine down".into()))
        });
        let user = UserId::new("6");
        h.registry.start(user.clone());

        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 1).await);
        assert!(matches!(h.notifier.calls()[0], NotifyCall::Status { active: false, .. }));
        assert!(h.registry.lookup(&user).is_none());
    }

    #[tokio::test]
    async fn closed_stream_counts_as_disconnect() {
        let h = Harness::new();
        let user = UserId::new("7");
        h.registry.start(user.clone());
        let mock = h.factory.connector(&user).unwrap();
        assert!(h.wait_initialized(&mock).await);

        mock.close();
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 1).await);
        assert!(h.registry.lookup(&user).is_none());
    }

    #[tokio::test]
    async fn restart_after_teardown_uses_new_session() {
        let h = Harness::with_template(|_| MockConnector::new().with_events(vec![ConnectorEvent::Ready]));
        let user = UserId::new("8");
        h.registry.start(user.clone());
        let first = h.registry.lookup(&user).unwrap().session_id().clone();
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 1).await);

        h.factory.connector(&user).unwrap().close();
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);
        assert!(h.wait_cleaned(&user).await);

        assert_eq!(h.registry.start(user.clone()), StartOutcome::Initialized);
        assert_ne!(h.registry.lookup(&user).unwrap().session_id(), &first);
        assert_eq!(h.factory.created_for(&user), 2);
    }

    #[tokio::test]
    async fn restart_waits_for_inactive_callback() {
        let h = Harness::slow_backend(Duration::from_millis(100), |_| {
            MockConnector::new().with_events(vec![ConnectorEvent::Ready])
        });
        let user = UserId::new("10");
        h.registry.start(user.clone());
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 1).await);

        h.factory.connector(&user).unwrap().close();
        assert!(h.poll(|| h.registry.lookup(&user).is_none()).await);
        assert_eq!(h.registry.start(user.clone()), StartOutcome::CleanupPending);

        assert!(
            h.poll(|| h.registry.start(user.clone()) == StartOutcome::Initialized)
                .await
        );
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 3).await);

        let statuses: Vec<bool> = h
            .notifier
            .calls()
            .iter()
            .filter_map(|c| match c {
                NotifyCall::Status { active, .. } => Some(*active),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, [true, false, true]);
        assert_eq!(h.registry.state(&user), Some(ConnectorState::Ready));
    }

    #[tokio::test]
    async fn disconnect_runs_cleanup_exactly_once() {
        let h = Harness::with_template(|_| {
            MockConnector::new().with_events(vec![
                ConnectorEvent::Ready,
                ConnectorEvent::Disconnected { reason: "LOGOUT".into() },
                ConnectorEvent::AuthFailure {
                    message: "late".into(),
                },
                ConnectorEvent::Disconnected { reason: "again".into() },
            ])
        });
        let user = UserId::new("11");
        h.registry.start(user.clone());
        let mock = h.factory.connector(&user).unwrap();

        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 2).await);
        assert!(h.wait_cleaned(&user).await);
        mock.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dir = h.root.path().join("user-11");
        assert_eq!(h.store.removals(&dir), 1);
        assert_eq!(mock.destroy_calls(), 1);
        assert_eq!(h.notifier.calls().len(), 2);
    }

    #[tokio::test]
    async fn closed_stream_after_disconnect_runs_cleanup_once() {
        let h = Harness::with_template(|_| MockConnector::new());
        let user = UserId::new("12");
        h.registry.start(user.clone());
        let mock = h.factory.connector(&user).unwrap();
        assert!(h.wait_initialized(&mock).await);

        mock.emit(ConnectorEvent::Disconnected { reason: "CONFLICT".into() }).await;
        mock.close();
        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 1).await);
        assert!(h.wait_cleaned(&user).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.store.removals(&h.root.path().join("user-12")), 1);
        assert_eq!(h.store.total_removals(), 1);
    }

    #[tokio::test]
    async fn backend_failures_do_not_stop_the_session() {
        let h = Harness::failing_backend(|_| {
            MockConnector::new().with_events(vec![
                pairing("tok"),
                ConnectorEvent::Ready,
                ConnectorEvent::Message {
                    from: "a".into(),
                    body: "b".into(),
                },
            ])
        });
        let user = UserId::new("9");
        h.registry.start(user.clone());

        assert!(h.notifier.wait_for(Harness::WAIT, |c| c.len() == 3).await);
        assert_eq!(h.registry.state(&user), Some(ConnectorState::Ready));
    }
}
