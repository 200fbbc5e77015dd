//! Per-user session records.
//!
//! The registry is the only place a [`SessionHandle`] is created or
//! removed. `start` is atomic per user: concurrent starts for the same user
//! produce exactly one connector.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::{Connector, ConnectorFactory, ConnectorState, SessionId, UserId};

use crate::cleanup::CleanupWorker;
use crate::lifecycle;
use crate::notifier::BackendNotifier;
use crate::pairing::{PairingArtifact, PairingRenderer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session was created and its lifecycle started.
    Initialized,
    /// A session for this user already exists. Nothing was changed.
    AlreadyRunning,
    /// The user's previous session directory is still being deleted.
    CleanupPending,
    /// The id cannot name a session directory under the sessions root.
    InvalidUserId,
}

struct SessionShared {
    state: ConnectorState,
    pairing: Option<PairingArtifact>,
}

/// A live session. Cloning shares the same underlying record.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    user_id: UserId,
    connector: Arc<dyn Connector>,
    shared: Arc<RwLock<SessionShared>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    fn new(user_id: UserId, connector: Arc<dyn Connector>) -> Self {
        Self {
            session_id: SessionId::new(),
            user_id,
            connector,
            shared: Arc::new(RwLock::new(SessionShared {
                state: ConnectorState::Initializing,
                pairing: None,
            })),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn state(&self) -> ConnectorState {
        self.shared.read().state
    }

    /// The rendered pairing code, if one is outstanding.
    pub fn pairing_code(&self) -> Option<String> {
        self.shared.read().pairing.as_ref().map(|p| p.encoded.clone())
    }

    pub(crate) fn has_pairing_token(&self, token: &str) -> bool {
        self.shared.read().pairing.as_ref().is_some_and(|p| p.token == token)
    }

    pub(crate) fn transition(&self, to: ConnectorState) -> ConnectorState {
        let mut shared = self.shared.write();
        std::mem::replace(&mut shared.state, to)
    }

    pub(crate) fn set_pairing(&self, artifact: PairingArtifact) {
        let mut shared = self.shared.write();
        shared.pairing = Some(artifact);
        shared.state = ConnectorState::AwaitingPairing;
    }

    pub(crate) fn clear_pairing(&self) {
        self.shared.write().pairing = None;
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Concurrent map from user to live session.
pub struct SessionRegistry {
    sessions: DashMap<UserId, SessionHandle>,
    factory: Arc<dyn ConnectorFactory>,
    notifier: Arc<dyn BackendNotifier>,
    renderer: Arc<dyn PairingRenderer>,
    cleanup: CleanupWorker,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        notifier: Arc<dyn BackendNotifier>,
        renderer: Arc<dyn PairingRenderer>,
        cleanup: CleanupWorker,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            notifier,
            renderer,
            cleanup,
        }
    }

    /// Start a session for `user_id` unless one exists.
    ///
    /// The factory is called while the user's map shard is locked, so it
    /// must not touch the registry.
    pub fn start(self: &Arc<Self>, user_id: UserId) -> StartOutcome {
        let handle = match self.sessions.entry(user_id) {
            Entry::Occupied(_) => return StartOutcome::AlreadyRunning,
            Entry::Vacant(slot) => {
                // A terminating session reserves its cleanup before its record
                // is removed, so a vacant slot with a pending cleanup means
                // the old directory is still in use.
                if self.cleanup.is_pending(slot.key()) {
                    return StartOutcome::CleanupPending;
                }
                let user_id = slot.key().clone();
                let Some(session_dir) = self.cleanup.session_dir(&user_id) else {
                    warn!(user_id = %user_id, "refusing to start session with unsafe user id");
                    return StartOutcome::InvalidUserId;
                };
                let connector = self.factory.create(&user_id, &session_dir);
                let handle = SessionHandle::new(user_id, connector);
                slot.insert(handle.clone());
                handle
            }
        };

        info!(
            user_id = %handle.user_id(),
            session_id = %handle.session_id(),
            "session started"
        );
        lifecycle::spawn(Arc::clone(self), handle);
        StartOutcome::Initialized
    }

    pub fn lookup(&self, user_id: &UserId) -> Option<SessionHandle> {
        self.sessions.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, user_id: &UserId) -> Option<SessionHandle> {
        self.sessions.remove(user_id).map(|(_, handle)| handle)
    }

    /// Remove the record only if it still belongs to `session_id`.
    pub fn remove_session(&self, user_id: &UserId, session_id: &SessionId) -> bool {
        self.sessions
            .remove_if(user_id, |_, handle| handle.session_id() == session_id)
            .is_some()
    }

    pub fn pairing(&self, user_id: &UserId) -> Option<String> {
        self.sessions.get(user_id).and_then(|entry| entry.pairing_code())
    }

    pub fn state(&self, user_id: &UserId) -> Option<ConnectorState> {
        self.sessions.get(user_id).map(|entry| entry.state())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session for process shutdown.
    ///
    /// Lifecycles are cancelled before their connectors are destroyed, so no
    /// status callbacks are sent and session directories are kept for the
    /// next run.
    pub async fn shutdown_all(&self) -> usize {
        let user_ids: Vec<UserId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let mut stopped = 0;

        for user_id in user_ids {
            let Some(handle) = self.remove(&user_id) else {
                continue;
            };
            handle.cancel_token().cancel();
            if let Err(e) = handle.connector().destroy().await {
                warn!(user_id = %user_id, error = %e, "failed to destroy connector during shutdown");
            }
            stopped += 1;
        }

        info!(stopped, "all sessions stopped");
        stopped
    }

    pub(crate) fn notifier(&self) -> Arc<dyn BackendNotifier> {
        Arc::clone(&self.notifier)
    }

    pub(crate) fn renderer(&self) -> &dyn PairingRenderer {
        self.renderer.as_ref()
    }

    pub fn cleanup(&self) -> &CleanupWorker {
        &self.cleanup
    }
}
