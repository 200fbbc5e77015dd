//! Removal of per-user session directories after a session ends.
//!
//! The engine may keep files open for a while after a connector is
//! destroyed, so deletion is retried on a fixed delay while the failure
//! looks transient. Any other failure ends the attempt. Outcomes are only
//! logged.

use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use relay_core::UserId;

/// Filesystem operations the worker needs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Recursively delete `path`. A missing path is not an error.
    async fn remove_dir(&self, path: &Path) -> io::Result<()>;

    async fn exists(&self, path: &Path) -> bool;
}

/// [`SessionStore`] backed by the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsSessionStore;

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        // An unreadable parent counts as present so the attempt is retried.
        tokio::fs::try_exists(path).await.unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The directory is gone (or never existed).
    Removed { attempts: u32 },
    /// Still locked after every retry.
    Exhausted { attempts: u32 },
    /// Failed with an error that retrying would not fix.
    Failed { attempts: u32, error: String },
}

/// Marks a user as having a cleanup outstanding. Dropping it clears the mark.
#[must_use = "dropping the ticket releases the pending mark"]
pub struct CleanupTicket {
    user_id: UserId,
    pending: Arc<DashSet<UserId>>,
}

impl CleanupTicket {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl Drop for CleanupTicket {
    fn drop(&mut self) {
        self.pending.remove(&self.user_id);
    }
}

/// Deletes `{root}/user-{id}` directories in the background.
///
/// At most one cleanup is outstanding per user. Callers reserve a ticket
/// before the session record disappears so that a new start for the same
/// user can see the pending cleanup and back off.
#[derive(Clone)]
pub struct CleanupWorker {
    root: PathBuf,
    store: Arc<dyn SessionStore>,
    policy: CleanupPolicy,
    pending: Arc<DashSet<UserId>>,
}

impl CleanupWorker {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn SessionStore>, policy: CleanupPolicy) -> Self {
        Self {
            root: root.into(),
            store,
            policy,
            pending: Arc::new(DashSet::new()),
        }
    }

    /// `{root}/user-{id}`, or `None` when the id would not stay a single
    /// directory directly under the root.
    pub fn session_dir(&self, user_id: &UserId) -> Option<PathBuf> {
        if !UserId::is_safe(user_id.as_str()) {
            return None;
        }
        let name = format!("user-{user_id}");
        let mut components = Path::new(&name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == name.as_str() => {
                let dir = self.root.join(part);
                (dir.parent() == Some(self.root.as_path())).then_some(dir)
            }
            _ => None,
        }
    }

    pub fn is_pending(&self, user_id: &UserId) -> bool {
        self.pending.contains(user_id)
    }

    /// Mark a cleanup as outstanding. Returns `None` if one already is.
    pub fn reserve(&self, user_id: &UserId) -> Option<CleanupTicket> {
        if !self.pending.insert(user_id.clone()) {
            warn!(user_id = %user_id, "cleanup already pending");
            return None;
        }
        Some(CleanupTicket {
            user_id: user_id.clone(),
            pending: Arc::clone(&self.pending),
        })
    }

    /// Run the cleanup for a reserved user in the background. The pending
    /// mark is cleared when the task finishes.
    pub fn spawn(&self, ticket: CleanupTicket) -> JoinHandle<CleanupOutcome> {
        self.spawn_with_release(ticket, std::future::ready(()))
    }

    /// Like [`spawn`](Self::spawn), but the pending mark is held until both
    /// the cleanup and `release` have finished.
    pub fn spawn_with_release<F>(&self, ticket: CleanupTicket, release: F) -> JoinHandle<CleanupOutcome>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = self.clone();
        tokio::spawn(async move {
            let (outcome, ()) = tokio::join!(worker.run(ticket.user_id()), release);
            drop(ticket);
            outcome
        })
    }

    /// Reserve and spawn in one step. `None` if a cleanup is already
    /// outstanding for this user.
    pub fn cleanup(&self, user_id: &UserId) -> Option<JoinHandle<CleanupOutcome>> {
        self.reserve(user_id).map(|ticket| self.spawn(ticket))
    }

    async fn run(&self, user_id: &UserId) -> CleanupOutcome {
        let Some(path) = self.session_dir(user_id) else {
            error!(user_id = %user_id, root = %self.root.display(), "refusing to clean up outside the session root");
            return CleanupOutcome::Failed {
                attempts: 0,
                error: "user id does not map to a session directory".into(),
            };
        };
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.store.remove_dir(&path).await {
                Ok(()) => {
                    if !self.store.exists(&path).await {
                        info!(user_id = %user_id, path = %path.display(), attempts, "session directory deleted");
                        return CleanupOutcome::Removed { attempts };
                    }
                    warn!(user_id = %user_id, path = %path.display(), attempts, "session directory still present after delete");
                }
                Err(e) if is_busy(&e) => {
                    warn!(user_id = %user_id, path = %path.display(), attempts, error = %e, "session directory locked");
                }
                Err(e) => {
                    error!(user_id = %user_id, path = %path.display(), attempts, error = %e, "session directory delete failed");
                    return CleanupOutcome::Failed {
                        attempts,
                        error: e.to_string(),
                    };
                }
            }

            if attempts > self.policy.max_retries {
                error!(user_id = %user_id, path = %path.display(), attempts, "giving up on session directory");
                return CleanupOutcome::Exhausted { attempts };
            }
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}

fn is_busy(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::PermissionDenied | io::ErrorKind::DirectoryNotEmpty
    )
}
