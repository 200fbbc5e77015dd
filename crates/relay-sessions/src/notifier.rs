//! Outbound callbacks to the backend control plane.
//!
//! [`HttpNotifier`] posts JSON to `{base_url}/{endpoint}`. Lifecycle
//! notifications go through an [`OrderedNotifier`], a per-session queue that
//! delivers in event order without blocking event processing.
//!
//! Order across sessions of the same user is kept by the lifecycle: a
//! terminating session holds its cleanup ticket until its queue has
//! flushed, and a new session cannot start while that ticket is held.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relay_core::UserId;

use crate::sync::ContactSummary;

pub const ENDPOINT_QR: &str = "update-qr";
pub const ENDPOINT_STATUS: &str = "update-status";
pub const ENDPOINT_MESSAGE: &str = "receive-whatsapp-message";
pub const ENDPOINT_CONTACTS: &str = "receive-whatsapp-contacts";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} returned {status}: {body}")]
    Status { endpoint: String, status: u16, body: String },
}

/// Backend callback sink.
#[async_trait]
pub trait BackendNotifier: Send + Sync {
    async fn notify_pairing(&self, user_id: &UserId, qr_code: &str) -> Result<(), NotifyError>;

    /// `active` is sent as status 1, inactive as 0.
    async fn notify_status(&self, user_id: &UserId, active: bool) -> Result<(), NotifyError>;

    async fn notify_message(&self, user_id: &UserId, from: &str, body: &str) -> Result<(), NotifyError>;

    async fn notify_sync_result(&self, user_id: &UserId, contacts: &[ContactSummary]) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct QrPayload<'a> {
    user_id: &'a UserId,
    qr_code: &'a str,
}

#[derive(Serialize)]
struct StatusPayload<'a> {
    user_id: &'a UserId,
    status: u8,
}

#[derive(Serialize)]
struct MessagePayload<'a> {
    user_id: &'a UserId,
    from: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct ContactsPayload<'a> {
    user_id: &'a UserId,
    contacts: &'a [ContactSummary],
}

/// JSON-over-HTTP notifier.
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport {
                endpoint: "client".into(),
                message: e.to_string(),
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, payload: &T) -> Result<(), NotifyError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        debug!(endpoint, "callback delivered");
        Ok(())
    }
}

#[async_trait]
impl BackendNotifier for HttpNotifier {
    async fn notify_pairing(&self, user_id: &UserId, qr_code: &str) -> Result<(), NotifyError> {
        self.post(ENDPOINT_QR, &QrPayload { user_id, qr_code }).await
    }

    async fn notify_status(&self, user_id: &UserId, active: bool) -> Result<(), NotifyError> {
        let status = u8::from(active);
        self.post(ENDPOINT_STATUS, &StatusPayload { user_id, status }).await
    }

    async fn notify_message(&self, user_id: &UserId, from: &str, body: &str) -> Result<(), NotifyError> {
        self.post(ENDPOINT_MESSAGE, &MessagePayload { user_id, from, body }).await
    }

    async fn notify_sync_result(&self, user_id: &UserId, contacts: &[ContactSummary]) -> Result<(), NotifyError> {
        self.post(ENDPOINT_CONTACTS, &ContactsPayload { user_id, contacts }).await
    }
}

/// A lifecycle notification waiting in a session's queue.
#[derive(Debug)]
pub(crate) enum Notification {
    Pairing { qr_code: String },
    Status { active: bool },
    Message { from: String, body: String },
    /// Fires once everything queued before it has been handled.
    Flushed(oneshot::Sender<()>),
}

/// Per-session delivery queue.
///
/// `send` never waits on the network. A single worker task delivers queued
/// notifications one at a time, so the backend observes them in the order
/// the session produced them. Failures are logged and dropped.
pub(crate) struct OrderedNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl OrderedNotifier {
    /// Start the delivery worker. It exits once every sender is dropped and
    /// the queue is drained.
    pub(crate) fn spawn(user_id: UserId, notifier: Arc<dyn BackendNotifier>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let worker = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let Err(e) = deliver(notifier.as_ref(), &user_id, notification).await {
                    warn!(user_id = %user_id, error = %e, "backend callback failed");
                }
            }
        });
        (Self { tx }, worker)
    }

    pub(crate) fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("notification worker stopped, dropping callback");
        }
    }
}

async fn deliver(
    notifier: &dyn BackendNotifier,
    user_id: &UserId,
    notification: Notification,
) -> Result<(), NotifyError> {
    match notification {
        Notification::Pairing { qr_code } => notifier.notify_pairing(user_id, &qr_code).await,
        Notification::Status { active } => notifier.notify_status(user_id, active).await,
        Notification::Message { from, body } => notifier.notify_message(user_id, &from, &body).await,
        Notification::Flushed(done) => {
            let _ = done.send(());
            Ok(())
        }
    }
}

/// A callback captured by [`RecordingNotifier`].
#[derive(Clone, Debug, PartialEq)]
pub enum NotifyCall {
    Pairing { user_id: UserId, qr_code: String },
    Status { user_id: UserId, active: bool },
    Message { user_id: UserId, from: String, body: String },
    SyncResult { user_id: UserId, contacts: Vec<ContactSummary> },
}

/// In-memory notifier recording every call. Used by tests across the
/// workspace.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifyCall>>,
    failing: bool,
    delay: Duration,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls but report every delivery as failed.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Take `delay` to answer every call, like a slow backend. Calls are
    /// recorded when they complete.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<NotifyCall> {
        self.calls.lock().clone()
    }

    /// Poll until `predicate` holds over the recorded calls or `timeout`
    /// elapses. Returns whether it held.
    pub async fn wait_for(&self, timeout: Duration, predicate: impl Fn(&[NotifyCall]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.calls.lock()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn record(&self, call: NotifyCall, endpoint: &str) -> Result<(), NotifyError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().push(call);
        if self.failing {
            return Err(NotifyError::Transport {
                endpoint: endpoint.to_string(),
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BackendNotifier for RecordingNotifier {
    async fn notify_pairing(&self, user_id: &UserId, qr_code: &str) -> Result<(), NotifyError> {
        self.record(
            NotifyCall::Pairing {
                user_id: user_id.clone(),
                qr_code: qr_code.to_string(),
            },
            ENDPOINT_QR,
        )
        .await
    }

    async fn notify_status(&self, user_id: &UserId, active: bool) -> Result<(), NotifyError> {
        self.record(
            NotifyCall::Status {
                user_id: user_id.clone(),
                active,
            },
            ENDPOINT_STATUS,
        )
        .await
    }

    async fn notify_message(&self, user_id: &UserId, from: &str, body: &str) -> Result<(), NotifyError> {
        self.record(
            NotifyCall::Message {
                user_id: user_id.clone(),
                from: from.to_string(),
                body: body.to_string(),
            },
            ENDPOINT_MESSAGE,
        )
        .await
    }

    async fn notify_sync_result(&self, user_id: &UserId, contacts: &[ContactSummary]) -> Result<(), NotifyError> {
        self.record(
            NotifyCall::SyncResult {
                user_id: user_id.clone(),
                contacts: contacts.to_vec(),
            },
            ENDPOINT_CONTACTS,
        )
        .await
    }
}
