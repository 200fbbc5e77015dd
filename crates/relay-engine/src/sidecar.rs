use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use reqwest::Url;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use relay_core::{Chat, ChatMessage, Connector, ConnectorEvent, ConnectorFactory, EngineError, UserId};

/// Builds [`SidecarConnector`]s sharing one HTTP client.
pub struct SidecarFactory {
    client: reqwest::Client,
    base_url: Url,
}

impl SidecarFactory {
    /// Fails on a malformed base URL or if the HTTP client cannot be built
    /// with the requested timeout.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, EngineError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| EngineError::Protocol(format!("invalid engine url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(EngineError::Protocol(format!("engine url cannot be a base: {base_url}")));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("relay/0.1")
            .build()
            .map_err(|e| EngineError::Request(format!("failed to build engine client: {e}")))?;
        Ok(Self { client, base_url })
    }
}

impl ConnectorFactory for SidecarFactory {
    fn create(&self, user_id: &UserId, session_dir: &Path) -> Arc<dyn Connector> {
        Arc::new(SidecarConnector::new(
            self.client.clone(),
            self.base_url.clone(),
            user_id.clone(),
            session_dir.to_path_buf(),
        ))
    }
}

/// Connector backed by an engine sidecar process.
///
/// The sidecar owns the browser-level client and its on-disk auth state under
/// `data_path`; this side only starts, observes and destroys it.
pub struct SidecarConnector {
    client: reqwest::Client,
    base_url: Url,
    user_id: UserId,
    client_id: String,
    data_path: PathBuf,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SidecarConnector {
    pub fn new(client: reqwest::Client, base_url: Url, user_id: UserId, data_path: PathBuf) -> Self {
        let client_id = format!("user-{user_id}");
        Self {
            client,
            base_url,
            user_id,
            client_id,
            data_path,
            pump: Mutex::new(None),
        }
    }

    /// `base_url` with `segments` appended, each percent-encoded as a
    /// single path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, EngineError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| EngineError::Protocol(format!("engine url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl Connector for SidecarConnector {
    async fn initialize(&self, events: mpsc::Sender<ConnectorEvent>) -> Result<(), EngineError> {
        let body = serde_json::json!({
            "client_id": &self.client_id,
            "data_path": self.data_path.to_string_lossy(),
        });
        let resp = self
            .client
            .post(self.endpoint(&["clients"])?)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        check_status(resp).await?;

        let url = events_url(self.endpoint(&["clients", self.client_id.as_str(), "events"])?)?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| EngineError::Unavailable(format!("event stream: {e}")))?;

        debug!(user_id = %self.user_id, "engine event stream connected");

        let user_id = self.user_id.clone();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<ConnectorEvent>(text.as_str()) {
                            Ok(event) => {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(user_id = %user_id, error = %e, "unrecognized engine event");
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "engine event stream failed");
                        break;
                    }
                }
            }
            debug!(user_id = %user_id, "engine event stream ended");
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        let resp = self
            .client
            .delete(self.endpoint(&["clients", self.client_id.as_str()])?)
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;

        // Already gone on the engine side.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp).await.map(|_| ())
    }

    async fn chats(&self) -> Result<Vec<Chat>, EngineError> {
        let resp = self
            .client
            .get(self.endpoint(&["clients", self.client_id.as_str(), "chats"])?)
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;
        check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>, EngineError> {
        let resp = self
            .client
            .get(self.endpoint(&["clients", self.client_id.as_str(), "chats", chat_id, "messages"])?)
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;
        check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))
    }
}

impl Drop for SidecarConnector {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(EngineError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Switch an HTTP endpoint to the matching WebSocket scheme.
fn events_url(mut url: Url) -> Result<Url, EngineError> {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(EngineError::Protocol(format!("unsupported engine url scheme: {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| EngineError::Protocol(format!("cannot switch {url} to {scheme}")))?;
    Ok(url)
}
