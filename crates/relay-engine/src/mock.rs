use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use relay_core::{Chat, ChatMessage, Connector, ConnectorEvent, ConnectorFactory, EngineError, UserId};

/// Scripted connector for deterministic tests without an engine.
///
/// `initialize` replays the scripted events and then keeps the stream open so
/// tests can push more with [`MockConnector::emit`].
pub struct MockConnector {
    script: Vec<ConnectorEvent>,
    init_error: Option<EngineError>,
    destroy_error: Option<EngineError>,
    chats: Result<Vec<Chat>, EngineError>,
    messages: HashMap<String, Result<Vec<ChatMessage>, EngineError>>,
    sender: Mutex<Option<mpsc::Sender<ConnectorEvent>>>,
    initialize_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    message_fetches: AtomicUsize,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            init_error: None,
            destroy_error: None,
            chats: Ok(Vec::new()),
            messages: HashMap::new(),
            sender: Mutex::new(None),
            initialize_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            message_fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_events(mut self, events: Vec<ConnectorEvent>) -> Self {
        self.script = events;
        self
    }

    pub fn with_init_error(mut self, error: EngineError) -> Self {
        self.init_error = Some(error);
        self
    }

    pub fn with_destroy_error(mut self, error: EngineError) -> Self {
        self.destroy_error = Some(error);
        self
    }

    pub fn with_chats(mut self, chats: Vec<Chat>) -> Self {
        self.chats = Ok(chats);
        self
    }

    pub fn with_chats_error(mut self, error: EngineError) -> Self {
        self.chats = Err(error);
        self
    }

    pub fn with_messages(mut self, chat_id: &str, messages: Vec<ChatMessage>) -> Self {
        self.messages.insert(chat_id.to_string(), Ok(messages));
        self
    }

    pub fn with_messages_error(mut self, chat_id: &str, error: EngineError) -> Self {
        self.messages.insert(chat_id.to_string(), Err(error));
        self
    }

    /// Push an event as if the engine emitted it. Returns false once the
    /// stream is closed or the consumer is gone.
    pub async fn emit(&self, event: ConnectorEvent) -> bool {
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// End the event stream without a terminal event.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::Relaxed)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::Relaxed)
    }

    pub fn message_fetches(&self) -> usize {
        self.message_fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn initialize(&self, events: mpsc::Sender<ConnectorEvent>) -> Result<(), EngineError> {
        self.initialize_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = &self.init_error {
            return Err(err.clone());
        }
        for event in &self.script {
            if events.send(event.clone()).await.is_err() {
                return Ok(());
            }
        }
        *self.sender.lock() = Some(events);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        self.destroy_calls.fetch_add(1, Ordering::Relaxed);
        self.sender.lock().take();
        match &self.destroy_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn chats(&self) -> Result<Vec<Chat>, EngineError> {
        self.chats.clone()
    }

    async fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<ChatMessage>, EngineError> {
        self.message_fetches.fetch_add(1, Ordering::Relaxed);
        match self.messages.get(chat_id) {
            Some(Ok(messages)) => Ok(messages.iter().take(limit).cloned().collect()),
            Some(Err(err)) => Err(err.clone()),
            None => Ok(Vec::new()),
        }
    }
}

type Template = Box<dyn Fn(&UserId) -> MockConnector + Send + Sync>;

/// Factory producing [`MockConnector`]s from a template and remembering them.
pub struct MockFactory {
    template: Template,
    created: Mutex<Vec<(UserId, PathBuf, Arc<MockConnector>)>>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new(|_| MockConnector::new())
    }
}

impl MockFactory {
    pub fn new(template: impl Fn(&UserId) -> MockConnector + Send + Sync + 'static) -> Self {
        Self {
            template: Box::new(template),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn created_for(&self, user_id: &UserId) -> usize {
        self.created.lock().iter().filter(|(u, _, _)| u == user_id).count()
    }

    /// Most recently created connector for a user.
    pub fn connector(&self, user_id: &UserId) -> Option<Arc<MockConnector>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(u, _, _)| u == user_id)
            .map(|(_, _, c)| Arc::clone(c))
    }

    pub fn session_dir(&self, user_id: &UserId) -> Option<PathBuf> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(u, _, _)| u == user_id)
            .map(|(_, dir, _)| dir.clone())
    }
}

impl ConnectorFactory for MockFactory {
    fn create(&self, user_id: &UserId, session_dir: &Path) -> Arc<dyn Connector> {
        let connector = Arc::new((self.template)(user_id));
        self.created
            .lock()
            .push((user_id.clone(), session_dir.to_path_buf(), Arc::clone(&connector)));
        connector
    }
}
