use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::UserId;
use relay_engine::mock::{MockConnector, MockFactory};

use crate::cleanup::{CleanupPolicy, CleanupWorker, FsSessionStore, SessionStore};
use crate::notifier::RecordingNotifier;
use crate::pairing::QrSvgRenderer;
use crate::registry::SessionRegistry;

/// Filesystem store that counts `remove_dir` calls per path.
#[derive(Default)]
pub(crate) struct CountingStore {
    inner: FsSessionStore,
    removals: Mutex<HashMap<PathBuf, usize>>,
}

impl CountingStore {
    pub fn removals(&self, path: &Path) -> usize {
        self.removals.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_removals(&self) -> usize {
        self.removals.lock().values().sum()
    }
}

#[async_trait]
impl SessionStore for CountingStore {
    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        *self.removals.lock().entry(path.to_path_buf()).or_default() += 1;
        self.inner.remove_dir(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }
}

/// Registry wired to mocks and a temporary session root.
pub(crate) struct Harness {
    pub root: tempfile::TempDir,
    pub factory: Arc<MockFactory>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<CountingStore>,
    pub registry: Arc<SessionRegistry>,
}

impl Harness {
    pub const WAIT: Duration = Duration::from_secs(2);

    pub fn new() -> Self {
        Self::build(MockFactory::default(), RecordingNotifier::new())
    }

    pub fn with_template(template: impl Fn(&UserId) -> MockConnector + Send + Sync + 'static) -> Self {
        Self::build(MockFactory::new(template), RecordingNotifier::new())
    }

    pub fn failing_backend(template: impl Fn(&UserId) -> MockConnector + Send + Sync + 'static) -> Self {
        Self::build(MockFactory::new(template), RecordingNotifier::failing())
    }

    pub fn slow_backend(
        delay: Duration,
        template: impl Fn(&UserId) -> MockConnector + Send + Sync + 'static,
    ) -> Self {
        Self::build(MockFactory::new(template), RecordingNotifier::delayed(delay))
    }

    fn build(factory: MockFactory, notifier: RecordingNotifier) -> Self {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(factory);
        let notifier = Arc::new(notifier);
        let store = Arc::new(CountingStore::default());
        let cleanup = CleanupWorker::new(
            root.path(),
            store.clone(),
            CleanupPolicy {
                max_retries: 2,
                delay: Duration::from_millis(10),
            },
        );
        let registry = Arc::new(SessionRegistry::new(
            factory.clone(),
            notifier.clone(),
            Arc::new(QrSvgRenderer::default()),
            cleanup,
        ));
        Self {
            root,
            factory,
            notifier,
            store,
            registry,
        }
    }

    pub async fn wait_initialized(&self, mock: &MockConnector) -> bool {
        self.poll(|| mock.initialize_calls() > 0).await
    }

    pub async fn wait_cleaned(&self, user_id: &UserId) -> bool {
        self.poll(|| !self.registry.cleanup().is_pending(user_id)).await
    }

    pub async fn poll(&self, done: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Self::WAIT;
        while !done() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}
