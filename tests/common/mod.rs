//! Shared test harness: a full engine over the in-memory store with fake
//! socket connections driven through channels.

use std::sync::Arc;

use tokio::sync::mpsc;

use wirechat::backend::blob::MemoryBlobStore;
use wirechat::backend::engine::{ChatEngine, EngineConfig};
use wirechat::backend::notify::{Notifier, NullNotifier};
use wirechat::backend::registry::ConnectionId;
use wirechat::backend::storage::MemoryStore;
use wirechat::shared::{ClientEvent, ServerEvent};

pub struct TestServer {
    pub engine: Arc<ChatEngine>,
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
}

pub struct Client {
    pub user_id: i64,
    pub conn: ConnectionId,
    pub rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_notifier(Arc::new(NullNotifier))
    }

    /// Same harness, but with a caller-supplied push sink.
    #[allow(dead_code)]
    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        let config = EngineConfig::default();
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = Arc::new(ChatEngine::new(store.clone(), blobs.clone(), notifier, config));
        Self { engine, store, blobs }
    }

    /// Open a fake connection for a seeded user.
    pub async fn connect(&self, user_id: i64) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = self
            .engine
            .handle_connect(user_id, tx)
            .await
            .expect("connect should succeed for seeded user");
        Client { user_id, conn, rx }
    }

    pub async fn send(&self, client: &Client, event: ClientEvent) {
        self.engine.handle_event(client.conn, event).await;
    }

    pub async fn disconnect(&self, client: &Client) {
        self.engine.handle_disconnect(client.conn).await;
    }
}

impl Client {
    /// Pop the next queued event, panicking when none is pending.
    pub fn next_event(&mut self) -> ServerEvent {
        self.rx.try_recv().expect("expected a pending event")
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// True when nothing is queued.
    pub fn is_quiet(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}
