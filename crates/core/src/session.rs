use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, CanonicalSource};
use crate::config::SyncConfig;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::diagnostics::DiagnosticSink;
use crate::error::{SyncError, SyncResult};
use crate::poller::{PollerHandle, poll_feed, poll_view};
use crate::store::{StoreUpdate, SyncStore};
use crate::types::{ConnectionStatus, PushMessage};
use crate::view::{ConversationView, Projection, PushOutcome, ViewScope};

/// One dashboard session: the push connection feeding the shared store, a
/// conversation view kept live by push and reconciled by polling, and an
/// optional feed poller for the global event log.
pub struct Session {
    config: SyncConfig,
    store: Arc<SyncStore>,
    source: Arc<dyn CanonicalSource>,
    view: Arc<Mutex<ConversationView>>,
    connection: Option<ConnectionHandle>,
    forwarder: Option<JoinHandle<()>>,
    view_poller: Option<PollerHandle>,
    feed_poller: Option<PollerHandle>,
}

impl Session {
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(SyncStore::from_config(&config));
        let sink: Arc<dyn DiagnosticSink> = store.diagnostics().clone();
        let client = Arc::new(ApiClient::from_config(&config, sink));
        Self::with_source(config, store, client)
    }

    pub fn with_source(
        config: SyncConfig,
        store: Arc<SyncStore>,
        source: Arc<dyn CanonicalSource>,
    ) -> Self {
        let view = Arc::new(Mutex::new(ConversationView::new(config.page_size)));
        Self {
            config,
            store,
            source,
            view,
            connection: None,
            forwarder: None,
            view_poller: None,
            feed_poller: None,
        }
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    pub fn view(&self) -> &Arc<Mutex<ConversationView>> {
        &self.view
    }

    pub fn projection(&self) -> Projection {
        self.view.lock().project()
    }

    /// Open the push connection and start routing pushed events into the
    /// active view. Calling it again while connected does nothing.
    pub fn connect(&mut self) {
        if self.connection.is_some() {
            return;
        }

        let url = self.config.stream_endpoint();
        info!(url = %url, "Connecting session");
        self.store.set_status(ConnectionStatus::Connecting);

        let sink: Arc<dyn DiagnosticSink> = self.store.diagnostics().clone();
        let manager = ConnectionManager::new(url, self.config.reconnect_delay, sink);

        let on_message = {
            let store = self.store.clone();
            move |message: PushMessage| store.dispatch(message)
        };
        let on_status = {
            let store = self.store.clone();
            move |status: ConnectionStatus| store.set_status(status)
        };
        // Subscribe before any push can arrive
        let updates = self.store.subscribe();
        self.forwarder = Some(tokio::spawn(forward_to_view(updates, self.view.clone())));
        self.connection = Some(manager.open(on_message, on_status));
    }

    /// Switch the view to `scope`, discarding the previous view and its
    /// poller. The new poller fetches immediately.
    pub fn select_conversation(&mut self, scope: ViewScope) {
        if let Some(mut poller) = self.view_poller.take() {
            poller.stop();
        }
        self.view.lock().select_view(scope);
        self.view_poller = Some(poll_view(
            self.view.clone(),
            self.source.clone(),
            self.config.poll_interval,
        ));
    }

    /// Look up a conversation's participants and select it.
    pub async fn select_conversation_by_id(&mut self, conversation_id: &str) -> SyncResult<()> {
        let conversations = self.source.list_conversations().await?;
        let chat = conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| {
                SyncError::fetch("/api/group-chats", format!("unknown conversation {conversation_id}"))
            })?;
        info!(conversation = %chat.id, participants = chat.agent_ids.len(), "Selecting conversation");
        self.select_conversation(ViewScope::from(chat));
        Ok(())
    }

    pub fn unselect(&mut self) {
        if let Some(mut poller) = self.view_poller.take() {
            poller.stop();
        }
        self.view.lock().unselect();
    }

    /// Load one more page of older history into the view.
    pub fn load_more(&self) -> usize {
        self.view.lock().load_more()
    }

    /// Periodically reconcile the global event log.
    pub fn start_feed_poll(&mut self) {
        if self.feed_poller.is_none() {
            self.feed_poller = Some(poll_feed(
                self.store.clone(),
                self.source.clone(),
                self.config.poll_interval,
            ));
        }
    }

    pub async fn refetch_all(&self) -> SyncResult<()> {
        self.store.refetch_all(self.source.as_ref()).await
    }

    /// Stop pollers and close the push connection.
    pub fn shutdown(&mut self) {
        if let Some(mut poller) = self.view_poller.take() {
            poller.stop();
        }
        if let Some(mut poller) = self.feed_poller.take() {
            poller.stop();
        }
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            self.store.set_status(ConnectionStatus::Disconnected);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        debug!("Session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn forward_to_view(
    mut updates: broadcast::Receiver<StoreUpdate>,
    view: Arc<Mutex<ConversationView>>,
) {
    loop {
        match updates.recv().await {
            Ok(StoreUpdate::EventAppended(event)) => {
                if let PushOutcome::Merged { auto_scroll } = view.lock().on_push(&event) {
                    debug!(event_id = %event.id, auto_scroll, "Pushed event merged into view");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // The next poll reconciles what was skipped
                warn!(skipped = n, "View forwarder lagged behind store updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticLog;
    use crate::types::*;
    use async_trait::async_trait;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    struct StaticSource {
        events: Vec<Event>,
        conversations: Vec<Conversation>,
    }

    #[async_trait]
    impl CanonicalSource for StaticSource {
        async fn list_events(&self) -> SyncResult<Vec<Event>> {
            Ok(self.events.clone())
        }
        async fn list_agents(&self) -> SyncResult<Vec<Agent>> {
            Ok(vec![])
        }
        async fn list_relations(&self) -> SyncResult<Vec<Relation>> {
            Ok(vec![])
        }
        async fn list_conversations(&self) -> SyncResult<Vec<Conversation>> {
            Ok(self.conversations.clone())
        }
    }

    fn event(id: &str, actor: &str, ts: &str) -> Event {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "actor_id": actor,
            "timestamp": ts,
        }))
        .unwrap()
    }

    fn session(stream_url: Option<String>) -> Session {
        let config = SyncConfig {
            stream_url,
            reconnect_delay: Duration::from_millis(50),
            poll_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let store = Arc::new(SyncStore::new(200, Arc::new(DiagnosticLog::default())));
        let source = Arc::new(StaticSource {
            events: vec![
                event("e1", "a1", "2025-01-01T00:00:01Z"),
                event("e2", "zz", "2025-01-01T00:00:02Z"),
            ],
            conversations: vec![Conversation {
                id: "c1".into(),
                name: "Plaza".into(),
                description: None,
                agent_ids: vec!["a1".into()],
                is_active: true,
            }],
        });
        Session::with_source(config, store, source)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_select_by_id_loads_matching_history() {
        let mut session = session(None);
        session.select_conversation_by_id("c1").await.unwrap();
        settle().await;

        let projection = session.projection();
        assert!(!projection.loading);
        assert_eq!(projection.total, 1);
        assert_eq!(projection.events[0].id, "e1");
    }

    #[tokio::test]
    async fn test_select_unknown_conversation_fails() {
        let mut session = session(None);
        let err = session.select_conversation_by_id("nope").await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(session.view().lock().scope().is_none());
    }

    #[tokio::test]
    async fn test_pushed_event_reaches_store_and_view() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push_tx, mut push_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(text) = push_rx.recv().await {
                ws.send(Message::Text(text.into())).await.unwrap();
            }
        });

        let mut session = session(Some(format!("ws://{}", addr)));
        session.select_conversation(ViewScope::conversation("c1", ["a1"]));
        session.connect();
        settle().await;
        assert_eq!(session.store().status(), ConnectionStatus::Connected);
        assert_eq!(session.projection().total, 1);

        push_tx
            .send(r#"{"type":"event_created","data":{"id":"e3","actor_id":"a1","timestamp":"2025-01-01T00:00:03Z"}}"#.into())
            .unwrap();
        push_tx
            .send(r#"{"type":"event_created","data":{"id":"e4","actor_id":"zz","timestamp":"2025-01-01T00:00:04Z"}}"#.into())
            .unwrap();
        settle().await;

        assert_eq!(session.store().event_count(), 2);
        let ids: Vec<String> = session.projection().events.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["e1", "e3"]);

        session.shutdown();
        assert_eq!(session.store().status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_refetch_and_feed() {
        let mut session = session(None);
        session.refetch_all().await.unwrap();
        assert_eq!(session.store().event_count(), 2);

        session.start_feed_poll();
        settle().await;
        let feed = session.store().feed_projection(1);
        assert_eq!(feed.events[0].id, "e2");
        assert!(feed.has_more);
    }
}
