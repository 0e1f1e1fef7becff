use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::api::CanonicalSource;
use crate::cache::{AgentCache, RelationCache};
use crate::config::SyncConfig;
use crate::diagnostics::DiagnosticLog;
use crate::error::{SyncError, SyncResult};
use crate::event_log::EventLog;
use crate::types::*;
use crate::view::Projection;

/// Change notification emitted to every subscriber of the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    EventAppended(Event),
    EventsReplaced { count: usize },
    AgentMerged { id: String },
    AgentsReplaced { count: usize },
    RelationsReplaced { count: usize },
    Status(ConnectionStatus),
}

/// Session-wide state shared by every dashboard surface: the bounded event
/// log, the entity caches, and the push connection status.
///
/// Injected as `Arc<SyncStore>`; surfaces read snapshots and `subscribe()` to
/// be told when something changed.
pub struct SyncStore {
    events: Mutex<EventLog>,
    agents: AgentCache,
    relations: RelationCache,
    status: Mutex<ConnectionStatus>,
    diagnostics: Arc<DiagnosticLog>,
    sender: broadcast::Sender<StoreUpdate>,
}

impl SyncStore {
    pub fn new(event_capacity: usize, diagnostics: Arc<DiagnosticLog>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            events: Mutex::new(EventLog::new(event_capacity)),
            agents: AgentCache::new(),
            relations: RelationCache::new(),
            status: Mutex::new(ConnectionStatus::Connecting),
            diagnostics,
            sender,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.event_capacity,
            Arc::new(DiagnosticLog::new(config.diagnostics_capacity)),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.sender.subscribe()
    }

    fn emit(&self, update: StoreUpdate) {
        // No subscribers is fine
        let _ = self.sender.send(update);
    }

    pub fn agents(&self) -> &AgentCache {
        &self.agents
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticLog> {
        &self.diagnostics
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().snapshot()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
        self.emit(StoreUpdate::Status(status));
    }

    /// Route one push message to the cache it belongs to.
    pub fn dispatch(&self, message: PushMessage) {
        match message {
            PushMessage::EventCreated(event) => {
                self.events.lock().append(event.clone());
                self.emit(StoreUpdate::EventAppended(event));
            }
            PushMessage::AgentUpdate(patch) => {
                if self.agents.merge(&patch) {
                    self.emit(StoreUpdate::AgentMerged { id: patch.id });
                }
            }
            PushMessage::RelationChanged(relations) => {
                let count = relations.len();
                self.relations.replace(relations);
                self.emit(StoreUpdate::RelationsReplaced { count });
            }
            PushMessage::Unknown { kind } => {
                debug!(kind = %kind, "Ignoring unrecognized push message");
            }
        }
    }

    /// Replace the event log with the canonical history. On failure the log
    /// keeps its contents.
    pub async fn reconcile_events(&self, source: &dyn CanonicalSource) -> SyncResult<usize> {
        let events = source.list_events().await?;
        let count = {
            let mut log = self.events.lock();
            log.replace_all(events);
            log.len()
        };
        self.emit(StoreUpdate::EventsReplaced { count });
        Ok(count)
    }

    pub async fn refresh_agents(&self, source: &dyn CanonicalSource) -> SyncResult<usize> {
        let agents = source.list_agents().await?;
        let count = agents.len();
        self.agents.replace_all(agents);
        self.emit(StoreUpdate::AgentsReplaced { count });
        Ok(count)
    }

    pub async fn refresh_relations(&self, source: &dyn CanonicalSource) -> SyncResult<usize> {
        let relations = source.list_relations().await?;
        let count = relations.len();
        self.relations.replace(relations);
        self.emit(StoreUpdate::RelationsReplaced { count });
        Ok(count)
    }

    /// Explicit full refetch of agents, relations, and events. Each part that
    /// fails keeps its previous contents; the first error is returned.
    pub async fn refetch_all(&self, source: &dyn CanonicalSource) -> SyncResult<()> {
        let results = [
            self.refresh_agents(source).await.err(),
            self.refresh_relations(source).await.err(),
            self.reconcile_events(source).await.err(),
        ];
        let mut first: Option<SyncError> = None;
        for err in results.into_iter().flatten() {
            debug!(error = %err, "Refetch part failed");
            first.get_or_insert(err);
        }
        match first {
            None => {
                info!(
                    agents = self.agents.len(),
                    relations = self.relations.len(),
                    events = self.event_count(),
                    "Full refetch complete"
                );
                Ok(())
            }
            Some(err) => Err(err),
        }
    }

    /// Global feed: the most recent `limit` events in log order.
    pub fn feed_projection(&self, limit: usize) -> Projection {
        let log = self.events.lock();
        let shown = log.tail(limit);
        let total = log.len();
        Projection {
            displayed_count: shown.len(),
            total,
            has_more: shown.len() < total,
            events: shown,
            loading: false,
        }
    }
}
