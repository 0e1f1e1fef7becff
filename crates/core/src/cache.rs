use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::types::*;

struct CachedAgent {
    position: u64,
    agent: Agent,
}

/// Latest known snapshot per agent id, mutated by partial merges.
///
/// Also tracks the agent currently open in a detail view; merges land on
/// both so the detail surface stays live.
pub struct AgentCache {
    agents: DashMap<String, CachedAgent>,
    next_position: AtomicU64,
    selected: Mutex<Option<Agent>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            next_position: AtomicU64::new(0),
            selected: Mutex::new(None),
        }
    }

    /// Swap in a freshly fetched agent list.
    pub fn replace_all(&self, agents: Vec<Agent>) {
        self.agents.clear();
        for agent in agents {
            self.insert(agent);
        }
    }

    /// Insert or overwrite one snapshot (e.g. after create or get-by-id).
    pub fn insert(&self, agent: Agent) {
        if let Some(mut existing) = self.agents.get_mut(&agent.id) {
            existing.agent = agent;
            return;
        }
        let position = self.next_position.fetch_add(1, Ordering::Relaxed);
        self.agents
            .insert(agent.id.clone(), CachedAgent { position, agent });
    }

    /// Apply a partial update. Unknown ids are ignored; returns whether a
    /// cached agent was updated.
    pub fn merge(&self, patch: &AgentPatch) -> bool {
        {
            let mut selected = self.selected.lock();
            if let Some(agent) = selected.as_mut().filter(|a| a.id == patch.id) {
                patch.apply(agent);
            }
        }

        match self.agents.get_mut(&patch.id) {
            Some(mut entry) => {
                patch.apply(&mut entry.agent);
                true
            }
            None => {
                debug!(agent_id = %patch.id, "Ignoring update for unknown agent");
                false
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.get(id).map(|e| e.agent.clone())
    }

    /// All agents in the order they were first seen.
    pub fn list(&self) -> Vec<Agent> {
        let mut entries: Vec<(u64, Agent)> = self
            .agents
            .iter()
            .map(|e| (e.position, e.agent.clone()))
            .collect();
        entries.sort_by_key(|(position, _)| *position);
        entries.into_iter().map(|(_, agent)| agent).collect()
    }

    pub fn remove(&self, id: &str) -> Option<Agent> {
        let mut selected = self.selected.lock();
        if selected.as_ref().is_some_and(|a| a.id == id) {
            *selected = None;
        }
        self.agents.remove(id).map(|(_, e)| e.agent)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn select(&self, agent: Option<Agent>) {
        *self.selected.lock() = agent;
    }

    pub fn selected(&self) -> Option<Agent> {
        self.selected.lock().clone()
    }
}

impl Default for AgentCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Current relation set. Updates are broadcast as a fully recomputed set,
/// so the cache is only ever replaced wholesale.
///
/// Duplicate (source, target) pairs are kept as received.
#[derive(Default)]
pub struct RelationCache {
    relations: RwLock<Vec<Relation>>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, relations: Vec<Relation>) {
        *self.relations.write() = relations;
    }

    pub fn snapshot(&self) -> Vec<Relation> {
        self.relations.read().clone()
    }

    pub fn len(&self) -> usize {
        self.relations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.read().is_empty()
    }
}
