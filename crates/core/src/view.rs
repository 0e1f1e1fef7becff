use std::collections::HashSet;

use tracing::{debug, warn};

use crate::config::DEFAULT_PAGE_SIZE;
use crate::error::SyncError;
use crate::types::{Conversation, Event, sort_events};

/// Which slice of history a view is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewScope {
    /// Global feed: every event.
    Global,
    /// One conversation transcript.
    Conversation {
        conversation_id: String,
        participants: HashSet<String>,
    },
}

impl ViewScope {
    pub fn conversation(
        conversation_id: impl Into<String>,
        participants: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        ViewScope::Conversation {
            conversation_id: conversation_id.into(),
            participants: participants.into_iter().map(Into::into).collect(),
        }
    }

    /// An event belongs to a conversation if its actor or target is a
    /// participant, or it is a group message tagged with the conversation id.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            ViewScope::Global => true,
            ViewScope::Conversation {
                conversation_id,
                participants,
            } => {
                let involves = |id: &Option<String>| {
                    id.as_ref().is_some_and(|id| participants.contains(id))
                };
                involves(&event.actor_id)
                    || involves(&event.target_id)
                    || (event.is_group_message()
                        && event.conversation_id().as_deref() == Some(conversation_id.as_str()))
            }
        }
    }

    /// Filter the canonical history down to this scope, sorted ascending.
    pub fn select(&self, events: &[Event]) -> Vec<Event> {
        let mut matching: Vec<Event> = events.iter().filter(|e| self.matches(e)).cloned().collect();
        sort_events(&mut matching);
        matching
    }
}

impl From<&Conversation> for ViewScope {
    fn from(chat: &Conversation) -> Self {
        ViewScope::conversation(chat.id.clone(), chat.agent_ids.iter().cloned())
    }
}

/// The last `count` entries of `all`, oldest first.
pub fn project_tail(all: &[Event], count: usize) -> &[Event] {
    &all[all.len().saturating_sub(count)..]
}

/// What a UI surface renders for one view.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    pub events: Vec<Event>,
    pub displayed_count: usize,
    pub total: usize,
    pub has_more: bool,
    pub loading: bool,
}

/// Identifies the selection a fetch was issued for. Responses carrying an
/// outdated ticket are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewTicket(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Unselected,
    Loading {
        scope: ViewScope,
    },
    Ready {
        scope: ViewScope,
        all_matching: Vec<Event>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// No view selected, still loading, or the event is out of scope.
    Ignored,
    /// The event joined the history. `auto_scroll` is set only when the view
    /// was sitting at the live tail.
    Merged { auto_scroll: bool },
}

/// State of one conversation (or feed) surface.
///
/// Holds the full filtered history in timestamp order and a window counted
/// from the live tail. "Load more" grows the window backwards; pushes and
/// polls change the history but never the window.
#[derive(Debug, Clone)]
pub struct ConversationView {
    state: ViewState,
    page_size: usize,
    /// Requested window; the rendered count is capped by the history length.
    window: usize,
    generation: u64,
    at_tail: bool,
}

impl ConversationView {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: ViewState::Unselected,
            page_size: page_size.max(1),
            window: page_size.max(1),
            generation: 0,
            at_tail: true,
        }
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn scope(&self) -> Option<&ViewScope> {
        match &self.state {
            ViewState::Unselected => None,
            ViewState::Loading { scope } | ViewState::Ready { scope, .. } => Some(scope),
        }
    }

    pub fn ticket(&self) -> ViewTicket {
        ViewTicket(self.generation)
    }

    pub fn is_current(&self, ticket: ViewTicket) -> bool {
        ticket.0 == self.generation && !matches!(self.state, ViewState::Unselected)
    }

    /// Switch to a new scope. Previous view state is discarded and the window
    /// resets to one page.
    pub fn select_view(&mut self, scope: ViewScope) -> ViewTicket {
        self.generation += 1;
        self.window = self.page_size;
        self.at_tail = true;
        self.state = ViewState::Loading { scope };
        self.ticket()
    }

    pub fn unselect(&mut self) {
        self.generation += 1;
        self.window = self.page_size;
        self.at_tail = true;
        self.state = ViewState::Unselected;
    }

    /// Reconcile against a canonical fetch. Used for the initial load and
    /// for every periodic poll; the window is preserved. Returns false when
    /// the ticket is stale.
    pub fn apply_fetch(&mut self, ticket: ViewTicket, canonical: &[Event]) -> bool {
        if !self.is_current(ticket) {
            debug!(ticket = ticket.0, current = self.generation, "Discarding stale view fetch");
            return false;
        }
        let scope = match &self.state {
            ViewState::Loading { scope } | ViewState::Ready { scope, .. } => scope.clone(),
            ViewState::Unselected => return false,
        };
        let all_matching = scope.select(canonical);
        self.state = ViewState::Ready {
            scope,
            all_matching,
        };
        true
    }

    /// A fetch for `ticket` failed; the last good state stays on screen.
    pub fn record_failure(&mut self, ticket: ViewTicket, error: &SyncError) {
        if self.is_current(ticket) {
            warn!(error = %error, "View refresh failed, keeping last good state");
        }
    }

    /// Merge a pushed event if it belongs to the active scope.
    pub fn on_push(&mut self, event: &Event) -> PushOutcome {
        let ViewState::Ready {
            scope,
            all_matching,
        } = &mut self.state
        else {
            return PushOutcome::Ignored;
        };
        if !scope.matches(event) {
            return PushOutcome::Ignored;
        }
        all_matching.push(event.clone());
        sort_events(all_matching);
        PushOutcome::Merged {
            auto_scroll: self.at_tail,
        }
    }

    /// Reveal one more page of older history. Never shrinks the window and
    /// never grows it past the history length.
    pub fn load_more(&mut self) -> usize {
        let total = self.total();
        if self.window < total {
            self.window = (self.window + self.page_size).min(total);
            self.at_tail = false;
        }
        self.displayed_count()
    }

    /// Reported by the surface whenever its scroll position changes.
    pub fn set_at_tail(&mut self, at_tail: bool) {
        self.at_tail = at_tail;
    }

    pub fn at_tail(&self) -> bool {
        self.at_tail
    }

    pub fn total(&self) -> usize {
        match &self.state {
            ViewState::Ready { all_matching, .. } => all_matching.len(),
            _ => 0,
        }
    }

    pub fn displayed_count(&self) -> usize {
        self.window.min(self.total())
    }

    pub fn all_matching(&self) -> &[Event] {
        match &self.state {
            ViewState::Ready { all_matching, .. } => all_matching,
            _ => &[],
        }
    }

    pub fn project(&self) -> Projection {
        let displayed = self.displayed_count();
        Projection {
            events: project_tail(self.all_matching(), displayed).to_vec(),
            displayed_count: displayed,
            total: self.total(),
            has_more: displayed < self.total(),
            loading: matches!(self.state, ViewState::Loading { .. }),
        }
    }
}

impl Default for ConversationView {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}
