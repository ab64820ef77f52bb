//! Client-side mirror of authoritative plugin state.
//!
//! The mirror is a cache, never a source of truth. It is fed by the initial
//! snapshot, push records, and action outcomes, all through [`StateMirror::set`].
//! Display filtering lives alongside it but never writes state.

use chrono::{DateTime, Utc};
use plugin_sync_protocol::{
    ActionFailure, EntitySnapshot, ErrorContext, PluginState, PushEvent, Severity,
};
use std::collections::{BTreeSet, HashMap};

/// Source tag recorded on error contexts built from action responses.
pub const SOURCE_RESPONSE: &str = "response";

/// Reads the last-known state from the view layer when the cache is cold.
/// The mirror only ever reads from it.
pub trait HydrationSource {
    fn last_known_state(&self, id: &str) -> Option<PluginState>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub id: String,
    pub from: Option<PluginState>,
    pub to: PluginState,
}

/// Display-only filter. Never feeds back into entity state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFilterState {
    pub search_term: String,
    pub matched_ids: BTreeSet<String>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&StateChange)>;

#[derive(Default)]
pub struct StateMirror {
    states: HashMap<String, PluginState>,
    errors: HashMap<String, ErrorContext>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    hydration: Option<Box<dyn HydrationSource>>,
    filter: Option<ClientFilterState>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hydration(source: impl HydrationSource + 'static) -> Self {
        Self {
            hydration: Some(Box::new(source)),
            ..Self::default()
        }
    }

    /// Cached state, falling back to hydration. A hydrated value is cached
    /// without notifying listeners.
    pub fn get(&mut self, id: &str) -> Option<PluginState> {
        if let Some(state) = self.states.get(id) {
            return Some(*state);
        }
        let hydrated = self.hydration.as_ref()?.last_known_state(id)?;
        tracing::debug!(id, state = %hydrated, "Hydrated mirror entry");
        self.states.insert(id.to_string(), hydrated);
        Some(hydrated)
    }

    /// Overwrites the cached state and notifies every listener. Leaving
    /// `error` drops the mirrored error context for `id`.
    pub fn set(&mut self, id: &str, state: PluginState) {
        let from = self.states.insert(id.to_string(), state);
        if state != PluginState::Error {
            self.errors.remove(id);
        }
        let change = StateChange {
            id: id.to_string(),
            from,
            to: state,
        };
        for (_, listener) in self.listeners.iter_mut() {
            listener(&change);
        }
    }

    pub fn on_change(&mut self, listener: impl FnMut(&StateChange) + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn error(&self, id: &str) -> Option<&ErrorContext> {
        self.errors.get(id)
    }

    /// Records `context` and moves the entry to `error`.
    pub fn set_error(&mut self, id: &str, context: ErrorContext) {
        self.errors.insert(id.to_string(), context);
        self.set(id, PluginState::Error);
    }

    pub fn set_error_from_response(&mut self, id: &str, failure: &ActionFailure) {
        self.set_error(id, error_context_from_failure(failure, Utc::now()));
    }

    /// Leaves `error` for `next`, dropping the mirrored context. Refuses to
    /// clear an error while staying in `error`.
    pub fn clear_error(&mut self, id: &str, next: PluginState) -> bool {
        if next == PluginState::Error {
            return false;
        }
        self.set(id, next);
        true
    }

    pub fn apply_snapshot(&mut self, entities: &[EntitySnapshot]) {
        for entity in entities {
            match &entity.error {
                Some(context) if entity.state == PluginState::Error => {
                    self.set_error(&entity.id, context.clone())
                }
                _ => self.set(&entity.id, entity.state),
            }
        }
    }

    /// Applies one push record. Hidden rows are updated like any other.
    pub fn apply_push(&mut self, event: &PushEvent) {
        match event {
            PushEvent::StateChanged { repository, to } => self.set(repository, *to),
            PushEvent::Heartbeat { .. } => {}
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Recomputes matches against the ids mirrored right now. A blank term
    /// clears the filter.
    pub fn set_filter(&mut self, term: &str) -> Option<&ClientFilterState> {
        let term = term.trim();
        if term.is_empty() {
            self.clear_filter();
            return None;
        }
        let needle = term.to_lowercase();
        let matched_ids = self
            .states
            .keys()
            .filter(|id| id.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        self.filter = Some(ClientFilterState {
            search_term: term.to_string(),
            matched_ids,
            applied_at: Utc::now(),
        });
        self.filter.as_ref()
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    pub fn filter(&self) -> Option<&ClientFilterState> {
        self.filter.as_ref()
    }

    pub fn is_visible(&self, id: &str) -> bool {
        match &self.filter {
            Some(filter) => filter.matched_ids.contains(id),
            None => true,
        }
    }
}

pub fn error_context_from_failure(failure: &ActionFailure, now: DateTime<Utc>) -> ErrorContext {
    ErrorContext {
        message: failure.message.clone(),
        source: SOURCE_RESPONSE.to_string(),
        kind: failure.kind,
        severity: if failure.recoverable {
            Severity::Warning
        } else {
            Severity::Error
        },
        recoverable: failure.recoverable,
        retry_count: failure.retry_count,
        retry_delay_seconds: failure.retry_delay_seconds,
        last_retry_at: (failure.retry_count > 0)
            .then(|| now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        guidance: failure.guidance.clone(),
    }
}
