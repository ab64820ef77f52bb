//! Authoritative plugin lifecycle state machine.
//!
//! The single writer of truth. It owns the store handle and the broadcaster and
//! is constructed once in `main`; every state change in the daemon goes
//! through [`PluginStateMachine::transition`].

use chrono::Utc;
use plugin_sync_protocol::{EntitySnapshot, ErrorContext, PluginState};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::collaborators::{GroundTruth, RegistrySnapshot};
use crate::db::{Db, EntityRecord, LockInfo, TransitionOutcome, TransitionWrite};

pub const SOURCE_RECONCILE: &str = "reconcile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSettings {
    pub lock_ttl_secs: u64,
    pub entity_ttl_secs: u64,
}

/// Who asked for a transition and what to record alongside it.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub source: String,
    pub metadata: Map<String, Value>,
    pub error: Option<ErrorContext>,
}

impl TransitionContext {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_error(mut self, error: ErrorContext) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged(PluginState),
    Corrected {
        from: PluginState,
        to: PluginState,
    },
    /// Another operation holds the processing lock.
    SkippedLocked,
    Failed(String),
}

pub struct PluginStateMachine {
    db: Db,
    broadcaster: Arc<Broadcaster>,
    settings: MachineSettings,
}

impl PluginStateMachine {
    pub fn new(db: Db, broadcaster: Arc<Broadcaster>, settings: MachineSettings) -> Self {
        Self {
            db,
            broadcaster,
            settings,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Current record, creating the entity at `unknown` on first reference.
    pub fn get(&self, id: &str) -> Result<EntityRecord, String> {
        self.db
            .ensure_entity(id, Utc::now(), self.settings.entity_ttl_secs)
    }

    pub fn error_context(&self, id: &str) -> Result<Option<ErrorContext>, String> {
        self.db.get_error_context(id)
    }

    pub fn entity_snapshot(&self, id: &str) -> Result<EntitySnapshot, String> {
        let record = self.get(id)?;
        let error = self.error_context(id)?;
        Ok(to_snapshot(record, error))
    }

    pub fn snapshot(&self) -> Result<Vec<EntitySnapshot>, String> {
        let records = self.db.list_entities()?;
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            let error = if record.state == PluginState::Error {
                self.db.get_error_context(&record.id)?
            } else {
                None
            };
            snapshots.push(to_snapshot(record, error));
        }
        Ok(snapshots)
    }

    /// Moves `id` to `target` if the transition table allows it, or
    /// unconditionally when `force` is set. Returns the resulting state.
    ///
    /// Never fails: rejected transitions and store errors are logged and the
    /// best-known current state is returned.
    pub fn transition(
        &self,
        id: &str,
        target: PluginState,
        context: TransitionContext,
        force: bool,
    ) -> PluginState {
        let write = TransitionWrite {
            id,
            target,
            metadata: &context.metadata,
            error: context.error.as_ref(),
            source: &context.source,
            force,
            entity_ttl_secs: self.settings.entity_ttl_secs,
        };

        match self.db.apply_transition(&write, Utc::now()) {
            Ok(TransitionOutcome::Accepted { from, to }) => {
                if force {
                    tracing::warn!(
                        id,
                        from = %from,
                        to = %to,
                        source = %context.source,
                        forced = true,
                        "Forced transition applied"
                    );
                } else {
                    tracing::info!(id, from = %from, to = %to, source = %context.source, "Transition");
                }
                self.broadcaster.state_changed(id, to);
                to
            }
            Ok(TransitionOutcome::Rejected { from }) => {
                tracing::warn!(
                    id,
                    from = %from,
                    to = %target,
                    source = %context.source,
                    rejected_reason = "invalid_transition",
                    "Transition rejected"
                );
                from
            }
            Err(err) => {
                tracing::error!(id, to = %target, error = %err, "Transition failed to persist");
                self.db
                    .get_entity(id)
                    .ok()
                    .flatten()
                    .map(|record| record.state)
                    .unwrap_or(PluginState::Unknown)
            }
        }
    }

    pub fn acquire_lock(&self, id: &str) -> bool {
        self.acquire_lock_with_ttl(id, self.settings.lock_ttl_secs)
    }

    pub fn acquire_lock_with_ttl(&self, id: &str, ttl_secs: u64) -> bool {
        match self.db.try_acquire_lock(id, ttl_secs, Utc::now()) {
            Ok(acquired) => {
                tracing::debug!(id, acquired, ttl_secs, "Lock acquire");
                acquired
            }
            Err(err) => {
                tracing::warn!(id, error = %err, "Lock acquire failed");
                false
            }
        }
    }

    pub fn release_lock(&self, id: &str) {
        if let Err(err) = self.db.release_lock(id) {
            tracing::warn!(id, error = %err, "Lock release failed; it will expire by TTL");
        }
    }

    pub fn is_locked(&self, id: &str) -> Option<LockInfo> {
        match self.db.get_lock(id, Utc::now()) {
            Ok(lock) => lock,
            Err(err) => {
                tracing::warn!(id, error = %err, "Lock lookup failed");
                None
            }
        }
    }

    /// Reconciles one entity, respecting the processing lock: an entity with an
    /// in-flight operation is skipped rather than corrected underneath it.
    pub fn reconcile(&self, id: &str, registry: &RegistrySnapshot) -> ReconcileOutcome {
        if !self.acquire_lock(id) {
            tracing::debug!(id, "Reconcile skipped; entity locked");
            return ReconcileOutcome::SkippedLocked;
        }
        let outcome = self.reconcile_held(id, registry);
        self.release_lock(id);
        outcome
    }

    /// Reconciles while the caller already holds the lock for `id`.
    pub fn reconcile_held(&self, id: &str, registry: &RegistrySnapshot) -> ReconcileOutcome {
        let recorded = match self.get(id) {
            Ok(record) => record.state,
            Err(err) => return ReconcileOutcome::Failed(err),
        };
        let truth = registry.ground_truth(id);
        let Some(corrected) = corrected_state(recorded, truth) else {
            return ReconcileOutcome::Unchanged(recorded);
        };

        let context = TransitionContext::new(SOURCE_RECONCILE)
            .with_metadata("reconciled_at", crate::db::timestamp(Utc::now()));
        let to = self.transition(id, corrected, context, true);
        if to == corrected {
            ReconcileOutcome::Corrected {
                from: recorded,
                to,
            }
        } else {
            ReconcileOutcome::Failed(format!("reconcile of {} did not persist", id))
        }
    }

    pub fn reconcile_all(&self, registry: &RegistrySnapshot) -> Vec<(String, ReconcileOutcome)> {
        let records = match self.db.list_entities() {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "Reconcile pass could not list entities");
                return Vec::new();
            }
        };
        records
            .into_iter()
            .filter(|record| corrected_state(record.state, registry.ground_truth(&record.id)).is_some())
            .map(|record| {
                let outcome = self.reconcile(&record.id, registry);
                (record.id, outcome)
            })
            .collect()
    }

    pub fn prune_expired(&self) -> usize {
        match self.db.prune_expired(Utc::now()) {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "Pruned expired entities");
                }
                removed
            }
            Err(err) => {
                tracing::warn!(error = %err, "Entity prune failed");
                0
            }
        }
    }
}

/// The state ground truth implies for a recorded classification, if it
/// disagrees. Only settled classifications are corrected; in-flight and
/// upstream-derived states are left alone.
pub fn corrected_state(recorded: PluginState, truth: GroundTruth) -> Option<PluginState> {
    if !matches!(
        recorded,
        PluginState::Available | PluginState::InstalledInactive | PluginState::InstalledActive
    ) {
        return None;
    }

    let expected = match (truth.installed, truth.active) {
        (_, true) => PluginState::InstalledActive,
        (true, false) => PluginState::InstalledInactive,
        (false, false) => PluginState::Available,
    };
    (expected != recorded).then_some(expected)
}

pub fn render_view(state: PluginState, error: Option<&ErrorContext>) -> String {
    match (state, error) {
        (PluginState::Error, Some(error)) => format!("Error: {}", error.guidance.title),
        _ => state.label().to_string(),
    }
}

fn to_snapshot(record: EntityRecord, error: Option<ErrorContext>) -> EntitySnapshot {
    EntitySnapshot {
        rendered_view: render_view(record.state, error.as_ref()),
        id: record.id,
        state: record.state,
        updated_at: record.updated_at,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_sync_protocol::{allowed_targets, classify, PushEvent};

    fn machine() -> (tempfile::TempDir, PluginStateMachine) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("state.db")).expect("db");
        let machine = PluginStateMachine::new(
            db,
            Arc::new(Broadcaster::new()),
            MachineSettings {
                lock_ttl_secs: 60,
                entity_ttl_secs: 3600,
            },
        );
        (dir, machine)
    }

    fn error_context() -> ErrorContext {
        let classification = classify("connection refused", "install", 0);
        ErrorContext {
            message: classification.guidance.title.clone(),
            source: "install".to_string(),
            kind: classification.kind,
            severity: classification.severity(),
            recoverable: classification.recoverable,
            retry_count: 0,
            retry_delay_seconds: classification.retry_delay_seconds,
            last_retry_at: None,
            guidance: classification.guidance,
        }
    }

    /// Drives `id` into `state` along legal edges.
    fn drive_to(machine: &PluginStateMachine, id: &str, state: PluginState) {
        use PluginState::*;
        let path: &[PluginState] = match state {
            Unknown => &[],
            Checking => &[Checking],
            Available => &[Checking, Available],
            NotPlugin => &[Checking, NotPlugin],
            Installing => &[Checking, Available, Installing],
            InstalledInactive => &[Checking, Available, Installing, InstalledInactive],
            InstalledActive => &[
                Checking,
                Available,
                Installing,
                InstalledInactive,
                InstalledActive,
            ],
            Error => &[Checking, Error],
        };
        for step in path {
            let mut context = TransitionContext::new("test");
            if *step == Error {
                context = context.with_error(error_context());
            }
            assert_eq!(machine.transition(id, *step, context, false), *step);
        }
    }

    #[test]
    fn scenario_checking_available_then_rejected() {
        let (_dir, machine) = machine();
        let id = "acme/widget";
        assert_eq!(machine.get(id).unwrap().state, PluginState::Unknown);
        assert_eq!(
            machine.transition(id, PluginState::Checking, TransitionContext::new("test"), false),
            PluginState::Checking
        );
        assert_eq!(
            machine.transition(id, PluginState::Available, TransitionContext::new("test"), false),
            PluginState::Available
        );
        assert_eq!(
            machine.transition(id, PluginState::Checking, TransitionContext::new("test"), false),
            PluginState::Available
        );
        assert_eq!(machine.get(id).unwrap().state, PluginState::Available);
    }

    #[test]
    fn every_disallowed_transition_is_a_noop() {
        for from in PluginState::ALL {
            for target in PluginState::ALL {
                if allowed_targets(from).contains(&target) {
                    continue;
                }
                let (_dir, machine) = machine();
                drive_to(&machine, "acme/widget", from);
                let rx = machine.broadcaster().subscribe();
                let result = machine.transition(
                    "acme/widget",
                    target,
                    TransitionContext::new("test"),
                    false,
                );
                assert_eq!(result, from, "{} -> {}", from, target);
                assert_eq!(machine.get("acme/widget").unwrap().state, from);
                assert!(rx.try_recv().is_err(), "{} -> {} notified", from, target);
            }
        }
    }

    #[test]
    fn every_allowed_transition_applies_and_notifies_once() {
        for from in PluginState::ALL {
            for target in allowed_targets(from) {
                let (_dir, machine) = machine();
                drive_to(&machine, "acme/widget", from);
                let rx = machine.broadcaster().subscribe();
                let mut context = TransitionContext::new("test");
                if *target == PluginState::Error {
                    context = context.with_error(error_context());
                }
                let result = machine.transition("acme/widget", *target, context, false);
                assert_eq!(result, *target, "{} -> {}", from, target);

                let events: Vec<_> = rx.try_iter().collect();
                assert_eq!(
                    events,
                    vec![PushEvent::StateChanged {
                        repository: "acme/widget".to_string(),
                        to: *target
                    }],
                    "{} -> {}",
                    from,
                    target
                );
            }
        }
    }

    #[test]
    fn lock_twice_then_release() {
        let (_dir, machine) = machine();
        assert!(machine.acquire_lock("acme/widget"));
        assert!(!machine.acquire_lock("acme/widget"));
        assert!(machine.is_locked("acme/widget").is_some());
        machine.release_lock("acme/widget");
        assert!(machine.is_locked("acme/widget").is_none());
        assert!(machine.acquire_lock("acme/widget"));
    }

    #[test]
    fn reconcile_forces_available_to_installed_active() {
        let (_dir, machine) = machine();
        drive_to(&machine, "acme/widget", PluginState::Available);
        let registry = RegistrySnapshot {
            installed: ["acme/widget".to_string()].into_iter().collect(),
            active: ["acme/widget".to_string()].into_iter().collect(),
        };

        let outcome = machine.reconcile("acme/widget", &registry);
        assert_eq!(
            outcome,
            ReconcileOutcome::Corrected {
                from: PluginState::Available,
                to: PluginState::InstalledActive
            }
        );
        let record = machine.get("acme/widget").unwrap();
        assert_eq!(record.state, PluginState::InstalledActive);
        assert!(record.metadata.contains_key("reconciled_at"));
        assert!(machine.is_locked("acme/widget").is_none());
    }

    #[test]
    fn reconcile_respects_held_lock() {
        let (_dir, machine) = machine();
        drive_to(&machine, "acme/widget", PluginState::Available);
        let registry = RegistrySnapshot {
            installed: ["acme/widget".to_string()].into_iter().collect(),
            active: Default::default(),
        };
        assert!(machine.acquire_lock("acme/widget"));
        assert_eq!(
            machine.reconcile("acme/widget", &registry),
            ReconcileOutcome::SkippedLocked
        );
        assert_eq!(machine.get("acme/widget").unwrap().state, PluginState::Available);
    }

    #[test]
    fn reconcile_leaves_in_flight_states_alone() {
        let (_dir, machine) = machine();
        drive_to(&machine, "acme/widget", PluginState::Installing);
        let registry = RegistrySnapshot {
            installed: ["acme/widget".to_string()].into_iter().collect(),
            active: Default::default(),
        };
        assert_eq!(
            machine.reconcile("acme/widget", &registry),
            ReconcileOutcome::Unchanged(PluginState::Installing)
        );
    }

    #[test]
    fn corrected_state_table() {
        let uninstalled = GroundTruth {
            installed: false,
            active: false,
        };
        let inactive = GroundTruth {
            installed: true,
            active: false,
        };
        let active = GroundTruth {
            installed: true,
            active: true,
        };
        assert_eq!(
            corrected_state(PluginState::Available, inactive),
            Some(PluginState::InstalledInactive)
        );
        assert_eq!(
            corrected_state(PluginState::InstalledInactive, active),
            Some(PluginState::InstalledActive)
        );
        assert_eq!(
            corrected_state(PluginState::InstalledActive, uninstalled),
            Some(PluginState::Available)
        );
        assert_eq!(corrected_state(PluginState::Available, uninstalled), None);
        assert_eq!(corrected_state(PluginState::Error, active), None);
        assert_eq!(corrected_state(PluginState::NotPlugin, active), None);
    }

    #[test]
    fn snapshot_includes_error_context_and_view() {
        let (_dir, machine) = machine();
        drive_to(&machine, "acme/broken", PluginState::Error);
        drive_to(&machine, "acme/widget", PluginState::Available);

        let snapshot = machine.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "acme/broken");
        assert_eq!(snapshot[0].rendered_view, "Error: Connection problem");
        assert!(snapshot[0].error.is_some());
        assert_eq!(snapshot[1].rendered_view, "Available");
        assert!(snapshot[1].error.is_none());
    }
}
