//! Client-initiated actions: install, activate, deactivate, refresh.
//!
//! Each action holds the processing lock for its full duration, delegates to a
//! collaborator, and records the outcome through the state machine. A second
//! request for a locked entity fails fast with a `concurrency` failure.

use chrono::{Duration, Utc};
use plugin_sync_protocol::classify::SOURCE_UPSTREAM;
use plugin_sync_protocol::{
    classify, is_allowed, ActionFailure, ActionParams, ActionResult, ActionSuccess,
    Classification, ErrorContext, ErrorKind, Method, PluginState,
};
use std::sync::Arc;

use crate::collaborators::{
    CollaboratorError, HostRegistry, Installer, QuotaReport, RepositorySource,
};
use crate::db::{timestamp, QuotaSnapshot};
use crate::machine::{PluginStateMachine, ReconcileOutcome, TransitionContext};

/// Quota data older than this is treated as absent.
pub const QUOTA_MAX_AGE_SECS: i64 = 180;
/// Assumed throttle window when a rate-limit failure carries no reset time.
const RATE_LIMIT_FALLBACK_WINDOW_SECS: i64 = 60;

const SOURCE_INSTALL: &str = "install";
const SOURCE_ACTIVATE: &str = "activate";
const SOURCE_DEACTIVATE: &str = "deactivate";
const SOURCE_STORE: &str = "store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Activate,
    Deactivate,
    Refresh,
}

impl Action {
    pub fn from_method(method: Method) -> Option<Self> {
        match method {
            Method::Install => Some(Action::Install),
            Method::Activate => Some(Action::Activate),
            Method::Deactivate => Some(Action::Deactivate),
            Method::Refresh => Some(Action::Refresh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Activate => "activate",
            Action::Deactivate => "deactivate",
            Action::Refresh => "refresh",
        }
    }
}

pub struct ActionService {
    machine: Arc<PluginStateMachine>,
    source: Arc<dyn RepositorySource>,
    installer: Arc<dyn Installer>,
    registry: Arc<dyn HostRegistry>,
}

impl ActionService {
    pub fn new(
        machine: Arc<PluginStateMachine>,
        source: Arc<dyn RepositorySource>,
        installer: Arc<dyn Installer>,
        registry: Arc<dyn HostRegistry>,
    ) -> Self {
        Self {
            machine,
            source,
            installer,
            registry,
        }
    }

    pub fn machine(&self) -> &Arc<PluginStateMachine> {
        &self.machine
    }

    pub fn run(&self, action: Action, params: &ActionParams) -> ActionResult {
        let repository = params.repository.as_str();
        if !self.machine.acquire_lock(repository) {
            tracing::info!(repository, action = action.as_str(), "Action rejected; entity locked");
            return ActionResult::failure(&failure_from(
                Classification::concurrency(),
                params.retry_count,
                None,
            ));
        }

        let result = match action {
            Action::Install => self.install_held(params),
            Action::Activate => self.activate_held(params),
            Action::Deactivate => self.deactivate_held(params),
            Action::Refresh => self.refresh_held(params),
        };
        self.machine.release_lock(repository);

        match result {
            Ok(state) => {
                tracing::info!(repository, action = action.as_str(), state = %state, "Action succeeded");
                ActionResult::success(&ActionSuccess {
                    repository: repository.to_string(),
                    state,
                })
            }
            Err(failure) => {
                tracing::info!(
                    repository,
                    action = action.as_str(),
                    kind = failure.kind.as_str(),
                    recoverable = failure.recoverable,
                    "Action failed"
                );
                ActionResult::failure(&failure)
            }
        }
    }

    /// Periodic or on-demand reconciliation against the host registry.
    pub fn reconcile(&self, repository: Option<&str>) -> Result<Vec<(String, ReconcileOutcome)>, String> {
        let registry = self
            .registry
            .snapshot()
            .map_err(|err| format!("Host registry unavailable: {}", err))?;
        Ok(match repository {
            Some(id) => vec![(id.to_string(), self.machine.reconcile(id, &registry))],
            None => self.machine.reconcile_all(&registry),
        })
    }

    fn refresh_held(&self, params: &ActionParams) -> Result<PluginState, ActionFailure> {
        let repository = params.repository.as_str();
        let current = self.current_state(params)?;

        match current {
            PluginState::Available
            | PluginState::InstalledInactive
            | PluginState::InstalledActive => {
                return Ok(self.reconcile_held(repository).unwrap_or(current));
            }
            PluginState::Installing => {
                // The lock was free, so no install is actually running.
                return Err(self.fail(
                    params,
                    "Installation was interrupted before it finished",
                    SOURCE_INSTALL,
                ));
            }
            PluginState::Unknown | PluginState::NotPlugin | PluginState::Error => {
                self.machine.transition(
                    repository,
                    PluginState::Checking,
                    TransitionContext::new("refresh"),
                    false,
                );
            }
            PluginState::Checking => {}
        }

        let now = Utc::now();
        match self.machine.db().get_quota(now, QUOTA_MAX_AGE_SECS) {
            Ok(Some(quota)) if quota.is_exhausted(now) => {
                tracing::info!(repository, reset_at = %quota.reset_at, "Upstream quota exhausted; skipping check");
                return Err(self.fail(params, "API rate limit exceeded", SOURCE_UPSTREAM));
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "Quota cache unreadable"),
        }

        let outcome = match self.source.check(repository) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail_collaborator(params, &err, SOURCE_UPSTREAM)),
        };
        if let Some(report) = outcome.rate_limit {
            self.record_quota_report(report);
        }

        let target = if outcome.is_plugin {
            PluginState::Available
        } else {
            PluginState::NotPlugin
        };
        let state = self.machine.transition(
            repository,
            target,
            TransitionContext::new("refresh").with_metadata("checked_at", timestamp(Utc::now())),
            false,
        );
        if state == PluginState::Available {
            return Ok(self.reconcile_held(repository).unwrap_or(state));
        }
        Ok(state)
    }

    fn install_held(&self, params: &ActionParams) -> Result<PluginState, ActionFailure> {
        let repository = params.repository.as_str();
        let mut state = self.current_state(params)?;
        if matches!(
            state,
            PluginState::Unknown | PluginState::NotPlugin | PluginState::Error | PluginState::Checking
        ) {
            state = self.refresh_held(params)?;
        }

        match state {
            PluginState::Available => {}
            PluginState::InstalledInactive | PluginState::InstalledActive => {
                return Err(precondition_failure("Plugin is already installed", params, state))
            }
            PluginState::NotPlugin => {
                return Err(precondition_failure("Repository is not a plugin", params, state))
            }
            other => {
                return Err(precondition_failure(
                    &format!("Cannot install while {}", other.label().to_lowercase()),
                    params,
                    other,
                ))
            }
        }

        self.machine.transition(
            repository,
            PluginState::Installing,
            TransitionContext::new(SOURCE_INSTALL),
            false,
        );
        if let Err(err) = self.installer.install(repository) {
            return Err(self.fail_collaborator(params, &err, SOURCE_INSTALL));
        }

        let state = self.machine.transition(
            repository,
            PluginState::InstalledInactive,
            TransitionContext::new(SOURCE_INSTALL).with_metadata("installed_at", timestamp(Utc::now())),
            false,
        );
        Ok(self.reconcile_held(repository).unwrap_or(state))
    }

    fn activate_held(&self, params: &ActionParams) -> Result<PluginState, ActionFailure> {
        let repository = params.repository.as_str();
        self.reconcile_held(repository);
        match self.current_state(params)? {
            PluginState::InstalledInactive => {}
            PluginState::InstalledActive => return Ok(PluginState::InstalledActive),
            other => return Err(precondition_failure("Plugin is not installed", params, other)),
        }

        if let Err(err) = self.installer.activate(repository) {
            return Err(self.fail_collaborator(params, &err, SOURCE_ACTIVATE));
        }
        Ok(self.machine.transition(
            repository,
            PluginState::InstalledActive,
            TransitionContext::new(SOURCE_ACTIVATE),
            false,
        ))
    }

    fn deactivate_held(&self, params: &ActionParams) -> Result<PluginState, ActionFailure> {
        let repository = params.repository.as_str();
        self.reconcile_held(repository);
        match self.current_state(params)? {
            PluginState::InstalledActive => {}
            PluginState::InstalledInactive => return Ok(PluginState::InstalledInactive),
            other => return Err(precondition_failure("Plugin is not active", params, other)),
        }

        if let Err(err) = self.installer.deactivate(repository) {
            return Err(self.fail_collaborator(params, &err, SOURCE_DEACTIVATE));
        }
        Ok(self.machine.transition(
            repository,
            PluginState::InstalledInactive,
            TransitionContext::new(SOURCE_DEACTIVATE),
            false,
        ))
    }

    fn current_state(&self, params: &ActionParams) -> Result<PluginState, ActionFailure> {
        self.machine
            .get(&params.repository)
            .map(|record| record.state)
            .map_err(|err| {
                tracing::error!(repository = %params.repository, error = %err, "State store read failed");
                failure_from(
                    classify(&err, SOURCE_STORE, params.retry_count),
                    params.retry_count,
                    None,
                )
            })
    }

    /// Reconciles while holding the lock. Registry failures are logged and
    /// leave the recorded state in place.
    fn reconcile_held(&self, repository: &str) -> Option<PluginState> {
        let registry = match self.registry.snapshot() {
            Ok(registry) => registry,
            Err(err) => {
                tracing::warn!(repository, error = %err, "Host registry unavailable; skipping reconcile");
                return None;
            }
        };
        match self.machine.reconcile_held(repository, &registry) {
            ReconcileOutcome::Unchanged(state) => Some(state),
            ReconcileOutcome::Corrected { to, .. } => Some(to),
            ReconcileOutcome::SkippedLocked => None,
            ReconcileOutcome::Failed(err) => {
                tracing::warn!(repository, error = %err, "Reconcile failed");
                None
            }
        }
    }

    /// A missing command is a configuration problem whatever its text says,
    /// so it skips the pattern table.
    fn fail_collaborator(
        &self,
        params: &ActionParams,
        err: &CollaboratorError,
        source: &str,
    ) -> ActionFailure {
        if err.not_configured {
            let classification = Classification::for_kind(ErrorKind::Generic, params.retry_count);
            return self.record_failure(params, classification, &err.message, source);
        }
        self.fail(params, &err.message, source)
    }

    /// Classifies a raw failure once and records it.
    fn fail(&self, params: &ActionParams, raw_message: &str, source: &str) -> ActionFailure {
        let classification = classify(raw_message, source, params.retry_count);
        self.record_failure(params, classification, raw_message, source)
    }

    /// Moves the entity to `error` when the table allows it and returns the
    /// failure along with the state the entity was left in.
    fn record_failure(
        &self,
        params: &ActionParams,
        classification: Classification,
        raw_message: &str,
        source: &str,
    ) -> ActionFailure {
        let repository = params.repository.as_str();
        tracing::warn!(
            repository,
            source,
            kind = classification.kind.as_str(),
            raw = raw_message,
            "Collaborator failure classified"
        );

        if classification.kind == ErrorKind::RateLimit {
            self.record_quota_exhausted();
        }

        let now = Utc::now();
        let context = ErrorContext {
            message: classification.guidance.title.clone(),
            source: source.to_string(),
            kind: classification.kind,
            severity: classification.severity(),
            recoverable: classification.recoverable,
            retry_count: params.retry_count,
            retry_delay_seconds: classification.retry_delay_seconds,
            last_retry_at: (params.retry_count > 0).then(|| timestamp(now)),
            guidance: classification.guidance.clone(),
        };

        let current = self.machine.get(repository).map(|record| record.state).ok();
        let state = match current {
            Some(current) if is_allowed(current, PluginState::Error) => {
                Some(self.machine.transition(
                    repository,
                    PluginState::Error,
                    TransitionContext::new(source)
                        .with_metadata("error_kind", classification.kind.as_str())
                        .with_error(context),
                    false,
                ))
            }
            other => other,
        };

        failure_from(classification, params.retry_count, state)
    }

    fn record_quota_report(&self, report: QuotaReport) {
        let now = Utc::now();
        let reset_at = chrono::DateTime::from_timestamp(report.reset_at, 0)
            .unwrap_or_else(|| now + Duration::seconds(RATE_LIMIT_FALLBACK_WINDOW_SECS));
        let quota = QuotaSnapshot {
            remaining: report.remaining,
            limit: report.limit,
            reset_at,
            recorded_at: now,
        };
        if let Err(err) = self.machine.db().record_quota(&quota) {
            tracing::warn!(error = %err, "Failed to record quota report");
        }
    }

    fn record_quota_exhausted(&self) {
        let now = Utc::now();
        let quota = QuotaSnapshot {
            remaining: 0,
            limit: 0,
            reset_at: now + Duration::seconds(RATE_LIMIT_FALLBACK_WINDOW_SECS),
            recorded_at: now,
        };
        if let Err(err) = self.machine.db().record_quota(&quota) {
            tracing::warn!(error = %err, "Failed to record exhausted quota");
        }
    }
}

fn failure_from(
    classification: Classification,
    retry_count: u32,
    state: Option<PluginState>,
) -> ActionFailure {
    ActionFailure {
        message: classification.guidance.title.clone(),
        kind: classification.kind,
        recoverable: classification.recoverable,
        retry_delay_seconds: classification.retry_delay_seconds,
        guidance: classification.guidance,
        retry_count,
        state,
    }
}

/// A request that cannot apply to the entity's current state. Reported
/// without touching state, and never auto-retried.
fn precondition_failure(message: &str, params: &ActionParams, state: PluginState) -> ActionFailure {
    failure_from(
        Classification::precondition(message),
        params.retry_count,
        Some(state),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::collaborators::{CheckOutcome, RegistrySnapshot};
    use crate::db::Db;
    use crate::machine::MachineSettings;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHost {
        is_plugin: bool,
        check_error: Option<String>,
        check_unconfigured: bool,
        install_error: Option<String>,
        activate_error: Option<String>,
        registry: Mutex<RegistrySnapshot>,
        check_calls: Mutex<u32>,
    }

    impl RepositorySource for FakeHost {
        fn check(&self, _repository: &str) -> Result<CheckOutcome, CollaboratorError> {
            *self.check_calls.lock().unwrap() += 1;
            if self.check_unconfigured {
                return Err(CollaboratorError::not_configured("check"));
            }
            match &self.check_error {
                Some(message) => Err(CollaboratorError::new(message.clone())),
                None => Ok(CheckOutcome {
                    is_plugin: self.is_plugin,
                    rate_limit: None,
                }),
            }
        }
    }

    impl Installer for FakeHost {
        fn install(&self, repository: &str) -> Result<(), CollaboratorError> {
            if let Some(message) = &self.install_error {
                return Err(CollaboratorError::new(message.clone()));
            }
            self.registry
                .lock()
                .unwrap()
                .installed
                .insert(repository.to_string());
            Ok(())
        }

        fn activate(&self, repository: &str) -> Result<(), CollaboratorError> {
            if let Some(message) = &self.activate_error {
                return Err(CollaboratorError::new(message.clone()));
            }
            self.registry
                .lock()
                .unwrap()
                .active
                .insert(repository.to_string());
            Ok(())
        }

        fn deactivate(&self, repository: &str) -> Result<(), CollaboratorError> {
            self.registry.lock().unwrap().active.remove(repository);
            Ok(())
        }
    }

    impl HostRegistry for FakeHost {
        fn snapshot(&self) -> Result<RegistrySnapshot, CollaboratorError> {
            Ok(self.registry.lock().unwrap().clone())
        }
    }

    fn service(host: FakeHost) -> (tempfile::TempDir, Arc<FakeHost>, ActionService) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("state.db")).expect("db");
        let machine = Arc::new(PluginStateMachine::new(
            db,
            Arc::new(Broadcaster::new()),
            MachineSettings {
                lock_ttl_secs: 60,
                entity_ttl_secs: 3600,
            },
        ));
        let host = Arc::new(host);
        let service = ActionService::new(machine, host.clone(), host.clone(), host.clone());
        (dir, host, service)
    }

    fn params(repository: &str) -> ActionParams {
        ActionParams {
            repository: repository.to_string(),
            retry_count: 0,
        }
    }

    fn expect_success(result: ActionResult) -> ActionSuccess {
        match result.into_outcome().unwrap() {
            Ok(success) => success,
            Err(failure) => panic!("expected success, got {:?}", failure),
        }
    }

    fn expect_failure(result: ActionResult) -> ActionFailure {
        match result.into_outcome().unwrap() {
            Ok(success) => panic!("expected failure, got {:?}", success),
            Err(failure) => failure,
        }
    }

    #[test]
    fn refresh_classifies_plugin() {
        let (_dir, _host, service) = service(FakeHost {
            is_plugin: true,
            ..FakeHost::default()
        });
        let success = expect_success(service.run(Action::Refresh, &params("acme/widget")));
        assert_eq!(success.state, PluginState::Available);
    }

    #[test]
    fn refresh_marks_non_plugins() {
        let (_dir, _host, service) = service(FakeHost::default());
        let success = expect_success(service.run(Action::Refresh, &params("acme/widget")));
        assert_eq!(success.state, PluginState::NotPlugin);
    }

    #[test]
    fn full_lifecycle_install_activate_deactivate() {
        let (_dir, _host, service) = service(FakeHost {
            is_plugin: true,
            ..FakeHost::default()
        });
        let repo = params("acme/widget");
        assert_eq!(
            expect_success(service.run(Action::Install, &repo)).state,
            PluginState::InstalledInactive
        );
        assert_eq!(
            expect_success(service.run(Action::Activate, &repo)).state,
            PluginState::InstalledActive
        );
        assert_eq!(
            expect_success(service.run(Action::Deactivate, &repo)).state,
            PluginState::InstalledInactive
        );
        assert!(service.machine().is_locked("acme/widget").is_none());
    }

    #[test]
    fn locked_entity_fails_fast_with_concurrency() {
        let (_dir, host, service) = service(FakeHost {
            is_plugin: true,
            ..FakeHost::default()
        });
        assert!(service.machine().acquire_lock("acme/widget"));
        let failure = expect_failure(service.run(Action::Refresh, &params("acme/widget")));
        assert_eq!(failure.kind, ErrorKind::Concurrency);
        assert!(failure.recoverable);
        assert_eq!(failure.state, None);
        assert_eq!(*host.check_calls.lock().unwrap(), 0);
        assert!(service.machine().is_locked("acme/widget").is_some());
    }

    #[test]
    fn install_failure_moves_to_error_with_context() {
        let (_dir, _host, service) = service(FakeHost {
            is_plugin: true,
            install_error: Some("Download failed: could not unzip package".to_string()),
            ..FakeHost::default()
        });
        let failure = expect_failure(service.run(Action::Install, &params("acme/widget")));
        assert_eq!(failure.kind, ErrorKind::Download);
        assert!(!failure.recoverable);
        assert_eq!(failure.state, Some(PluginState::Error));

        let record = service.machine().get("acme/widget").unwrap();
        assert_eq!(record.state, PluginState::Error);
        let context = service.machine().error_context("acme/widget").unwrap().unwrap();
        assert_eq!(context.kind, ErrorKind::Download);
        assert_eq!(context.source, "install");
        assert!(!context.message.contains("unzip"));
    }

    #[test]
    fn install_from_error_rechecks_first() {
        let (_dir, host, service) = service(FakeHost {
            is_plugin: true,
            activate_error: Some("activation hook failed".to_string()),
            ..FakeHost::default()
        });
        let repo = params("acme/widget");
        expect_success(service.run(Action::Install, &repo));
        let failure = expect_failure(service.run(Action::Activate, &repo));
        assert_eq!(failure.kind, ErrorKind::Activation);
        assert_eq!(
            service.machine().get("acme/widget").unwrap().state,
            PluginState::Error
        );

        // Recheck lands in installed_inactive via reconcile, so install is a precondition failure.
        let failure = expect_failure(service.run(Action::Install, &repo));
        assert_eq!(failure.message, "Plugin is already installed");
        assert_eq!(failure.kind, ErrorKind::Precondition);
        assert!(!failure.recoverable);
        assert_eq!(failure.state, Some(PluginState::InstalledInactive));
        assert_eq!(*host.check_calls.lock().unwrap(), 2);
        assert_eq!(
            service.machine().get("acme/widget").unwrap().state,
            PluginState::InstalledInactive
        );
        assert!(service.machine().error_context("acme/widget").unwrap().is_none());
    }

    #[test]
    fn rate_limited_check_fills_quota_and_short_circuits() {
        let (_dir, host, service) = service(FakeHost {
            check_error: Some("API rate limit exceeded for 10.0.0.1".to_string()),
            ..FakeHost::default()
        });
        let failure = expect_failure(service.run(Action::Refresh, &params("acme/widget")));
        assert_eq!(failure.kind, ErrorKind::RateLimit);
        assert_eq!(failure.retry_delay_seconds, Some(60));

        let failure = expect_failure(service.run(Action::Refresh, &params("acme/other")));
        assert_eq!(failure.kind, ErrorKind::RateLimit);
        assert_eq!(*host.check_calls.lock().unwrap(), 1);
    }

    #[test]
    fn activate_requires_install() {
        let (_dir, _host, service) = service(FakeHost::default());
        let failure = expect_failure(service.run(Action::Activate, &params("acme/widget")));
        assert_eq!(failure.message, "Plugin is not installed");
        assert_eq!(failure.kind, ErrorKind::Precondition);
        assert!(!failure.recoverable);
        assert_eq!(failure.retry_delay_seconds, None);
        assert_eq!(failure.state, Some(PluginState::Unknown));
        assert_eq!(
            service.machine().get("acme/widget").unwrap().state,
            PluginState::Unknown
        );
        assert!(service.machine().error_context("acme/widget").unwrap().is_none());
    }

    #[test]
    fn missing_command_fails_as_generic_without_retry() {
        let (_dir, _host, service) = service(FakeHost {
            check_unconfigured: true,
            ..FakeHost::default()
        });
        let failure = expect_failure(service.run(Action::Refresh, &params("acme/widget")));
        assert_eq!(failure.kind, ErrorKind::Generic);
        assert!(!plugin_sync_protocol::should_auto_retry(failure.kind));
        assert_eq!(failure.state, Some(PluginState::Error));

        let context = service.machine().error_context("acme/widget").unwrap().unwrap();
        assert_eq!(context.kind, ErrorKind::Generic);
        assert_eq!(context.source, SOURCE_UPSTREAM);
    }

    #[test]
    fn refresh_picks_up_external_activation() {
        let (_dir, host, service) = service(FakeHost {
            is_plugin: true,
            ..FakeHost::default()
        });
        let repo = params("acme/widget");
        expect_success(service.run(Action::Refresh, &repo));
        {
            let mut registry = host.registry.lock().unwrap();
            registry.installed.insert("acme/widget".to_string());
            registry.active.insert("acme/widget".to_string());
        }
        assert_eq!(
            expect_success(service.run(Action::Refresh, &repo)).state,
            PluginState::InstalledActive
        );
    }

    #[test]
    fn retry_count_is_persisted_in_error_context() {
        let (_dir, _host, service) = service(FakeHost {
            check_error: Some("connection reset by peer".to_string()),
            ..FakeHost::default()
        });
        let repo = ActionParams {
            repository: "acme/widget".to_string(),
            retry_count: 2,
        };
        let failure = expect_failure(service.run(Action::Refresh, &repo));
        assert_eq!(failure.kind, ErrorKind::Network);
        assert_eq!(failure.retry_delay_seconds, Some(20));
        assert_eq!(failure.retry_count, 2);

        let context = service.machine().error_context("acme/widget").unwrap().unwrap();
        assert_eq!(context.retry_count, 2);
        assert!(context.last_retry_at.is_some());
    }

    #[test]
    fn reconcile_without_registry_reports_error() {
        struct NoRegistry;
        impl HostRegistry for NoRegistry {
            fn snapshot(&self) -> Result<RegistrySnapshot, CollaboratorError> {
                Err(CollaboratorError::new("no registry command configured"))
            }
        }
        let (_dir, host, service) = service(FakeHost::default());
        let service = ActionService::new(
            service.machine().clone(),
            host.clone(),
            host,
            Arc::new(NoRegistry),
        );
        assert!(service.reconcile(None).is_err());
    }
}
