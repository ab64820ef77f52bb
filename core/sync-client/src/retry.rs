//! Action runner with bounded automatic retry.
//!
//! Every outcome lands in the mirror. Transient failures (network, rate
//! limit, upstream) are retried after the classified delay, up to
//! [`MAX_RETRIES`]; running out of retries is reported separately from a
//! non-recoverable failure because the advice differs.

use chrono::Utc;
use plugin_sync_protocol::{
    max_retries_guidance, should_auto_retry, ActionFailure, ActionSuccess, Method, PluginState,
    MAX_RETRIES,
};
use std::time::Duration;

use crate::error::ClientError;
use crate::mirror::{error_context_from_failure, StateMirror};
use crate::transport::ActionExecutor;

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Succeeded(ActionSuccess),
    /// Recoverable, but not something to retry automatically (or retries
    /// were disabled). The user may retry by hand.
    Failed(ActionFailure),
    NonRecoverable(ActionFailure),
    MaxRetriesReached(ActionFailure),
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Succeeded(_))
    }
}

pub struct ActionRunner<'a, E: ActionExecutor> {
    executor: &'a E,
    auto_retry: bool,
    sleep: Box<dyn Fn(Duration) + 'a>,
}

impl<'a, E: ActionExecutor> ActionRunner<'a, E> {
    pub fn new(executor: &'a E) -> Self {
        Self {
            executor,
            auto_retry: true,
            sleep: Box::new(std::thread::sleep),
        }
    }

    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + 'a) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn run(&self, method: Method, repository: &str, mirror: &mut StateMirror) -> ActionOutcome {
        let mut retry_count = 0;
        loop {
            let failure = match self.attempt(method, repository, retry_count) {
                Ok(success) => {
                    mirror.set(&success.repository, success.state);
                    return ActionOutcome::Succeeded(success);
                }
                Err(failure) => failure,
            };

            tracing::info!(
                repository,
                kind = failure.kind.as_str(),
                recoverable = failure.recoverable,
                retry_count,
                "Action failed"
            );

            if !failure.recoverable {
                record_failure(mirror, repository, &failure);
                return ActionOutcome::NonRecoverable(failure);
            }
            if !self.auto_retry || !should_auto_retry(failure.kind) {
                record_failure(mirror, repository, &failure);
                return ActionOutcome::Failed(failure);
            }
            if retry_count >= MAX_RETRIES {
                let exhausted = max_retries_failure(failure);
                record_failure(mirror, repository, &exhausted);
                return ActionOutcome::MaxRetriesReached(exhausted);
            }

            let delay = Duration::from_secs(failure.retry_delay_seconds.unwrap_or(0));
            tracing::info!(repository, delay_secs = delay.as_secs(), "Retrying action");
            (self.sleep)(delay);
            retry_count += 1;
        }
    }

    fn attempt(
        &self,
        method: Method,
        repository: &str,
        retry_count: u32,
    ) -> Result<ActionSuccess, ActionFailure> {
        let result = self
            .executor
            .execute(method, repository, retry_count)
            .map_err(|err| failure_from_client_error(&err, retry_count))?;
        match result.into_outcome() {
            Ok(outcome) => outcome,
            Err(info) => Err(failure_from_client_error(
                &ClientError::Daemon {
                    code: info.code,
                    message: info.message,
                },
                retry_count,
            )),
        }
    }
}

/// Mirrors only the state the daemon reports for the entity. Failures that
/// never reached it (lock contention, rejected requests, lost connections)
/// leave the mirror alone; the push stream reports whatever really happened.
fn record_failure(mirror: &mut StateMirror, repository: &str, failure: &ActionFailure) {
    match failure.state {
        Some(PluginState::Error) => {
            mirror.set_error(repository, error_context_from_failure(failure, Utc::now()))
        }
        Some(state) => mirror.set(repository, state),
        None => {}
    }
}

fn failure_from_client_error(err: &ClientError, retry_count: u32) -> ActionFailure {
    tracing::warn!(error = %err, "Action request failed before a result arrived");
    let classification = err.classification(retry_count);
    ActionFailure {
        message: classification.guidance.title.clone(),
        kind: classification.kind,
        recoverable: classification.recoverable,
        retry_delay_seconds: classification.retry_delay_seconds,
        guidance: classification.guidance,
        retry_count,
        state: None,
    }
}

fn max_retries_failure(last: ActionFailure) -> ActionFailure {
    let guidance = max_retries_guidance();
    ActionFailure {
        message: guidance.title.clone(),
        retry_delay_seconds: None,
        guidance,
        ..last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use plugin_sync_protocol::{classify, ActionResult, Classification, ErrorKind};
    use std::cell::RefCell;

    struct Scripted {
        replies: RefCell<Vec<Result<ActionResult>>>,
        seen_retry_counts: RefCell<Vec<u32>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<ActionResult>>) -> Self {
            replies.reverse();
            Self {
                replies: RefCell::new(replies),
                seen_retry_counts: RefCell::new(Vec::new()),
            }
        }
    }

    impl ActionExecutor for Scripted {
        fn execute(&self, _method: Method, _repository: &str, retry_count: u32) -> Result<ActionResult> {
            self.seen_retry_counts.borrow_mut().push(retry_count);
            self.replies
                .borrow_mut()
                .pop()
                .unwrap_or_else(|| panic!("unexpected request #{}", retry_count))
        }
    }

    fn failed(classification: Classification, retry_count: u32) -> Result<ActionResult> {
        failed_in(classification, retry_count, Some(PluginState::Error))
    }

    fn failed_in(
        classification: Classification,
        retry_count: u32,
        state: Option<PluginState>,
    ) -> Result<ActionResult> {
        Ok(ActionResult::failure(&ActionFailure {
            message: classification.guidance.title.clone(),
            kind: classification.kind,
            recoverable: classification.recoverable,
            retry_delay_seconds: classification.retry_delay_seconds,
            guidance: classification.guidance,
            retry_count,
            state,
        }))
    }

    fn succeeded(state: PluginState) -> Result<ActionResult> {
        Ok(ActionResult::success(&ActionSuccess {
            repository: "acme/widget".to_string(),
            state,
        }))
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let executor = Scripted::new(vec![
            failed(classify("connection reset", "github_api", 0), 0),
            failed(classify("502 bad gateway", "github_api", 1), 1),
            succeeded(PluginState::Available),
        ]);
        let slept = RefCell::new(Vec::new());
        let runner = ActionRunner::new(&executor).with_sleep(|delay| slept.borrow_mut().push(delay.as_secs()));
        let mut mirror = StateMirror::new();

        let outcome = runner.run(Method::Refresh, "acme/widget", &mut mirror);
        assert!(outcome.is_success());
        assert_eq!(*executor.seen_retry_counts.borrow(), vec![0, 1, 2]);
        assert_eq!(*slept.borrow(), vec![5, 10]);
        assert_eq!(mirror.get("acme/widget"), Some(PluginState::Available));
    }

    #[test]
    fn stops_after_max_retries_with_distinct_guidance() {
        let executor = Scripted::new(
            (0..=MAX_RETRIES)
                .map(|n| failed(classify("API rate limit exceeded", "github_api", n), n))
                .collect(),
        );
        let runner = ActionRunner::new(&executor).with_sleep(|_| {});
        let mut mirror = StateMirror::new();

        let outcome = runner.run(Method::Refresh, "acme/widget", &mut mirror);
        let failure = match outcome {
            ActionOutcome::MaxRetriesReached(failure) => failure,
            other => panic!("expected max retries, got {:?}", other),
        };
        assert_eq!(failure.kind, ErrorKind::RateLimit);
        assert_eq!(failure.guidance, max_retries_guidance());
        assert_eq!(executor.seen_retry_counts.borrow().len(), MAX_RETRIES as usize + 1);

        assert_eq!(mirror.get("acme/widget"), Some(PluginState::Error));
        assert_eq!(
            mirror.error("acme/widget").unwrap().message,
            "Maximum retries reached"
        );
    }

    #[test]
    fn non_recoverable_failures_are_not_retried() {
        let executor = Scripted::new(vec![failed(classify("Repository not found", "github_api", 0), 0)]);
        let runner = ActionRunner::new(&executor).with_sleep(|_| panic!("should not sleep"));
        let mut mirror = StateMirror::new();

        let outcome = runner.run(Method::Install, "acme/widget", &mut mirror);
        assert!(matches!(outcome, ActionOutcome::NonRecoverable(ref f) if f.kind == ErrorKind::NotFound));
        assert!(mirror.error("acme/widget").is_some());
    }

    #[test]
    fn concurrency_is_reported_without_touching_the_mirror() {
        let executor = Scripted::new(vec![failed_in(Classification::concurrency(), 0, None)]);
        let runner = ActionRunner::new(&executor).with_sleep(|_| panic!("should not sleep"));
        let mut mirror = StateMirror::new();
        mirror.set("acme/widget", PluginState::Installing);

        let outcome = runner.run(Method::Install, "acme/widget", &mut mirror);
        assert!(matches!(outcome, ActionOutcome::Failed(ref f) if f.kind == ErrorKind::Concurrency));
        assert_eq!(mirror.get("acme/widget"), Some(PluginState::Installing));
    }

    #[test]
    fn transport_timeouts_become_network_failures() {
        let executor = Scripted::new(vec![Err(ClientError::Timeout(Duration::from_secs(30)))]);
        let runner = ActionRunner::new(&executor).auto_retry(false);
        let mut mirror = StateMirror::new();
        mirror.set("acme/widget", PluginState::InstalledInactive);

        let outcome = runner.run(Method::Activate, "acme/widget", &mut mirror);
        assert!(matches!(outcome, ActionOutcome::Failed(ref f) if f.kind == ErrorKind::Network));
        assert_eq!(mirror.get("acme/widget"), Some(PluginState::InstalledInactive));
        assert!(mirror.error("acme/widget").is_none());
    }

    #[test]
    fn precondition_failure_keeps_the_reported_state() {
        let executor = Scripted::new(vec![failed_in(
            Classification::precondition("Plugin is not installed"),
            0,
            Some(PluginState::Unknown),
        )]);
        let runner = ActionRunner::new(&executor).with_sleep(|_| panic!("should not sleep"));
        let mut mirror = StateMirror::new();
        mirror.set("acme/widget", PluginState::Unknown);

        let outcome = runner.run(Method::Activate, "acme/widget", &mut mirror);
        assert!(matches!(outcome, ActionOutcome::NonRecoverable(ref f) if f.kind == ErrorKind::Precondition));
        assert_eq!(mirror.get("acme/widget"), Some(PluginState::Unknown));
        assert!(mirror.error("acme/widget").is_none());
    }

    #[test]
    fn rejected_request_never_creates_a_mirror_entry() {
        let executor = Scripted::new(vec![Err(ClientError::Daemon {
            code: "invalid_repository".to_string(),
            message: "repository id must be owner/name".to_string(),
        })]);
        let runner = ActionRunner::new(&executor).with_sleep(|_| {});
        let mut mirror = StateMirror::new();

        runner.run(Method::Install, "bogus", &mut mirror);
        assert_eq!(mirror.get("bogus"), None);
        assert!(mirror.ids().is_empty());
    }
}
