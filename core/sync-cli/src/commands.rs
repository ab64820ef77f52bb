//! One-shot commands: snapshot, get, actions, reconcile, health.

use chrono::Utc;
use plugin_sync_client::{ActionOutcome, ActionRunner, ClientError, StateMirror, Transport};
use plugin_sync_protocol::{ActionFailure, EntitySnapshot, Guidance, Method};
use serde_json::Value;
use thiserror::Error;

use crate::view_cache::ViewCache;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{repository}: {message}")]
    ActionFailed { repository: String, message: String },

    #[error("Unexpected daemon reply: {0}")]
    UnexpectedReply(String),

    #[error("Lost the push channel after {0} reconnect attempts")]
    ChannelFailed(u32),
}

pub fn snapshot(transport: &Transport) -> Result<(), CliError> {
    let entities = transport.snapshot()?;
    remember_view(&entities);
    if entities.is_empty() {
        println!("No tracked repositories");
        return Ok(());
    }
    let width = entities.iter().map(|entity| entity.id.len()).max().unwrap_or(0);
    for entity in &entities {
        println!("{}", format_row(entity, width));
    }
    Ok(())
}

pub fn get(transport: &Transport, repository: &str) -> Result<(), CliError> {
    let entity = transport.get_state(repository)?;
    println!("{}", format_row(&entity, entity.id.len()));
    println!("  state:   {}", entity.state);
    println!("  updated: {}", entity.updated_at);
    if let Some(error) = &entity.error {
        println!(
            "  error:   {} ({}, retry {} of this failure)",
            error.message,
            error.kind.as_str(),
            error.retry_count
        );
        if let Some(delay) = error.retry_delay_seconds {
            println!("  retry in {}s", delay);
        }
        print_guidance(&error.guidance);
    }
    Ok(())
}

pub fn action(
    transport: &Transport,
    method: Method,
    repository: &str,
    auto_retry: bool,
) -> Result<(), CliError> {
    let mut mirror = match ViewCache::default_path() {
        Some(path) => StateMirror::with_hydration(ViewCache::load(&path)),
        None => StateMirror::new(),
    };
    if let Some(state) = mirror.get(repository) {
        tracing::debug!(repository, state = %state, "Last known state");
    }
    mirror.on_change(|change| match change.from {
        Some(from) if from != change.to => println!("{}: {} -> {}", change.id, from, change.to),
        _ => println!("{}: {}", change.id, change.to),
    });

    let runner = ActionRunner::new(transport).auto_retry(auto_retry);
    let outcome = runner.run(method, repository, &mut mirror);
    println!("{}", describe_outcome(&outcome));
    match outcome {
        ActionOutcome::Succeeded(_) => Ok(()),
        ActionOutcome::Failed(failure)
        | ActionOutcome::NonRecoverable(failure)
        | ActionOutcome::MaxRetriesReached(failure) => {
            print_guidance(&failure.guidance);
            Err(CliError::ActionFailed {
                repository: repository.to_string(),
                message: failure.message,
            })
        }
    }
}

pub fn reconcile(transport: &Transport, repository: Option<&str>) -> Result<(), CliError> {
    let data = transport.reconcile(repository)?;
    let results = data
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| CliError::UnexpectedReply(data.to_string()))?;
    if results.is_empty() {
        println!("Nothing to reconcile");
    }
    for result in results {
        println!("{}", format_reconcile(result));
    }
    Ok(())
}

pub fn health(transport: &Transport) -> Result<(), CliError> {
    let data = transport.health()?;
    let pretty = serde_json::to_string_pretty(&data)
        .map_err(|err| CliError::UnexpectedReply(err.to_string()))?;
    println!("{}", pretty);
    Ok(())
}

/// Caches the rendered view for the next cold start. Failing to write the
/// cache never fails the command.
pub fn remember_view(entities: &[EntitySnapshot]) {
    let Some(path) = ViewCache::default_path() else {
        return;
    };
    if let Err(err) = ViewCache::from_snapshot(entities, Utc::now()).save(&path) {
        tracing::warn!(error = %err, "Failed to write view cache");
    }
}

pub fn format_row(entity: &EntitySnapshot, width: usize) -> String {
    format!(
        "{:<width$}  {:<18}  {}",
        entity.id,
        entity.state.as_str(),
        entity.rendered_view,
        width = width
    )
}

pub fn describe_outcome(outcome: &ActionOutcome) -> String {
    match outcome {
        ActionOutcome::Succeeded(success) => {
            format!("{}: {}", success.repository, success.state.label())
        }
        ActionOutcome::Failed(failure) => describe_failure("failed", failure),
        ActionOutcome::NonRecoverable(failure) => describe_failure("failed permanently", failure),
        ActionOutcome::MaxRetriesReached(failure) => {
            describe_failure("gave up after retries", failure)
        }
    }
}

fn describe_failure(verb: &str, failure: &ActionFailure) -> String {
    let mut line = format!("{} ({}): {}", verb, failure.kind.as_str(), failure.message);
    if failure.recoverable {
        if let Some(delay) = failure.retry_delay_seconds {
            line.push_str(&format!(", retry in {}s", delay));
        }
    }
    line
}

fn format_reconcile(result: &Value) -> String {
    let field = |name: &str| result.get(name).and_then(Value::as_str).unwrap_or("?");
    let repository = field("repository");
    match field("outcome") {
        "unchanged" => format!("{}: unchanged ({})", repository, field("state")),
        "corrected" => format!("{}: corrected {} -> {}", repository, field("from"), field("to")),
        "skipped_locked" => format!("{}: skipped, action in progress", repository),
        "failed" => format!("{}: failed: {}", repository, field("error")),
        other => format!("{}: {}", repository, other),
    }
}

fn print_guidance(guidance: &Guidance) {
    println!("  {}", guidance.title);
    if !guidance.description.is_empty() {
        println!("  {}", guidance.description);
    }
    for action in &guidance.actions {
        println!("  - {}", action);
    }
    for link in &guidance.links {
        println!("  {}: {}", link.label, link.url);
    }
}
