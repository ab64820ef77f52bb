//! plugin-sync daemon entrypoint.
//!
//! A single-writer service that owns plugin lifecycle state. It listens on a
//! Unix socket, validates every request, persists state through SQLite, and
//! pushes state changes to subscribed clients.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plugin_sync_protocol::{
    parse_action_params, parse_reconcile_params, ErrorInfo, Method, PushEvent, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;

mod actions;
mod broadcast;
mod collaborators;
mod config;
mod db;
mod machine;

use actions::{Action, ActionService};
use broadcast::Broadcaster;
use collaborators::CommandCollaborators;
use config::{DaemonConfig, DaemonSection};
use db::Db;
use machine::{MachineSettings, PluginStateMachine, ReconcileOutcome};

const STATE_DIR: &str = ".plugin-sync";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const SUBSCRIBER_POLL_MILLIS: u64 = 500;
const HEALTH_TRANSITION_LIMIT: usize = 20;

struct DaemonState {
    service: ActionService,
    settings: DaemonSection,
}

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "plugin-sync daemon started");

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    };
    info!(
        heartbeat_interval_secs = config.daemon.heartbeat_interval_secs,
        lock_ttl_secs = config.daemon.lock_ttl_secs,
        reconcile_interval_secs = config.daemon.reconcile_interval_secs,
        registry_configured = config.commands.registry.is_some(),
        "Daemon config loaded"
    );

    let state = Arc::new(compose(db, config));
    spawn_heartbeat(Arc::clone(&state));
    spawn_reconciler(Arc::clone(&state));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

/// Composition root: the only place concrete collaborators are chosen.
fn compose(db: Db, config: DaemonConfig) -> DaemonState {
    let broadcaster = Arc::new(Broadcaster::new());
    let machine = Arc::new(PluginStateMachine::new(
        db,
        broadcaster,
        MachineSettings {
            lock_ttl_secs: config.daemon.lock_ttl_secs,
            entity_ttl_secs: config.daemon.entity_ttl_secs,
        },
    ));
    let collaborators = Arc::new(CommandCollaborators::new(config.commands.clone()));
    let service = ActionService::new(
        machine,
        collaborators.clone(),
        collaborators.clone(),
        collaborators,
    );
    DaemonState {
        service,
        settings: config.daemon,
    }
}

fn spawn_heartbeat(state: Arc<DaemonState>) {
    let interval = Duration::from_secs(state.settings.heartbeat_interval_secs);
    thread::spawn(move || loop {
        thread::sleep(interval);
        state.service.machine().broadcaster().heartbeat();
    });
}

fn spawn_reconciler(state: Arc<DaemonState>) {
    let interval = Duration::from_secs(state.settings.reconcile_interval_secs.max(1));
    thread::spawn(move || loop {
        thread::sleep(interval);
        match state.service.reconcile(None) {
            Ok(results) => {
                let corrected = results
                    .iter()
                    .filter(|(_, outcome)| matches!(outcome, ReconcileOutcome::Corrected { .. }))
                    .count();
                if corrected > 0 {
                    info!(corrected, "Periodic reconciliation corrected entities");
                }
            }
            Err(err) => tracing::debug!(error = %err, "Periodic reconciliation skipped"),
        }
        state.service.machine().prune_expired();
    });
}

fn init_logging() {
    let debug_enabled = env::var("PLUGIN_SYNC_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn state_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(STATE_DIR))
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    Ok(state_dir()?.join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(state_dir()?.join("daemon").join("state.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<DaemonState>) {
    let mut request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_line(&mut stream, &response);
            return;
        }
    };

    if request.id.is_none() {
        request.id = Some(ulid::Ulid::new().to_string());
    }
    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");

    if request.method == Method::Subscribe && request.protocol_version == PROTOCOL_VERSION {
        stream_push_events(stream, request.id, &state);
        return;
    }

    let response = handle_request(request, &state);
    let _ = write_line(&mut stream, &response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &DaemonState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let machine = state.service.machine();
    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "subscribers": machine.broadcaster().subscriber_count(),
                "heartbeat_interval_secs": state.settings.heartbeat_interval_secs,
                "reconcile_interval_secs": state.settings.reconcile_interval_secs,
            });
            if let Ok(entities) = machine.db().list_entities() {
                data["entities"] = Value::from(entities.len());
            }
            if let Ok(rows) = machine.db().recent_transitions(HEALTH_TRANSITION_LIMIT) {
                if let Ok(value) = serde_json::to_value(rows) {
                    data["recent_transitions"] = value;
                }
            }
            Response::ok(request.id, data)
        }
        Method::ListStates => match machine.snapshot() {
            Ok(entities) => {
                tracing::debug!(entities = entities.len(), "State snapshot");
                to_response(request.id, &entities, "snapshot")
            }
            Err(err) => Response::error(
                request.id,
                "snapshot_error",
                format!("Failed to read snapshot: {}", err),
            ),
        },
        Method::GetState => {
            let params = match require_params(&request) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let parsed = match parse_action_params(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match machine.entity_snapshot(&parsed.repository) {
                Ok(entity) => to_response(request.id, &entity, "entity"),
                Err(err) => Response::error(
                    request.id,
                    "state_error",
                    format!("Failed to read state: {}", err),
                ),
            }
        }
        Method::Install | Method::Activate | Method::Deactivate | Method::Refresh => {
            handle_action(request, state)
        }
        Method::Reconcile => {
            let parsed = match parse_reconcile_params(request.params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.service.reconcile(parsed.repository.as_deref()) {
                Ok(results) => {
                    let results: Vec<Value> = results
                        .iter()
                        .map(|(repository, outcome)| reconcile_json(repository, outcome))
                        .collect();
                    Response::ok(request.id, serde_json::json!({ "results": results }))
                }
                Err(err) => Response::error(request.id, "registry_unavailable", err),
            }
        }
        // Streams are served by stream_push_events before dispatch.
        Method::Subscribe => Response::error(
            request.id,
            "invalid_request",
            "subscribe must be the only request on its connection",
        ),
    }
}

fn handle_action(request: Request, state: &DaemonState) -> Response {
    let Some(action) = Action::from_method(request.method) else {
        return Response::error(request.id, "invalid_request", "not an action method");
    };
    let params = match require_params(&request) {
        Ok(params) => params,
        Err(err) => return Response::error_with_info(request.id, err),
    };
    let parsed = match parse_action_params(params) {
        Ok(parsed) => parsed,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    info!(
        id = ?request.id,
        action = action.as_str(),
        repository = %parsed.repository,
        retry_count = parsed.retry_count,
        "Action requested"
    );
    let result = state.service.run(action, &parsed);
    to_response(request.id, &result, "action result")
}

fn require_params(request: &Request) -> Result<Value, ErrorInfo> {
    request
        .params
        .clone()
        .ok_or_else(|| ErrorInfo::new("invalid_params", "repository is required"))
}

fn reconcile_json(repository: &str, outcome: &ReconcileOutcome) -> Value {
    match outcome {
        ReconcileOutcome::Unchanged(state) => serde_json::json!({
            "repository": repository,
            "outcome": "unchanged",
            "state": state,
        }),
        ReconcileOutcome::Corrected { from, to } => serde_json::json!({
            "repository": repository,
            "outcome": "corrected",
            "from": from,
            "to": to,
        }),
        ReconcileOutcome::SkippedLocked => serde_json::json!({
            "repository": repository,
            "outcome": "skipped_locked",
        }),
        ReconcileOutcome::Failed(err) => serde_json::json!({
            "repository": repository,
            "outcome": "failed",
            "error": err,
        }),
    }
}

fn to_response<T: serde::Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

/// Holds a `subscribe` connection open, writing one push record per line until
/// the peer goes away. Heartbeats bound how long a dead peer lingers.
fn stream_push_events(mut stream: UnixStream, id: Option<String>, state: &DaemonState) {
    let broadcaster = state.service.machine().broadcaster();
    let events = broadcaster.subscribe();
    let ack = Response::ok(
        id.clone(),
        serde_json::json!({
            "subscribed": true,
            "heartbeat_interval_secs": state.settings.heartbeat_interval_secs,
        }),
    );
    if write_line(&mut stream, &ack).is_err() {
        return;
    }
    info!(id = ?id, subscribers = broadcaster.subscriber_count(), "Subscriber connected");

    loop {
        let event: PushEvent =
            match events.recv_timeout(Duration::from_millis(SUBSCRIBER_POLL_MILLIS)) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
        if let Err(err) = write_line(&mut stream, &event) {
            tracing::debug!(id = ?id, error = %err, "Subscriber write failed");
            break;
        }
    }
    info!(id = ?id, "Subscriber disconnected");
}

fn write_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
