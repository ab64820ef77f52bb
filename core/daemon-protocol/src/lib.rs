//! IPC protocol types and validation for plugin-sync-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests and to decode pushed records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod classify;
pub mod state;

pub use classify::{
    classify, max_retries_guidance, should_auto_retry, Classification, ErrorKind, Guidance,
    GuidanceLink, Severity, MAX_RETRIES,
};
pub use state::{allowed_targets, is_allowed, PluginState};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_REPOSITORY_ID_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    ListStates,
    GetState,
    Install,
    Activate,
    Deactivate,
    Refresh,
    Reconcile,
    Subscribe,
}

impl Method {
    /// Methods that take the processing lock and delegate to a collaborator.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Method::Install | Method::Activate | Method::Deactivate | Method::Refresh
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Parameters for `install`, `activate`, `deactivate`, `refresh` and `get_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActionParams {
    pub repository: String,
    /// How many automatic retries preceded this request.
    #[serde(default)]
    pub retry_count: u32,
}

/// Parameters for `reconcile`. Without a repository every tracked entity is checked.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReconcileParams {
    #[serde(default)]
    pub repository: Option<String>,
}

pub fn parse_action_params(params: Value) -> Result<ActionParams, ErrorInfo> {
    let parsed: ActionParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("action params are invalid: {}", err),
        )
    })?;
    validate_repository_id(&parsed.repository)?;
    Ok(parsed)
}

pub fn parse_reconcile_params(params: Option<Value>) -> Result<ReconcileParams, ErrorInfo> {
    let parsed: ReconcileParams = match params {
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                "invalid_params",
                format!("reconcile params are invalid: {}", err),
            )
        })?,
        None => ReconcileParams::default(),
    };
    if let Some(repository) = parsed.repository.as_deref() {
        validate_repository_id(repository)?;
    }
    Ok(parsed)
}

/// Repository identifiers are `owner/name`.
pub fn validate_repository_id(id: &str) -> Result<(), ErrorInfo> {
    if id.len() > MAX_REPOSITORY_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_repository",
            format!(
                "repository must be {} characters or fewer",
                MAX_REPOSITORY_ID_LEN
            ),
        ));
    }

    let mut parts = id.split('/');
    let (owner, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => (owner, name),
        _ => {
            return Err(ErrorInfo::new(
                "invalid_repository",
                "repository must be in owner/name form",
            ))
        }
    };

    for segment in [owner, name] {
        if segment.is_empty() || !segment.chars().all(is_repository_char) {
            return Err(ErrorInfo::new(
                "invalid_repository",
                format!("invalid repository segment: {:?}", segment),
            ));
        }
    }

    Ok(())
}

fn is_repository_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// One row of the snapshot query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    pub id: String,
    pub state: PluginState,
    pub updated_at: String,
    /// Last-known view of the row as a client would render it.
    pub rendered_view: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
}

/// Persisted failure details. Present exactly while the entity is in `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorContext {
    pub message: String,
    pub source: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    #[serde(default)]
    pub last_retry_at: Option<String>,
    pub guidance: Guidance,
}

/// `data` of a successful action response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSuccess {
    pub repository: String,
    pub state: PluginState,
}

/// `data` of a failed action response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionFailure {
    pub message: String,
    pub kind: ErrorKind,
    pub recoverable: bool,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    pub guidance: Guidance,
    #[serde(default)]
    pub retry_count: u32,
    /// State the entity was left in. Absent when the failure never reached
    /// the entity (lock contention, rejected request, lost connection).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PluginState>,
}

/// Action result envelope carried in `Response::data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    pub data: Value,
}

impl ActionResult {
    pub fn success(data: &ActionSuccess) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn failure(data: &ActionFailure) -> Self {
        Self {
            success: false,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn into_outcome(self) -> Result<Result<ActionSuccess, ActionFailure>, ErrorInfo> {
        let decode_err =
            |err: serde_json::Error| ErrorInfo::new("invalid_response", err.to_string());
        if self.success {
            serde_json::from_value(self.data)
                .map(Ok)
                .map_err(decode_err)
        } else {
            serde_json::from_value(self.data)
                .map(Err)
                .map_err(decode_err)
        }
    }
}

/// Records written to a `subscribe` stream, one per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    StateChanged { repository: String, to: PluginState },
    Heartbeat { at: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_owner_name_ids() {
        assert!(validate_repository_id("acme/widget").is_ok());
        assert!(validate_repository_id("a-b_c.d/e.f-g_h").is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        for id in ["", "acme", "acme/", "/widget", "a/b/c", "acme/wid get", "ac;me/x"] {
            let err = validate_repository_id(id).unwrap_err();
            assert_eq!(err.code, "invalid_repository", "{}", id);
        }
        let long = format!("acme/{}", "x".repeat(MAX_REPOSITORY_ID_LEN));
        assert!(validate_repository_id(&long).is_err());
    }

    #[test]
    fn parses_action_params_with_default_retry_count() {
        let params = parse_action_params(serde_json::json!({"repository": "acme/widget"})).unwrap();
        assert_eq!(params.retry_count, 0);
    }

    #[test]
    fn rejects_unknown_action_fields() {
        let err = parse_action_params(serde_json::json!({
            "repository": "acme/widget",
            "force": true
        }))
        .unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn reconcile_params_are_optional() {
        assert_eq!(parse_reconcile_params(None).unwrap().repository, None);
        assert!(parse_reconcile_params(Some(serde_json::json!({"repository": "nope"}))).is_err());
    }

    #[test]
    fn push_event_wire_shape() {
        let event = PushEvent::StateChanged {
            repository: "acme/widget".to_string(),
            to: PluginState::InstalledActive,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "state_changed",
                "repository": "acme/widget",
                "to": "installed_active"
            })
        );
    }

    #[test]
    fn action_result_decodes_failure() {
        let failure = ActionFailure {
            message: "Rate limit reached".to_string(),
            kind: ErrorKind::RateLimit,
            recoverable: true,
            retry_delay_seconds: Some(60),
            guidance: classify("rate limit", "github_api", 0).guidance,
            retry_count: 1,
            state: Some(PluginState::Error),
        };
        let outcome = ActionResult::failure(&failure).into_outcome().unwrap();
        assert_eq!(outcome, Err(failure));
    }

    #[test]
    fn failure_without_state_omits_the_field() {
        let failure = ActionFailure {
            message: "Operation in progress".to_string(),
            kind: ErrorKind::Concurrency,
            recoverable: true,
            retry_delay_seconds: Some(2),
            guidance: Classification::concurrency().guidance,
            retry_count: 0,
            state: None,
        };
        let result = ActionResult::failure(&failure);
        assert!(result.data.get("state").is_none());
        assert_eq!(result.into_outcome().unwrap(), Err(failure));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let raw = r#"{"protocol_version":1,"method":"uninstall"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }
}
