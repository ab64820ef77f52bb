//! Request/response transport to the plugin-sync daemon.
//!
//! One request per connection, newline-delimited JSON. Every read carries a
//! timeout; an abandoned request surfaces as [`ClientError::Timeout`] and any
//! server-side work it started still lands later as a push record.

use plugin_sync_protocol::{
    ActionResult, EntitySnapshot, Method, Request, Response, MAX_REQUEST_BYTES,
};
use serde_json::{json, Value};
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClientError, Result};

pub const SOCKET_ENV: &str = "PLUGIN_SYNC_SOCKET";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_NAME: &str = "daemon.sock";
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn default_socket_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ClientError::HomeNotFound)?;
    Ok(home.join(".plugin-sync").join(SOCKET_NAME))
}

/// Anything that can perform an action request. Implemented by [`Transport`];
/// tests substitute scripted executors.
pub trait ActionExecutor {
    fn execute(&self, method: Method, repository: &str, retry_count: u32) -> Result<ActionResult>;
}

#[derive(Debug, Clone)]
pub struct Transport {
    socket: PathBuf,
    timeout: Duration,
}

impl Transport {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(default_socket_path()?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn request(&self, request: &Request) -> Result<Response> {
        let mut reader = self.open(request)?;
        read_response(&mut reader, self.timeout)
    }

    /// Sends `method` and unwraps the response envelope into its `data`.
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value> {
        let response = self.request(&Request::new(method, None, params))?;
        tracing::debug!(method = ?method, id = ?response.id, ok = response.ok, "Daemon response");
        into_data(response)
    }

    pub fn health(&self) -> Result<Value> {
        self.call(Method::GetHealth, None)
    }

    pub fn snapshot(&self) -> Result<Vec<EntitySnapshot>> {
        let data = self.call(Method::ListStates, None)?;
        serde_json::from_value(data).map_err(|err| ClientError::json("decoding snapshot", err))
    }

    pub fn get_state(&self, repository: &str) -> Result<EntitySnapshot> {
        let data = self.call(Method::GetState, Some(json!({ "repository": repository })))?;
        serde_json::from_value(data).map_err(|err| ClientError::json("decoding entity", err))
    }

    pub fn reconcile(&self, repository: Option<&str>) -> Result<Value> {
        let params = repository.map(|repository| json!({ "repository": repository }));
        self.call(Method::Reconcile, params)
    }

    /// Opens a `subscribe` stream. The returned reader yields one push record
    /// per line; reads time out at `poll` so the caller can check for shutdown.
    pub fn subscribe(&self, poll: Duration) -> Result<BufReader<UnixStream>> {
        let mut reader = self.open(&Request::new(Method::Subscribe, None, None))?;
        let ack = read_response(&mut reader, self.timeout)?;
        into_data(ack)?;
        reader
            .get_ref()
            .set_read_timeout(Some(poll))
            .map_err(|err| ClientError::io("setting push read timeout", err))?;
        Ok(reader)
    }

    fn open(&self, request: &Request) -> Result<BufReader<UnixStream>> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        let _ = stream.set_read_timeout(Some(self.timeout));
        let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));

        serde_json::to_writer(&mut stream, request)
            .map_err(|err| ClientError::json("writing request", err))?;
        stream
            .write_all(b"\n")
            .map_err(|err| ClientError::io("writing request", err))?;
        stream.flush().ok();
        Ok(BufReader::new(stream))
    }
}

impl ActionExecutor for Transport {
    fn execute(&self, method: Method, repository: &str, retry_count: u32) -> Result<ActionResult> {
        let data = self.call(
            method,
            Some(json!({ "repository": repository, "retry_count": retry_count })),
        )?;
        serde_json::from_value(data).map_err(|err| ClientError::json("decoding action result", err))
    }
}

fn into_data(response: Response) -> Result<Value> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let (code, message) = response
        .error
        .map(|err| (err.code, err.message))
        .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
    Err(ClientError::Daemon { code, message })
}

/// Reads a single response line. Leaves the reader positioned after the
/// newline so a subscribe stream can continue from the same socket.
fn read_response(reader: &mut BufReader<UnixStream>, timeout: Duration) -> Result<Response> {
    let mut buffer = Vec::new();
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    match reader.by_ref().take(limit).read_until(b'\n', &mut buffer) {
        Ok(_) => {}
        Err(err) if is_timeout(&err) => return Err(ClientError::Timeout(timeout)),
        Err(err) => return Err(ClientError::io("reading response", err)),
    }

    if buffer.len() > MAX_REQUEST_BYTES {
        return Err(ClientError::Daemon {
            code: "response_too_large".to_string(),
            message: "Response exceeded maximum size".to_string(),
        });
    }
    if buffer.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ClientError::Closed);
    }

    serde_json::from_slice(&buffer).map_err(|err| ClientError::json("parsing response", err))
}

pub(crate) fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
