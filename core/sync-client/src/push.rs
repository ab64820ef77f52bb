//! Owned push-channel resource.
//!
//! A worker thread keeps a `subscribe` stream open, reconnecting under the
//! [`ReconnectManager`] policy, and forwards push records and status changes
//! to the owner over an mpsc channel. The owner applies them on its own
//! thread, so the mirror needs no locking.

use plugin_sync_protocol::PushEvent;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::reconnect::{ConnectionStatus, ReconnectManager};
use crate::transport::{is_timeout, Transport};

/// Read poll interval. Bounds how quickly the worker notices `close()`.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Event(PushEvent),
    Status(ConnectionStatus),
}

pub struct PushChannel {
    messages: Receiver<ChannelMessage>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PushChannel {
    pub fn open(transport: Transport) -> Self {
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::clone(&shutdown);
        let worker = thread::spawn(move || run_worker(transport, tx, worker_shutdown));
        Self {
            messages: rx,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Waits up to `timeout` for the next message. `None` on timeout; once the
    /// worker has exited every call returns `None` immediately.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ChannelMessage> {
        match self.messages.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_iter(&self) -> impl Iterator<Item = ChannelMessage> + '_ {
        self.messages.try_iter()
    }

    pub fn is_closed(&self) -> bool {
        self.worker.is_none()
    }

    /// Stops the worker and waits for it to exit.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Push channel worker panicked");
            }
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(transport: Transport, tx: Sender<ChannelMessage>, shutdown: Arc<AtomicBool>) {
    let mut manager = ReconnectManager::new();
    let status_tx = tx.clone();
    manager.on_status(move |status| {
        let _ = status_tx.send(ChannelMessage::Status(status));
    });

    while !shutdown.load(Ordering::SeqCst) && manager.begin_connect() {
        match transport.subscribe(POLL_INTERVAL) {
            Ok(mut reader) => {
                manager.on_open(Instant::now());
                pump(&mut reader, &mut manager, &tx, &shutdown);
            }
            Err(err) => tracing::debug!(error = %err, "Push channel connect failed"),
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match manager.on_disconnect() {
            Some(delay) => sleep_unless_shutdown(delay, &shutdown),
            None => break,
        }
    }
    manager.close();
}

/// Reads records until the stream ends, goes stale, or shutdown is requested.
fn pump(
    reader: &mut impl BufRead,
    manager: &mut ReconnectManager,
    tx: &Sender<ChannelMessage>,
    shutdown: &AtomicBool,
) {
    let mut pending = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match reader.read_until(b'\n', &mut pending) {
            Ok(0) => return,
            Ok(_) if pending.last() == Some(&b'\n') => {
                manager.on_record(Instant::now());
                match serde_json::from_slice::<PushEvent>(&pending) {
                    Ok(event) => {
                        if tx.send(ChannelMessage::Event(event)).is_err() {
                            return;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "Ignoring malformed push record"),
                }
                pending.clear();
            }
            // Partial line; the rest arrives on the next read.
            Ok(_) => {}
            Err(err) if is_timeout(&err) => {
                if manager.heartbeat_check(Instant::now()) {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "Push channel read failed");
                return;
            }
        }
    }
}

fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(std::cmp::min(POLL_INTERVAL, deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_sync_protocol::{PluginState, Request, Response};
    use std::io::{BufReader, Write};
    use std::os::unix::net::UnixListener;

    fn next_event(channel: &PushChannel) -> PushEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(ChannelMessage::Event(event)) = channel.recv_timeout(Duration::from_millis(100)) {
                return event;
            }
        }
        panic!("no push event received");
    }

    #[test]
    fn delivers_records_and_reconnects_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = thread::spawn(move || {
            for to in ["checking", "available"] {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let request: Request = serde_json::from_str(line.trim_end()).unwrap();
                let mut stream = reader.into_inner();
                let ack = Response::ok(request.id, serde_json::json!({"subscribed": true}));
                let mut payload = serde_json::to_vec(&ack).unwrap();
                payload.push(b'\n');
                payload.extend_from_slice(
                    format!(
                        "{{\"type\":\"state_changed\",\"repository\":\"acme/widget\",\"to\":\"{}\"}}\n",
                        to
                    )
                    .as_bytes(),
                );
                stream.write_all(&payload).unwrap();
            }
        });

        let mut channel = PushChannel::open(Transport::new(&socket));
        assert_eq!(
            next_event(&channel),
            PushEvent::StateChanged {
                repository: "acme/widget".to_string(),
                to: PluginState::Checking,
            }
        );
        // The server hangs up; the worker reconnects after a one second delay.
        assert_eq!(
            next_event(&channel),
            PushEvent::StateChanged {
                repository: "acme/widget".to_string(),
                to: PluginState::Available,
            }
        );
        server.join().unwrap();

        channel.close();
        assert!(channel.is_closed());
        let statuses: Vec<_> = channel
            .try_iter()
            .filter_map(|message| match message {
                ChannelMessage::Status(status) => Some(status),
                ChannelMessage::Event(_) => None,
            })
            .collect();
        assert_eq!(statuses.last(), Some(&ConnectionStatus::Disconnected));
    }

    #[test]
    fn close_stops_a_worker_that_cannot_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = PushChannel::open(Transport::new(dir.path().join("absent.sock")));
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        channel.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(channel.is_closed());
    }
}
