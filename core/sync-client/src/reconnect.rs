//! Reconnection policy for the push channel.
//!
//! Pure bookkeeping: the manager never touches a socket. The push channel
//! driver reports opens, records and disconnects, and the manager answers
//! with the next delay, the connection status, and whether the channel has
//! gone stale.

use std::cmp;
use std::time::{Duration, Instant};

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(30);
pub const MAX_ATTEMPTS: u32 = 10;
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Server heartbeats arrive about every 25s.
pub const STALE_AFTER: Duration = Duration::from_secs(35);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Attempts exhausted. Terminal.
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
        }
    }
}

type StatusListener = Box<dyn FnMut(ConnectionStatus) + Send>;

pub struct ReconnectManager {
    status: ConnectionStatus,
    attempts: u32,
    last_event_at: Option<Instant>,
    next_heartbeat_check: Option<Instant>,
    closed: bool,
    listeners: Vec<StatusListener>,
}

impl Default for ReconnectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectManager {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            last_event_at: None,
            next_heartbeat_check: None,
            closed: false,
            listeners: Vec::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn on_status(&mut self, listener: impl FnMut(ConnectionStatus) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Returns false when the manager is closed or has given up.
    pub fn begin_connect(&mut self) -> bool {
        if self.closed || self.status == ConnectionStatus::Failed {
            return false;
        }
        self.set_status(ConnectionStatus::Connecting);
        true
    }

    pub fn on_open(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.attempts = 0;
        self.last_event_at = Some(now);
        self.next_heartbeat_check = Some(now + HEARTBEAT_CHECK_INTERVAL);
        self.set_status(ConnectionStatus::Connected);
    }

    /// Any received record, heartbeat or data, proves the channel alive.
    pub fn on_record(&mut self, now: Instant) {
        self.last_event_at = Some(now);
    }

    /// Records an error or unexpected close. Returns the delay before the next
    /// attempt, or `None` once attempts are exhausted or the manager is closed.
    pub fn on_disconnect(&mut self) -> Option<Duration> {
        self.last_event_at = None;
        self.next_heartbeat_check = None;
        if self.closed {
            return None;
        }
        if self.attempts >= MAX_ATTEMPTS {
            tracing::warn!(attempts = self.attempts, "Push channel reconnect attempts exhausted");
            self.set_status(ConnectionStatus::Failed);
            return None;
        }
        let delay = backoff_delay(self.attempts);
        self.attempts += 1;
        self.set_status(ConnectionStatus::Disconnected);
        tracing::debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "Push channel reconnect scheduled");
        Some(delay)
    }

    /// Runs the heartbeat monitor. Only evaluates staleness once per
    /// [`HEARTBEAT_CHECK_INTERVAL`]; returns true when the channel should be
    /// force-closed even though the socket still looks open.
    pub fn heartbeat_check(&mut self, now: Instant) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        match self.next_heartbeat_check {
            Some(due) if now >= due => {
                self.next_heartbeat_check = Some(now + HEARTBEAT_CHECK_INTERVAL);
            }
            _ => return false,
        }
        let stale = self
            .last_event_at
            .map(|at| now.saturating_duration_since(at) > STALE_AFTER)
            .unwrap_or(true);
        if stale {
            tracing::warn!("Push channel stale; forcing reconnect");
        }
        stale
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.last_event_at = None;
        self.next_heartbeat_check = None;
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        for listener in self.listeners.iter_mut() {
            listener(status);
        }
    }
}

/// `min(30s, 1s * 2^attempts)`.
pub fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    cmp::min(BASE_DELAY.saturating_mul(factor), MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn backoff_sequence_caps_then_fails_after_ten_attempts() {
        let mut manager = ReconnectManager::new();
        let mut delays = Vec::new();
        while let Some(delay) = manager.on_disconnect() {
            delays.push(delay.as_secs());
            assert!(manager.begin_connect());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
        assert_eq!(manager.status(), ConnectionStatus::Failed);
        assert!(!manager.begin_connect());
    }

    #[test]
    fn open_resets_attempts() {
        let mut manager = ReconnectManager::new();
        manager.on_disconnect();
        manager.on_disconnect();
        assert_eq!(manager.attempts(), 2);

        manager.begin_connect();
        manager.on_open(Instant::now());
        assert_eq!(manager.attempts(), 0);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(manager.on_disconnect(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn stale_channel_detected_only_on_check_interval() {
        let start = Instant::now();
        let mut manager = ReconnectManager::new();
        manager.begin_connect();
        manager.on_open(start);

        assert!(!manager.heartbeat_check(start + Duration::from_secs(5)));
        assert!(!manager.heartbeat_check(start + Duration::from_secs(10)));
        manager.on_record(start + Duration::from_secs(12));
        assert!(!manager.heartbeat_check(start + Duration::from_secs(20)));
        assert!(!manager.heartbeat_check(start + Duration::from_secs(40)));
        assert!(!manager.heartbeat_check(start + Duration::from_secs(48)));
        // 38s since the last record at 12s.
        assert!(manager.heartbeat_check(start + Duration::from_secs(50)));
    }

    #[test]
    fn status_listeners_see_each_change_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut manager = ReconnectManager::new();
        manager.on_status(move |status| sink.lock().unwrap().push(status));

        manager.begin_connect();
        manager.begin_connect();
        manager.on_open(Instant::now());
        manager.on_disconnect();
        manager.close();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn closed_manager_never_reschedules() {
        let mut manager = ReconnectManager::new();
        manager.close();
        assert_eq!(manager.on_disconnect(), None);
        assert!(!manager.begin_connect());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }
}
