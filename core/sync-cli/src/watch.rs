//! Live view: an initial snapshot, then push records as they arrive.
//!
//! The mirror is fed from the snapshot and the push channel on this thread
//! only. Every reconnect re-reads the snapshot, since records sent while the
//! channel was down are not replayed.

use plugin_sync_client::reconnect::MAX_ATTEMPTS;
use plugin_sync_client::{ChannelMessage, ConnectionStatus, PushChannel, StateChange, StateMirror, Transport};
use plugin_sync_protocol::PushEvent;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::commands::{remember_view, CliError};
use crate::view_cache::ViewCache;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run(transport: Transport, filter: Option<&str>) -> Result<(), CliError> {
    let mut view = WatchView::new(filter);
    view.load_snapshot(&transport)?;
    view.print_visible();

    let mut channel = PushChannel::open(transport.clone());
    let mut connected_once = false;
    loop {
        let Some(message) = channel.recv_timeout(RECV_TIMEOUT) else {
            if channel.is_closed() {
                return Ok(());
            }
            continue;
        };
        match message {
            ChannelMessage::Event(event) => view.apply(&event),
            ChannelMessage::Status(status) => {
                eprintln!("[{}]", status.as_str());
                match status {
                    ConnectionStatus::Connected if connected_once => {
                        view.load_snapshot(&transport)?;
                    }
                    ConnectionStatus::Connected => connected_once = true,
                    ConnectionStatus::Failed => {
                        channel.close();
                        return Err(CliError::ChannelFailed(MAX_ATTEMPTS));
                    }
                    ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {}
                }
            }
        }
    }
}

/// Mirror plus the optional display filter, printing visible changes.
struct WatchView {
    mirror: StateMirror,
    term: Option<String>,
    changes: Rc<RefCell<Vec<StateChange>>>,
}

impl WatchView {
    fn new(term: Option<&str>) -> Self {
        let mut mirror = match ViewCache::default_path() {
            Some(path) => StateMirror::with_hydration(ViewCache::load(&path)),
            None => StateMirror::new(),
        };
        let changes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&changes);
        mirror.on_change(move |change| sink.borrow_mut().push(change.clone()));
        Self {
            mirror,
            term: term.map(str::to_string),
            changes,
        }
    }

    fn load_snapshot(&mut self, transport: &Transport) -> Result<(), CliError> {
        let entities = transport.snapshot()?;
        remember_view(&entities);
        self.mirror.apply_snapshot(&entities);
        self.refilter();
        self.flush();
        Ok(())
    }

    fn apply(&mut self, event: &PushEvent) {
        if let PushEvent::StateChanged { repository, .. } = event {
            let known = self.mirror.ids().iter().any(|id| id == repository);
            self.mirror.apply_push(event);
            if !known {
                self.refilter();
            }
        }
        self.flush();
    }

    fn refilter(&mut self) {
        if let Some(term) = &self.term {
            self.mirror.set_filter(term);
        }
    }

    /// Prints changes to visible rows where the state actually moved.
    fn flush(&mut self) {
        let changes: Vec<StateChange> = self.changes.borrow_mut().drain(..).collect();
        for change in changes {
            if !self.mirror.is_visible(&change.id) || change.from == Some(change.to) {
                continue;
            }
            match change.from {
                Some(from) => println!("{}: {} -> {}", change.id, from, change.to),
                None => println!("{}: {}", change.id, change.to),
            }
        }
    }

    fn print_visible(&self) {
        let visible: Vec<String> = self
            .mirror
            .ids()
            .into_iter()
            .filter(|id| self.mirror.is_visible(id))
            .collect();
        match &self.term {
            Some(term) => println!("Watching {} repositories matching {:?}", visible.len(), term),
            None => println!("Watching {} repositories", visible.len()),
        }
    }
}
