//! Client side of plugin-sync: a request transport, an owned push channel
//! with reconnection, a local state mirror, and an action runner with
//! bounded retry.
//!
//! Everything here is a viewer. The daemon holds authoritative state; the
//! mirror only ever reflects what the daemon reported.

pub mod error;
pub mod mirror;
pub mod push;
pub mod reconnect;
pub mod retry;
pub mod transport;

pub use error::{ClientError, Result};
pub use mirror::{ClientFilterState, HydrationSource, ListenerId, StateChange, StateMirror};
pub use push::{ChannelMessage, PushChannel};
pub use reconnect::{ConnectionStatus, ReconnectManager};
pub use retry::{ActionOutcome, ActionRunner};
pub use transport::{ActionExecutor, Transport};
