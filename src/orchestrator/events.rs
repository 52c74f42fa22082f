//! Asynchronous event dispatch (§4.9).
//!
//! Gate connections forward frames whose type is in the event subset
//! (`FileChanged`/`DirectoryChanged`) onto a shared channel; `EventRouter`
//! owns the receiving end, matches each arrival against handlers
//! registered for the originating host, every group the host belongs to,
//! and any generic `on_event` callback, then invokes them in that order.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::MessageType;

/// A registered event callback.
pub type EventCallback = Box<dyn Fn(&str, MessageType, &Value) + Send + Sync>;

struct Registration {
    target: String,
    event_type: Option<MessageType>,
    callback: EventCallback,
}

/// Dispatches forwarded gate events to registered handlers.
pub struct EventRouter {
    registrations: Vec<Registration>,
    generic: Vec<EventCallback>,
    events_rx: mpsc::UnboundedReceiver<(String, MessageType, Value)>,
}

impl EventRouter {
    /// Construct a router around the receiving half of the channel every
    /// `GateLifecycle::get_or_create` call is handed as its `EventSender`.
    #[must_use]
    pub fn new(events_rx: mpsc::UnboundedReceiver<(String, MessageType, Value)>) -> Self {
        Self {
            registrations: Vec::new(),
            generic: Vec::new(),
            events_rx,
        }
    }

    /// Register a handler for events from `target` (a host or group
    /// name), optionally filtered to one event type.
    pub fn register(&mut self, target: impl Into<String>, event_type: Option<MessageType>, callback: EventCallback) {
        self.registrations.push(Registration {
            target: target.into(),
            event_type,
            callback,
        });
    }

    /// Register a callback invoked for every event regardless of target.
    pub fn on_event(&mut self, callback: EventCallback) {
        self.generic.push(callback);
    }

    /// Dispatch one event to every handler whose target is `host` or one
    /// of `groups`, plus every generic callback.
    pub fn dispatch(&self, host: &str, groups: &[String], message_type: MessageType, data: &Value) {
        for reg in &self.registrations {
            if let Some(filter) = reg.event_type {
                if filter != message_type {
                    continue;
                }
            }
            if reg.target == host || groups.iter().any(|g| g == &reg.target) {
                (reg.callback)(host, message_type, data);
            }
        }
        for callback in &self.generic {
            callback(host, message_type, data);
        }
    }

    /// Drain events as they arrive for up to `timeout_duration`, dispatching
    /// each one. `groups_of` resolves a host to the groups it belongs to at
    /// dispatch time. Returns once no event arrives within the timeout.
    pub async fn listen(&mut self, timeout_duration: Duration, groups_of: impl Fn(&str) -> Vec<String>) {
        loop {
            match timeout(timeout_duration, self.events_rx.recv()).await {
                Ok(Some((host, message_type, data))) => {
                    let groups = groups_of(&host);
                    self.dispatch(&host, &groups, message_type, &data);
                }
                Ok(None) => {
                    debug!("event channel closed, stopping listen loop");
                    return;
                }
                Err(_) => return,
            }
        }
    }
}
