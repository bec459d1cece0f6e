//! Subscription registry for host-facing events. Delivery is synchronous, in subscription order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::ConnectionStatus;
use crate::page::PendingNotification;
use crate::patch::Patch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Intent {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    ConnectionChanged {
        status: ConnectionStatus,
    },
    /// User-facing log line.
    Log {
        id: String,
        content: String,
        intent: Intent,
    },
    Notification {
        notification: PendingNotification,
    },
    #[serde(rename_all = "camelCase")]
    PagePatched {
        notebook_page_id: String,
        patch: Patch,
    },
    #[serde(rename_all = "camelCase")]
    SyncError {
        page_uuid: Uuid,
        reason: String,
    },
    UnhandledOperation {
        operation: String,
    },
}

/// Returned by `subscribe`; pass to `unsubscribe` to stop delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Listener = Box<dyn FnMut(&Event) + Send>;

pub struct EventBus {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    pub fn emit(&mut self, event: Event) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    pub fn log(&mut self, id: &str, content: impl Into<String>, intent: Intent) {
        self.emit(Event::Log {
            id: id.to_string(),
            content: content.into(),
            intent,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
