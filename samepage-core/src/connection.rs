//! Connection manager: DISCONNECTED -> PENDING -> CONNECTED session state machine.
//!
//! Owns no socket. Calls return `ConnectionAction`s the caller turns into
//! transport operations and events.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::identity::Credentials;
use crate::protocol::{AuthenticationRequest, AuthenticationResult, LogicalMessage, Target, AUTHENTICATION};

pub const REASON_NETWORK: &str = "Network Disconnected";
pub const REASON_USER: &str = "User Command";
pub const REASON_PENDING_ERROR: &str = "Error during pending connection";
pub const REASON_DISABLED: &str = "Disabled Client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    Pending,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Caller asked to disconnect.
    User,
    /// Transport closed underneath us.
    Network,
    AuthenticationFailed,
    /// Protocol error while pending.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    OpenTransport,
    CloseTransport { reason: String },
    Send(LogicalMessage),
    StatusChanged(ConnectionStatus),
    /// An established (not pending) session ended.
    Lost { reason: String },
    Authenticated,
    AuthenticationFailed { reason: String },
}

pub struct ConnectionManager {
    credentials: Credentials,
    status: ConnectionStatus,
    /// Sends held while PENDING.
    queued: VecDeque<LogicalMessage>,
}

impl ConnectionManager {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            status: ConnectionStatus::Disconnected,
            queued: VecDeque::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn has_token(&self) -> bool {
        !self.credentials.token.is_empty()
    }

    pub fn set_token(&mut self, token: String) {
        self.credentials.token = token;
    }

    /// Start a session. No-op unless DISCONNECTED.
    pub fn connect(&mut self) -> Vec<ConnectionAction> {
        if self.status != ConnectionStatus::Disconnected {
            return Vec::new();
        }
        self.status = ConnectionStatus::Pending;
        vec![
            ConnectionAction::StatusChanged(ConnectionStatus::Pending),
            ConnectionAction::OpenTransport,
        ]
    }

    /// Transport is up: send the handshake.
    pub fn on_transport_open(&mut self) -> Vec<ConnectionAction> {
        if self.status != ConnectionStatus::Pending {
            return Vec::new();
        }
        let request = AuthenticationRequest {
            notebook_uuid: self.credentials.notebook_uuid,
            token: self.credentials.token.clone(),
        };
        match serde_json::to_value(&request) {
            Ok(payload) => vec![ConnectionAction::Send(LogicalMessage::new(
                AUTHENTICATION,
                payload,
                Target::Broadcast,
            ))],
            Err(e) => self.disconnect(&e.to_string(), DisconnectCause::Error),
        }
    }

    pub fn on_authentication(&mut self, result: &AuthenticationResult) -> Vec<ConnectionAction> {
        if self.status != ConnectionStatus::Pending {
            tracing::debug!("authentication result outside pending state ignored");
            return Vec::new();
        }
        if result.success {
            self.status = ConnectionStatus::Connected;
            let mut actions = vec![ConnectionAction::StatusChanged(ConnectionStatus::Connected)];
            actions.extend(self.queued.drain(..).map(ConnectionAction::Send));
            actions.push(ConnectionAction::Authenticated);
            actions
        } else {
            let reason = result
                .reason
                .clone()
                .unwrap_or_else(|| "authentication rejected".to_string());
            let mut actions = self.disconnect(&reason, DisconnectCause::AuthenticationFailed);
            actions.push(ConnectionAction::AuthenticationFailed { reason });
            actions
        }
    }

    /// End the session. Idempotent. `Lost` is emitted only for a session that had
    /// been established; a network drop has no transport left to close.
    pub fn disconnect(&mut self, reason: &str, cause: DisconnectCause) -> Vec<ConnectionAction> {
        if self.status == ConnectionStatus::Disconnected {
            return Vec::new();
        }
        let was_pending = self.status == ConnectionStatus::Pending;
        self.status = ConnectionStatus::Disconnected;
        let mut actions = Vec::new();
        if cause != DisconnectCause::Network {
            actions.push(ConnectionAction::CloseTransport {
                reason: reason.to_string(),
            });
        }
        actions.push(ConnectionAction::StatusChanged(ConnectionStatus::Disconnected));
        if !was_pending {
            actions.push(ConnectionAction::Lost {
                reason: reason.to_string(),
            });
        }
        actions
    }

    /// Route an outbound message by session state.
    /// `Ok(Some)` means send now, `Ok(None)` means queued until authenticated.
    pub fn submit(
        &mut self,
        message: LogicalMessage,
        unauthenticated: bool,
    ) -> Result<Option<LogicalMessage>, ConnectionError> {
        match self.status {
            ConnectionStatus::Connected => Ok(Some(message)),
            ConnectionStatus::Pending if unauthenticated => Ok(Some(message)),
            ConnectionStatus::Pending => {
                self.queued.push_back(message);
                Ok(None)
            }
            ConnectionStatus::Disconnected => Err(ConnectionError::NotConnected),
        }
    }
}
