//! SamePage wire protocol: logical message envelope, operation vocabulary and payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::{OpBatch, Snapshot, VersionVector};
use crate::error::{Error, Result};
use crate::identity::{Notebook, NotebookId};

/// Current protocol version. Used in the direct-link handshake.
pub const PROTOCOL_VERSION: u8 = 1;

pub const AUTHENTICATION: &str = "AUTHENTICATION";
pub const ERROR: &str = "ERROR";
pub const SHARE_PAGE: &str = "SHARE_PAGE";
pub const SHARE_PAGE_RESPONSE: &str = "SHARE_PAGE_RESPONSE";
pub const SHARE_PAGE_UPDATE: &str = "SHARE_PAGE_UPDATE";
pub const REQUEST_PAGE_SYNC: &str = "REQUEST_PAGE_SYNC";
pub const PAGE_SYNC: &str = "PAGE_SYNC";
pub const PAGE_SNAPSHOT: &str = "PAGE_SNAPSHOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseAction {
    Accept,
    Reject,
}

/// Static description of an operation: user-facing title and the responses it requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: &'static str,
    pub title: &'static str,
    pub actions: &'static [ResponseAction],
}

const DESCRIPTORS: &[OperationDescriptor] = &[
    OperationDescriptor {
        name: AUTHENTICATION,
        title: "Authentication",
        actions: &[],
    },
    OperationDescriptor {
        name: ERROR,
        title: "Error",
        actions: &[],
    },
    OperationDescriptor {
        name: SHARE_PAGE,
        title: "Share Page",
        actions: &[ResponseAction::Accept, ResponseAction::Reject],
    },
    OperationDescriptor {
        name: SHARE_PAGE_RESPONSE,
        title: "Share Page Response",
        actions: &[],
    },
    OperationDescriptor {
        name: SHARE_PAGE_UPDATE,
        title: "Shared Page Update",
        actions: &[],
    },
    OperationDescriptor {
        name: REQUEST_PAGE_SYNC,
        title: "Request Page Sync",
        actions: &[],
    },
    OperationDescriptor {
        name: PAGE_SYNC,
        title: "Page Sync",
        actions: &[],
    },
    OperationDescriptor {
        name: PAGE_SNAPSHOT,
        title: "Page Snapshot",
        actions: &[],
    },
];

pub fn descriptor(operation: &str) -> Option<&'static OperationDescriptor> {
    DESCRIPTORS.iter().find(|d| d.name == operation)
}

/// Operations whose delivery creates a pending notification.
pub fn requires_response(operation: &str) -> bool {
    descriptor(operation).is_some_and(|d| !d.actions.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "notebook", rename_all = "camelCase")]
pub enum Target {
    Notebook(NotebookId),
    /// Addressed to the network itself (handshake) rather than one notebook.
    Broadcast,
}

/// One application-level message. Chunked for transport, never sent whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalMessage {
    pub id: Uuid,
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub source: Option<Notebook>,
    pub target: Target,
}

impl LogicalMessage {
    pub fn new(operation: &str, payload: serde_json::Value, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            payload,
            source: None,
            target,
        }
    }

    /// Build a message from a typed payload.
    pub fn with_payload<T: Serialize>(operation: &str, payload: &T, target: Target) -> Result<Self> {
        let value = serde_json::to_value(payload)
            .map_err(|e| Error::MalformedMessage(format!("{}: {}", operation, e)))?;
        Ok(Self::new(operation, value, target))
    }

    pub fn from_notebook(mut self, source: Notebook) -> Self {
        self.source = Some(source);
        self
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::MalformedMessage(format!("{} payload: {}", self.operation, e)))
    }

    pub fn source_notebook(&self) -> Result<&Notebook> {
        self.source
            .as_ref()
            .ok_or_else(|| Error::MalformedMessage(format!("{} without source", self.operation)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub notebook_uuid: NotebookId,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
}

/// Invite to a shared page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePage {
    pub page_uuid: Uuid,
    pub notebook_page_id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePageResponse {
    pub page_uuid: Uuid,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePageUpdate {
    pub page_uuid: Uuid,
    pub batch: OpBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPageSync {
    pub page_uuid: Uuid,
    #[serde(default)]
    pub seen: VersionVector,
    /// Ask for full state instead of missing batches.
    #[serde(default)]
    pub snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSync {
    pub page_uuid: Uuid,
    pub seen: VersionVector,
    #[serde(default)]
    pub batches: Vec<OpBatch>,
    #[serde(default)]
    pub members: Vec<NotebookId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    pub page_uuid: Uuid,
    pub snapshot: Snapshot,
    #[serde(default)]
    pub members: Vec<NotebookId>,
}
