//! Boundary calls into external collaborators: the backend (tokens, message
//! store, quotas) and the host application (page content, patches).
//!
//! Implementations live in the embedding process; the core only calls them.
//! Every call is fallible.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::DocumentView;
use crate::identity::{Notebook, NotebookId};
use crate::patch::Patch;
use crate::protocol::LogicalMessage;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaResource {
    Pages,
    Notebooks,
    Messages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaStatus {
    Ok,
    Exceeded,
}

/// A stored message the notebook has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmarkedMessage {
    pub uuid: Uuid,
    pub operation: String,
}

pub trait Backend: Send {
    fn issue_or_validate_token(
        &mut self,
        notebook: NotebookId,
        token: &str,
    ) -> Result<String, BackendError>;

    /// Store a message for a notebook that is not reachable now. Returns the stored message uuid.
    fn enqueue_message(
        &mut self,
        source: &Notebook,
        target: NotebookId,
        operation: &str,
        payload: &serde_json::Value,
    ) -> Result<Uuid, BackendError>;

    fn fetch_unmarked_messages(
        &mut self,
        notebook: NotebookId,
    ) -> Result<Vec<UnmarkedMessage>, BackendError>;

    fn load_message(&mut self, message: Uuid) -> Result<LogicalMessage, BackendError>;

    fn mark_message_read(&mut self, message: Uuid) -> Result<(), BackendError>;

    fn enforce_quota(
        &mut self,
        notebook: NotebookId,
        resource: QuotaResource,
    ) -> Result<QuotaStatus, BackendError>;
}

pub trait HostApp: Send {
    fn get_current_page_content(&mut self, page: &str) -> Result<DocumentView, HostError>;

    fn apply_patch(&mut self, page: &str, patch: &Patch) -> Result<(), HostError>;

    fn create_local_page(&mut self, page: &str, title: &str) -> Result<(), HostError>;

    fn delete_local_page(&mut self, page: &str) -> Result<(), HostError>;
}
