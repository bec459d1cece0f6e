//! Notebook identity: uuid, host application, workspace label.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notebook ID: uuid issued by the backend. Also the CRDT actor id, so it must be totally ordered.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotebookId(Uuid);

impl NotebookId {
    /// Generate a random notebook ID (tests and local onboarding).
    pub fn new_v4() -> Self {
        NotebookId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        NotebookId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NotebookId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for NotebookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Host application a notebook lives in. Wire form is the numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum AppId {
    Roam,
    LogSeq,
    Obsidian,
    Other(u8),
}

impl AppId {
    pub fn name(&self) -> &'static str {
        match self {
            AppId::Roam => "Roam",
            AppId::LogSeq => "LogSeq",
            AppId::Obsidian => "Obsidian",
            AppId::Other(_) => "Unknown",
        }
    }
}

impl From<u8> for AppId {
    fn from(id: u8) -> Self {
        match id {
            1 => AppId::Roam,
            2 => AppId::LogSeq,
            3 => AppId::Obsidian,
            other => AppId::Other(other),
        }
    }
}

impl From<AppId> for u8 {
    fn from(app: AppId) -> u8 {
        match app {
            AppId::Roam => 1,
            AppId::LogSeq => 2,
            AppId::Obsidian => 3,
            AppId::Other(other) => other,
        }
    }
}

/// One workspace inside one host application. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notebook {
    pub uuid: NotebookId,
    pub app: AppId,
    pub workspace: String,
}

impl Notebook {
    pub fn new(uuid: NotebookId, app: AppId, workspace: impl Into<String>) -> Self {
        Self {
            uuid,
            app,
            workspace: workspace.into(),
        }
    }

    /// Human-readable label, e.g. "Obsidian/notes".
    pub fn label(&self) -> String {
        format!("{}/{}", self.app.name(), self.workspace)
    }
}

/// Previously issued handshake credentials for this notebook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub notebook_uuid: NotebookId,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_id_numeric_mapping() {
        assert_eq!(AppId::from(1), AppId::Roam);
        assert_eq!(AppId::from(3), AppId::Obsidian);
        assert_eq!(AppId::from(9), AppId::Other(9));
        assert_eq!(u8::from(AppId::LogSeq), 2);
        assert_eq!(u8::from(AppId::Other(42)), 42);
    }

    #[test]
    fn notebook_serializes_camel_case_with_numeric_app() {
        let nb = Notebook::new(NotebookId::new_v4(), AppId::Obsidian, "vault");
        let json = serde_json::to_value(&nb).unwrap();
        assert_eq!(json["app"], 3);
        assert_eq!(json["workspace"], "vault");
        assert_eq!(json["uuid"], nb.uuid.to_string());
        let back: Notebook = serde_json::from_value(json).unwrap();
        assert_eq!(back, nb);
    }

    #[test]
    fn notebook_id_bytes_roundtrip() {
        let id = NotebookId::new_v4();
        assert_eq!(NotebookId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn label_uses_app_name() {
        let nb = Notebook::new(NotebookId::new_v4(), AppId::Roam, "team");
        assert_eq!(nb.label(), "Roam/team");
    }
}
