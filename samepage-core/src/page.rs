//! Shared-page membership: NotShared -> Invited -> Open -> Closed, plus pending invites.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{Notebook, NotebookId};
use crate::protocol::{self, ResponseAction, SharePage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageState {
    NotShared,
    Invited,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Owner,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberStatus {
    Invited,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub role: Role,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPage {
    pub notebook_page_id: String,
    pub page_uuid: Uuid,
    pub title: String,
    /// Our state for this page. A single field, so a page is never both invited and open.
    pub state: PageState,
    pub members: BTreeMap<NotebookId, Member>,
}

/// An inbound invite waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingNotification {
    pub uuid: Uuid,
    pub operation: String,
    pub title: String,
    pub page_uuid: Uuid,
    pub notebook_page_id: String,
    pub inviter: Notebook,
    /// Stored backend message to mark read once handled.
    #[serde(default)]
    pub message_uuid: Option<Uuid>,
    pub actions: Vec<ResponseAction>,
}

pub struct SharedPages {
    me: NotebookId,
    pages: HashMap<Uuid, SharedPage>,
    by_local: HashMap<String, Uuid>,
    notifications: Vec<PendingNotification>,
}

impl SharedPages {
    pub fn new(me: NotebookId) -> Self {
        Self {
            me,
            pages: HashMap::new(),
            by_local: HashMap::new(),
            notifications: Vec::new(),
        }
    }

    pub fn page(&self, page_uuid: &Uuid) -> Option<&SharedPage> {
        self.pages.get(page_uuid)
    }

    pub fn page_by_local(&self, notebook_page_id: &str) -> Option<&SharedPage> {
        self.by_local
            .get(notebook_page_id)
            .and_then(|uuid| self.pages.get(uuid))
    }

    pub fn resolve(&self, notebook_page_id: &str) -> Result<&SharedPage> {
        self.page_by_local(notebook_page_id)
            .ok_or_else(|| Error::UnknownPage(notebook_page_id.to_string()))
    }

    pub fn state(&self, page_uuid: &Uuid) -> PageState {
        self.pages
            .get(page_uuid)
            .map(|p| p.state)
            .unwrap_or(PageState::NotShared)
    }

    pub fn state_by_local(&self, notebook_page_id: &str) -> PageState {
        self.page_by_local(notebook_page_id)
            .map(|p| p.state)
            .unwrap_or(PageState::NotShared)
    }

    pub fn accepts_edits(&self, page_uuid: &Uuid) -> bool {
        self.state(page_uuid) == PageState::Open
    }

    pub fn open_pages(&self) -> Vec<Uuid> {
        let mut open: Vec<Uuid> = self
            .pages
            .values()
            .filter(|p| p.state == PageState::Open)
            .map(|p| p.page_uuid)
            .collect();
        open.sort();
        open
    }

    /// Other notebooks that have the page open.
    pub fn recipients(&self, page_uuid: &Uuid) -> Vec<NotebookId> {
        self.pages
            .get(page_uuid)
            .map(|p| {
                p.members
                    .iter()
                    .filter(|(id, m)| **id != self.me && m.status == MemberStatus::Open)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All notebooks with the page open, ourselves included.
    pub fn open_members(&self, page_uuid: &Uuid) -> Vec<NotebookId> {
        self.pages
            .get(page_uuid)
            .map(|p| {
                p.members
                    .iter()
                    .filter(|(_, m)| m.status == MemberStatus::Open)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Start sharing a local page. NotShared -> Open; returns the new cross-notebook id.
    pub fn share(&mut self, notebook_page_id: &str, title: &str) -> Result<Uuid> {
        if let Some(existing) = self.page_by_local(notebook_page_id) {
            return match existing.state {
                PageState::Open => Ok(existing.page_uuid),
                other => Err(Error::InvalidState(format!(
                    "page {} is {:?}, cannot share",
                    notebook_page_id, other
                ))),
            };
        }
        let page_uuid = Uuid::new_v4();
        let mut members = BTreeMap::new();
        members.insert(
            self.me,
            Member {
                role: Role::Owner,
                status: MemberStatus::Open,
            },
        );
        self.insert_page(SharedPage {
            notebook_page_id: notebook_page_id.to_string(),
            page_uuid,
            title: title.to_string(),
            state: PageState::Open,
            members,
        });
        Ok(page_uuid)
    }

    pub fn add_invitee(&mut self, page_uuid: &Uuid, notebook: NotebookId) -> Result<()> {
        let page = self.open_page_mut(page_uuid)?;
        page.members.entry(notebook).or_insert(Member {
            role: Role::Member,
            status: MemberStatus::Invited,
        });
        Ok(())
    }

    /// Record an invite. Returns the new notification, or `None` if the page is
    /// already open here or the invite is already pending.
    pub fn receive_invite(
        &mut self,
        inviter: Notebook,
        invite: &SharePage,
        message_uuid: Option<Uuid>,
    ) -> Option<PendingNotification> {
        match self.state(&invite.page_uuid) {
            PageState::NotShared => {}
            PageState::Invited => {
                if let Some(n) = self
                    .notifications
                    .iter_mut()
                    .find(|n| n.page_uuid == invite.page_uuid)
                {
                    if n.message_uuid.is_none() {
                        n.message_uuid = message_uuid;
                    }
                }
                return None;
            }
            state => {
                tracing::debug!(page = %invite.page_uuid, ?state, "invite for known page ignored");
                return None;
            }
        }

        let mut local_id = invite.notebook_page_id.clone();
        if local_id.is_empty() || self.by_local.contains_key(&local_id) {
            local_id = format!("{}-{}", local_id, invite.page_uuid.simple());
        }
        let mut members = BTreeMap::new();
        members.insert(
            inviter.uuid,
            Member {
                role: Role::Owner,
                status: MemberStatus::Open,
            },
        );
        members.insert(
            self.me,
            Member {
                role: Role::Member,
                status: MemberStatus::Invited,
            },
        );
        self.insert_page(SharedPage {
            notebook_page_id: local_id.clone(),
            page_uuid: invite.page_uuid,
            title: invite.title.clone(),
            state: PageState::Invited,
            members,
        });
        let actions = protocol::descriptor(protocol::SHARE_PAGE)
            .map(|d| d.actions.to_vec())
            .unwrap_or_default();
        let notification = PendingNotification {
            uuid: Uuid::new_v4(),
            operation: protocol::SHARE_PAGE.to_string(),
            title: invite.title.clone(),
            page_uuid: invite.page_uuid,
            notebook_page_id: local_id,
            inviter,
            message_uuid,
            actions,
        };
        self.notifications.push(notification.clone());
        Some(notification)
    }

    pub fn notifications(&self) -> &[PendingNotification] {
        &self.notifications
    }

    pub fn notification(&self, uuid: &Uuid) -> Option<&PendingNotification> {
        self.notifications.iter().find(|n| n.uuid == *uuid)
    }

    /// Invited -> Open. Consumes the notification.
    pub fn accept(&mut self, notification: &Uuid) -> Result<PendingNotification> {
        let n = self.take_notification(notification)?;
        let me = self.me;
        let page = self
            .pages
            .get_mut(&n.page_uuid)
            .ok_or_else(|| Error::UnknownPage(n.page_uuid.to_string()))?;
        page.state = PageState::Open;
        if let Some(m) = page.members.get_mut(&me) {
            m.status = MemberStatus::Open;
        }
        Ok(n)
    }

    /// Invited -> NotShared. Consumes the notification.
    pub fn reject(&mut self, notification: &Uuid) -> Result<PendingNotification> {
        let n = self.take_notification(notification)?;
        self.forget(&n.page_uuid);
        Ok(n)
    }

    /// Read acknowledgment: drop the notification; an unanswered invite is dismissed.
    pub fn mark_read(&mut self, notification: &Uuid) -> Result<PendingNotification> {
        let n = self.take_notification(notification)?;
        if self.state(&n.page_uuid) == PageState::Invited {
            self.forget(&n.page_uuid);
        }
        Ok(n)
    }

    /// Open -> Closed locally.
    pub fn close(&mut self, page_uuid: &Uuid) -> Result<()> {
        let me = self.me;
        let page = self.open_page_mut(page_uuid)?;
        page.state = PageState::Closed;
        if let Some(m) = page.members.get_mut(&me) {
            m.status = MemberStatus::Closed;
        }
        Ok(())
    }

    /// Forget a page entirely. Any state -> NotShared.
    pub fn remove(&mut self, page_uuid: &Uuid) -> Result<SharedPage> {
        self.notifications.retain(|n| n.page_uuid != *page_uuid);
        self.forget(page_uuid)
            .ok_or_else(|| Error::UnknownPage(page_uuid.to_string()))
    }

    /// Invitee answered. Accepted members become open; rejected ones are dropped.
    pub fn on_response(&mut self, page_uuid: &Uuid, from: NotebookId, accepted: bool) {
        let Some(page) = self.pages.get_mut(page_uuid) else {
            return;
        };
        if accepted {
            page.members
                .entry(from)
                .and_modify(|m| m.status = MemberStatus::Open)
                .or_insert(Member {
                    role: Role::Member,
                    status: MemberStatus::Open,
                });
        } else {
            page.members.remove(&from);
        }
    }

    /// Note that `notebook` has the page open (learned from sync traffic).
    pub fn learn_member(&mut self, page_uuid: &Uuid, notebook: NotebookId) {
        if notebook == self.me {
            return;
        }
        if let Some(page) = self.pages.get_mut(page_uuid) {
            page.members
                .entry(notebook)
                .and_modify(|m| m.status = MemberStatus::Open)
                .or_insert(Member {
                    role: Role::Member,
                    status: MemberStatus::Open,
                });
        }
    }

    fn insert_page(&mut self, page: SharedPage) {
        self.by_local
            .insert(page.notebook_page_id.clone(), page.page_uuid);
        self.pages.insert(page.page_uuid, page);
    }

    fn forget(&mut self, page_uuid: &Uuid) -> Option<SharedPage> {
        let page = self.pages.remove(page_uuid)?;
        self.by_local.remove(&page.notebook_page_id);
        Some(page)
    }

    fn take_notification(&mut self, uuid: &Uuid) -> Result<PendingNotification> {
        let pos = self
            .notifications
            .iter()
            .position(|n| n.uuid == *uuid)
            .ok_or_else(|| Error::InvalidState(format!("no pending notification {}", uuid)))?;
        Ok(self.notifications.remove(pos))
    }

    fn open_page_mut(&mut self, page_uuid: &Uuid) -> Result<&mut SharedPage> {
        let page = self
            .pages
            .get_mut(page_uuid)
            .ok_or_else(|| Error::UnknownPage(page_uuid.to_string()))?;
        if page.state != PageState::Open {
            return Err(Error::InvalidState(format!(
                "page {} is {:?}",
                page.notebook_page_id, page.state
            )));
        }
        Ok(page)
    }
}
