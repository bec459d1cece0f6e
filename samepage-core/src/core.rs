//! Main core: the host feeds transport, timer and user events in and drains
//! `OutboundAction`s out. Backend and host-application calls go through the
//! `Backend` and `HostApp` traits.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use uuid::Uuid;

use crate::boundary::{Backend, HostApp, QuotaResource, QuotaStatus};
use crate::chunk::{self, Frame, Ingest, Reassembler};
use crate::config::Config;
use crate::connection::{
    ConnectionAction, ConnectionManager, ConnectionStatus, DisconnectCause, REASON_DISABLED,
    REASON_NETWORK, REASON_PENDING_ERROR, REASON_USER,
};
use crate::crdt::{DocumentView, MergeOutcome, OpBatch, RangeAnnotation};
use crate::dispatch::{Dispatched, Dispatcher, Handler};
use crate::engine::{DocumentEngine, LocalEdit};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{Event, EventBus, Intent, Listener, SubscriptionId};
use crate::identity::{Credentials, Notebook, NotebookId};
use crate::integrity::{RepairTracker, RepairVerdict};
use crate::p2p::{P2pRouter, Route};
use crate::page::{PageState, PendingNotification, SharedPages};
use crate::protocol::{
    self, AuthenticationResult, ErrorPayload, LogicalMessage, PageSnapshot, PageSync,
    RequestPageSync, SharePage, SharePageResponse, SharePageUpdate, Target, AUTHENTICATION, ERROR,
    PAGE_SNAPSHOT, PAGE_SYNC, REQUEST_PAGE_SYNC, SHARE_PAGE, SHARE_PAGE_RESPONSE,
    SHARE_PAGE_UPDATE,
};

/// Where a frame came from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The relay connection.
    Primary,
    Direct(NotebookId),
}

/// Action for the host to perform (send frames, open or close the relay socket).
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    OpenTransport,
    CloseTransport {
        reason: String,
    },
    SendPrimary {
        target: Target,
        frames: Vec<Frame>,
    },
    /// Report `on_direct_delivered(message_id)` once written, or `on_direct_send_failed(peer)`.
    SendDirect {
        peer: NotebookId,
        message_id: Uuid,
        frames: Vec<Frame>,
    },
}

/// State handlers operate on. Custom handlers registered with
/// `SamePageCore::register` receive it as their context.
pub struct Session {
    config: Config,
    notebook: Notebook,
    connection: ConnectionManager,
    pages: SharedPages,
    engine: DocumentEngine,
    router: P2pRouter,
    repairs: RepairTracker,
    /// Pages waiting on a snapshot to repair divergence.
    repairing: HashSet<Uuid>,
    backend: Box<dyn Backend>,
    host: Box<dyn HostApp>,
    events: EventBus,
    actions: Vec<OutboundAction>,
    resync_pending: HashSet<Uuid>,
    resync_deadline: Option<u64>,
    settled: bool,
    just_authenticated: bool,
    tick: u64,
}

impl Session {
    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn emit(&mut self, event: Event) {
        self.events.emit(event);
    }

    pub fn log(&mut self, id: &str, content: impl Into<String>, intent: Intent) {
        self.events.log(id, content, intent);
    }

    /// Send a typed payload to one notebook, over a direct link when one is up.
    pub fn send_to<T: Serialize>(
        &mut self,
        target: NotebookId,
        operation: &str,
        payload: &T,
    ) -> Result<()> {
        let message = LogicalMessage::with_payload(operation, payload, Target::Notebook(target))?;
        self.send(message)
    }

    fn send(&mut self, message: LogicalMessage) -> Result<()> {
        let message = message.from_notebook(self.notebook.clone());
        match self.router.route(&message.target) {
            Route::Direct(peer) => {
                let frames = chunk::encode(&message, self.config.max_frame_size)?;
                let message_id = message.id;
                self.router.track(peer, message);
                self.actions.push(OutboundAction::SendDirect {
                    peer,
                    message_id,
                    frames,
                });
                Ok(())
            }
            Route::Primary => self.send_primary(message, false),
        }
    }

    fn send_primary(&mut self, message: LogicalMessage, unauthenticated: bool) -> Result<()> {
        if let Some(message) = self.connection.submit(message, unauthenticated)? {
            self.push_primary(&message)?;
        }
        Ok(())
    }

    fn push_primary(&mut self, message: &LogicalMessage) -> Result<()> {
        let frames = chunk::encode(message, self.config.max_frame_size)?;
        self.actions.push(OutboundAction::SendPrimary {
            target: message.target,
            frames,
        });
        Ok(())
    }

    /// Send live if possible, otherwise store it with the backend for later delivery.
    fn send_or_store<T: Serialize>(
        &mut self,
        target: NotebookId,
        operation: &str,
        payload: &T,
    ) -> Result<()> {
        let message = LogicalMessage::with_payload(operation, payload, Target::Notebook(target))?;
        let stored = message.payload.clone();
        match self.send(message) {
            Err(Error::NotConnected) => {
                self.backend
                    .enqueue_message(&self.notebook, target, operation, &stored)?;
                Ok(())
            }
            other => other,
        }
    }

    /// Re-send a message a direct link gave back.
    fn reroute(&mut self, message: LogicalMessage) {
        let operation = message.operation.clone();
        let target = message.target;
        let payload = message.payload.clone();
        match self.send_primary(message, false) {
            Ok(()) => {}
            Err(Error::NotConnected) => {
                if let Target::Notebook(peer) = target {
                    if let Err(e) = self
                        .backend
                        .enqueue_message(&self.notebook, peer, &operation, &payload)
                    {
                        tracing::warn!(%operation, error = %e, "could not store rerouted message");
                    }
                }
            }
            Err(e) => tracing::warn!(%operation, error = %e, "could not reroute message"),
        }
    }

    fn apply_connection(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::OpenTransport => self.actions.push(OutboundAction::OpenTransport),
                ConnectionAction::CloseTransport { reason } => {
                    self.actions.push(OutboundAction::CloseTransport { reason })
                }
                ConnectionAction::Send(message) => {
                    if let Err(e) = self.push_primary(&message) {
                        tracing::warn!(operation = %message.operation, error = %e, "dropping unencodable message");
                    }
                }
                ConnectionAction::StatusChanged(status) => {
                    tracing::info!(?status, "connection status");
                    if status == ConnectionStatus::Disconnected {
                        self.resync_pending.clear();
                        self.resync_deadline = None;
                    }
                    self.events.emit(Event::ConnectionChanged { status });
                }
                ConnectionAction::Lost { reason } => self.events.log(
                    "samepage-disconnect",
                    format!("Disconnected from SamePage Network: {}", reason),
                    Intent::Warning,
                ),
                ConnectionAction::Authenticated => self.just_authenticated = true,
                ConnectionAction::AuthenticationFailed { reason } => {
                    self.report_auth_failure(&Error::AuthenticationFailed(reason))
                }
            }
        }
    }

    fn report_auth_failure(&mut self, error: &Error) {
        tracing::warn!(kind = ?error.kind(), reason = %error.reason(), "authentication failed");
        self.events.log("samepage-failure", error.reason(), Intent::Error);
    }

    fn disconnect(&mut self, reason: &str, cause: DisconnectCause) {
        let actions = self.connection.disconnect(reason, cause);
        self.apply_connection(actions);
    }

    fn check_quota(&mut self, resource: QuotaResource) -> Result<()> {
        match self.backend.enforce_quota(self.notebook.uuid, resource)? {
            QuotaStatus::Ok => Ok(()),
            QuotaStatus::Exceeded => Err(Error::QuotaExceeded(match resource {
                QuotaResource::Pages => "shared page limit reached".to_string(),
                QuotaResource::Notebooks => "notebook limit reached".to_string(),
                QuotaResource::Messages => "message limit reached".to_string(),
            })),
        }
    }

    fn mark_message_read(&mut self, message: Option<Uuid>) {
        if let Some(id) = message {
            if let Err(e) = self.backend.mark_message_read(id) {
                tracing::warn!(message = %id, error = %e, "could not mark message read");
            }
        }
    }

    /// Page accepting local edits: open here and replicated.
    fn open_page(&self, notebook_page_id: &str) -> Result<Uuid> {
        let page = self.pages.resolve(notebook_page_id)?;
        if page.state != PageState::Open {
            return Err(Error::InvalidState(format!(
                "page {} is not open",
                notebook_page_id
            )));
        }
        if !self.engine.has_page(&page.page_uuid) {
            return Err(Error::InvalidState(format!(
                "page {} is waiting for its first sync",
                notebook_page_id
            )));
        }
        Ok(page.page_uuid)
    }

    fn invite(&mut self, page: Uuid, target: NotebookId) -> Result<()> {
        self.check_quota(QuotaResource::Notebooks)?;
        self.pages.add_invitee(&page, target)?;
        let shared = self
            .pages
            .page(&page)
            .ok_or_else(|| Error::UnknownPage(page.to_string()))?;
        let invite = SharePage {
            page_uuid: page,
            notebook_page_id: shared.notebook_page_id.clone(),
            title: shared.title.clone(),
        };
        let payload = serde_json::to_value(&invite)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        // Always stored: the backend delivers it live when the target is online.
        self.backend
            .enqueue_message(&self.notebook, target, SHARE_PAGE, &payload)?;
        tracing::info!(page = %page, %target, "invite sent");
        Ok(())
    }

    fn local_edit(&mut self, notebook_page_id: &str, edit: LocalEdit) -> Result<()> {
        let page = self.open_page(notebook_page_id)?;
        let batch = if self.config.granular_changes {
            self.engine.apply_local_edit(&page, &edit)?
        } else {
            let content = self.host.get_current_page_content(notebook_page_id)?;
            self.engine.refresh(&page, &content)?
        };
        if let Some(batch) = batch {
            self.broadcast_update(page, batch);
        }
        Ok(())
    }

    fn broadcast_update(&mut self, page: Uuid, batch: OpBatch) {
        let update = SharePageUpdate {
            page_uuid: page,
            batch,
        };
        for peer in self.pages.recipients(&page) {
            match self.send_to(peer, SHARE_PAGE_UPDATE, &update) {
                Ok(()) => {}
                Err(Error::NotConnected) => {
                    tracing::debug!(page = %page, %peer, "offline, update held for resync")
                }
                Err(e) => tracing::warn!(page = %page, %peer, error = %e, "update not sent"),
            }
        }
    }

    /// Bring the host page up to the replica. A failed apply leaves the rendered
    /// view where it was so the next patch covers both.
    fn render(&mut self, page: &Uuid) {
        let Some(notebook_page_id) = self.pages.page(page).map(|p| p.notebook_page_id.clone())
        else {
            return;
        };
        let patch = match self.engine.compute_local_patch(page) {
            Ok(Some(patch)) => patch,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(page = %page, error = %e, "no patch computed");
                return;
            }
        };
        match self.host.apply_patch(&notebook_page_id, &patch) {
            Ok(()) => {
                if let Err(e) = self.engine.acknowledge_patch(page) {
                    tracing::warn!(page = %page, error = %e, "patch not acknowledged");
                }
                self.events.emit(Event::PagePatched {
                    notebook_page_id,
                    patch,
                });
            }
            Err(e) => {
                tracing::warn!(page = %page, error = %e, "host rejected patch");
                self.events.log(
                    "update-failure",
                    format!("Failed to apply update to {}: {}", notebook_page_id, e),
                    Intent::Error,
                );
            }
        }
    }

    /// Open here with a replica; otherwise inbound sync traffic is dropped.
    fn accepts_remote(&self, page: &Uuid) -> bool {
        if !self.pages.accepts_edits(page) {
            tracing::debug!(page = %page, state = ?self.pages.state(page), "discarding traffic for page that is not open");
            return false;
        }
        if !self.engine.has_page(page) {
            tracing::debug!(page = %page, "discarding traffic for page awaiting its snapshot");
            return false;
        }
        true
    }

    /// Merge in order, stopping at the first gap.
    fn merge_batches(&mut self, page: Uuid, from: NotebookId, batches: &[OpBatch]) {
        let mut changed = false;
        for batch in batches {
            match self.engine.merge_remote(&page, batch) {
                Ok(MergeOutcome::Applied) => changed = true,
                Ok(MergeOutcome::Duplicate) => {}
                Err(e) if e.kind() == ErrorKind::DivergenceDetected => {
                    if !self.repairing.contains(&page) {
                        tracing::warn!(page = %page, error = %e, "requesting snapshot");
                        self.request_repair(page, from);
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(page = %page, error = %e, "merge failed");
                    break;
                }
            }
        }
        if changed {
            self.render(&page);
        }
    }

    fn request_repair(&mut self, page: Uuid, from: NotebookId) {
        self.repairing.insert(page);
        let request = RequestPageSync {
            page_uuid: page,
            seen: self.engine.seen(&page).unwrap_or_default(),
            snapshot: true,
        };
        if let Err(e) = self.send_to(from, REQUEST_PAGE_SYNC, &request) {
            tracing::debug!(page = %page, error = %e, "repair deferred to next connection");
        }
    }

    /// A new member asks the others directly, so they learn of it and send
    /// what the seeding snapshot missed.
    fn introduce(&mut self, page: Uuid, seeded_from: NotebookId) {
        let request = RequestPageSync {
            page_uuid: page,
            seen: self.engine.seen(&page).unwrap_or_default(),
            snapshot: false,
        };
        for peer in self.pages.recipients(&page) {
            if peer == seeded_from {
                continue;
            }
            if let Err(e) = self.send_to(peer, REQUEST_PAGE_SYNC, &request) {
                tracing::debug!(page = %page, %peer, error = %e, "introduction not sent");
            }
        }
    }

    fn repair_failed(&mut self, page: Uuid, from: NotebookId, cause: Error) {
        self.repairing.remove(&page);
        match self.repairs.record_failure(page) {
            RepairVerdict::Retry => {
                tracing::warn!(page = %page, error = %cause, "repair failed, retrying");
                self.request_repair(page, from);
            }
            RepairVerdict::Unresolved => {
                let e = Error::UnresolvedSync {
                    page,
                    reason: cause.reason(),
                };
                tracing::error!(error = %e, "giving up on repair");
                self.events.emit(Event::SyncError {
                    page_uuid: page,
                    reason: e.reason(),
                });
                self.events.log("sync-failure", e.reason(), Intent::Error);
            }
        }
    }

    /// Ask every open page's peers for what we missed while away.
    fn start_resync(&mut self) {
        if !self.connection.is_connected() {
            return;
        }
        self.resync_pending.clear();
        self.settled = false;
        self.resync_deadline = Some(self.tick + self.config.resync_timeout_ticks);
        for page in self.pages.open_pages() {
            let peers = self.pages.recipients(&page);
            if peers.is_empty() {
                continue;
            }
            let request = RequestPageSync {
                page_uuid: page,
                seen: self.engine.seen(&page).unwrap_or_default(),
                snapshot: !self.engine.has_page(&page) || self.repairing.contains(&page),
            };
            let mut sent = false;
            for peer in peers {
                match self.send_to(peer, REQUEST_PAGE_SYNC, &request) {
                    Ok(()) => sent = true,
                    Err(e) => tracing::warn!(page = %page, %peer, error = %e, "resync request not sent"),
                }
            }
            if sent {
                self.resync_pending.insert(page);
            }
        }
        tracing::debug!(pages = self.resync_pending.len(), "resync started");
        self.check_settled();
    }

    fn settle(&mut self, page: &Uuid) {
        if self.resync_pending.remove(page) {
            self.check_settled();
        }
    }

    fn check_settled(&mut self) {
        if self.settled || !self.resync_pending.is_empty() || !self.connection.is_connected() {
            return;
        }
        self.settled = true;
        self.resync_deadline = None;
        self.events.log(
            "samepage-success",
            "Successfully connected to SamePage Network!",
            Intent::Success,
        );
    }

    fn check_resync_deadline(&mut self) {
        let Some(deadline) = self.resync_deadline else {
            return;
        };
        if self.tick >= deadline && !self.resync_pending.is_empty() {
            tracing::info!(unanswered = self.resync_pending.len(), "resync timed out");
            self.resync_pending.clear();
            self.check_settled();
        }
    }

    fn on_authentication(&mut self, message: &LogicalMessage) -> Result<()> {
        let result: AuthenticationResult = message.payload_as()?;
        let actions = self.connection.on_authentication(&result);
        self.apply_connection(actions);
        Ok(())
    }

    fn on_error(&mut self, message: &LogicalMessage) -> Result<()> {
        let error: ErrorPayload = message.payload_as()?;
        tracing::warn!(message = %error.message, "network error");
        self.events.log("samepage-error", error.message, Intent::Error);
        if self.connection.status() == ConnectionStatus::Pending {
            self.disconnect(REASON_PENDING_ERROR, DisconnectCause::Error);
        }
        Ok(())
    }

    fn on_share_page(&mut self, message: &LogicalMessage) -> Result<()> {
        let inviter = message.source_notebook()?.clone();
        let invite: SharePage = message.payload_as()?;
        if let Some(notification) = self.pages.receive_invite(inviter, &invite, Some(message.id)) {
            self.events.emit(Event::Notification { notification });
        }
        Ok(())
    }

    fn on_share_page_response(&mut self, message: &LogicalMessage) -> Result<()> {
        let from = message.source_notebook()?;
        let response: SharePageResponse = message.payload_as()?;
        self.pages
            .on_response(&response.page_uuid, from.uuid, response.accepted);
        let label = from.label();
        if response.accepted {
            self.events.log(
                "share-page-accepted",
                format!("{} accepted the shared page", label),
                Intent::Info,
            );
        } else {
            self.events.log(
                "share-page-rejected",
                format!("{} rejected the shared page", label),
                Intent::Warning,
            );
        }
        Ok(())
    }

    fn on_share_page_update(&mut self, message: &LogicalMessage) -> Result<()> {
        let from = message.source_notebook()?.uuid;
        let update: SharePageUpdate = message.payload_as()?;
        let page = update.page_uuid;
        if !self.accepts_remote(&page) {
            return Ok(());
        }
        self.pages.learn_member(&page, from);
        self.merge_batches(page, from, std::slice::from_ref(&update.batch));
        Ok(())
    }

    fn on_request_page_sync(&mut self, message: &LogicalMessage) -> Result<()> {
        let from = message.source_notebook()?.uuid;
        let request: RequestPageSync = message.payload_as()?;
        let page = request.page_uuid;
        if !self.accepts_remote(&page) {
            return Ok(());
        }
        self.pages.learn_member(&page, from);
        let members = self.pages.open_members(&page);
        let missing = if request.snapshot {
            None
        } else {
            self.engine.missing_for(&page, &request.seen)?
        };
        match missing {
            Some(batches) => {
                let sync = PageSync {
                    page_uuid: page,
                    seen: self.engine.seen(&page).unwrap_or_default(),
                    batches,
                    members,
                };
                self.send_to(from, PAGE_SYNC, &sync)
            }
            None => {
                let snapshot = PageSnapshot {
                    page_uuid: page,
                    snapshot: self.engine.snapshot(&page)?,
                    members,
                };
                self.send_to(from, PAGE_SNAPSHOT, &snapshot)
            }
        }
    }

    fn on_page_sync(&mut self, message: &LogicalMessage) -> Result<()> {
        let from = message.source_notebook()?.uuid;
        let sync: PageSync = message.payload_as()?;
        let page = sync.page_uuid;
        if !self.accepts_remote(&page) {
            self.settle(&page);
            return Ok(());
        }
        self.pages.learn_member(&page, from);
        for member in &sync.members {
            self.pages.learn_member(&page, *member);
        }
        self.merge_batches(page, from, &sync.batches);

        // Send back whatever the peer lacks; an empty answer ends the exchange.
        let result = match self.engine.missing_for(&page, &sync.seen)? {
            Some(batches) if batches.is_empty() => Ok(()),
            Some(batches) => {
                let reply = PageSync {
                    page_uuid: page,
                    seen: self.engine.seen(&page).unwrap_or_default(),
                    batches,
                    members: self.pages.open_members(&page),
                };
                self.send_to(from, PAGE_SYNC, &reply)
            }
            None => {
                let reply = PageSnapshot {
                    page_uuid: page,
                    snapshot: self.engine.snapshot(&page)?,
                    members: self.pages.open_members(&page),
                };
                self.send_to(from, PAGE_SNAPSHOT, &reply)
            }
        };
        self.settle(&page);
        result
    }

    fn on_page_snapshot(&mut self, message: &LogicalMessage) -> Result<()> {
        let from = message.source_notebook()?.uuid;
        let snapshot: PageSnapshot = message.payload_as()?;
        let page = snapshot.page_uuid;
        if !self.pages.accepts_edits(&page) {
            tracing::debug!(page = %page, "discarding snapshot for page that is not open");
            return Ok(());
        }
        self.pages.learn_member(&page, from);
        for member in &snapshot.members {
            self.pages.learn_member(&page, *member);
        }
        let seeding = !self.engine.has_page(&page);
        let result = if seeding {
            self.engine
                .seed_from_snapshot(page, snapshot.snapshot)
                .map(|()| Vec::new())
        } else {
            self.engine.repair(&page, snapshot.snapshot)
        };
        match result {
            Ok(replayed) => {
                self.repairing.remove(&page);
                self.repairs.record_success(&page);
                for batch in replayed {
                    self.broadcast_update(page, batch);
                }
                self.render(&page);
                if seeding {
                    self.introduce(page, from);
                    let local = self
                        .pages
                        .page(&page)
                        .map(|p| p.notebook_page_id.clone())
                        .unwrap_or_default();
                    self.events.log(
                        "init-page-success",
                        format!("Successfully initialized shared page {}", local),
                        Intent::Success,
                    );
                }
            }
            Err(e) => self.repair_failed(page, from, e),
        }
        self.settle(&page);
        Ok(())
    }
}

type BuiltinHandler = fn(&mut Session, &LogicalMessage) -> Result<()>;

pub struct SamePageCore {
    dispatcher: Dispatcher<Session>,
    session: Session,
    reassemblers: HashMap<Channel, Reassembler>,
}

impl SamePageCore {
    /// An empty `token` is issued by the backend on first `connect`.
    pub fn new(
        config: Config,
        notebook: Notebook,
        token: impl Into<String>,
        backend: Box<dyn Backend>,
        host: Box<dyn HostApp>,
    ) -> Result<Self> {
        let credentials = Credentials {
            notebook_uuid: notebook.uuid,
            token: token.into(),
        };
        let session = Session {
            connection: ConnectionManager::new(credentials),
            pages: SharedPages::new(notebook.uuid),
            engine: DocumentEngine::new(notebook.uuid),
            router: P2pRouter::new(config.max_direct_in_flight),
            repairs: RepairTracker::new(config.repair_failure_threshold),
            repairing: HashSet::new(),
            backend,
            host,
            events: EventBus::new(),
            actions: Vec::new(),
            resync_pending: HashSet::new(),
            resync_deadline: None,
            settled: false,
            just_authenticated: false,
            tick: 0,
            notebook,
            config,
        };
        let mut core = Self {
            dispatcher: Dispatcher::new(),
            session,
            reassemblers: HashMap::new(),
        };
        let builtin: [(&str, BuiltinHandler); 8] = [
            (AUTHENTICATION, Session::on_authentication),
            (ERROR, Session::on_error),
            (SHARE_PAGE, Session::on_share_page),
            (SHARE_PAGE_RESPONSE, Session::on_share_page_response),
            (SHARE_PAGE_UPDATE, Session::on_share_page_update),
            (REQUEST_PAGE_SYNC, Session::on_request_page_sync),
            (PAGE_SYNC, Session::on_page_sync),
            (PAGE_SNAPSHOT, Session::on_page_snapshot),
        ];
        for (operation, handler) in builtin {
            core.dispatcher.register(operation, Box::new(handler))?;
        }
        Ok(core)
    }

    pub fn notebook(&self) -> &Notebook {
        &self.session.notebook
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.connection.status()
    }

    /// Peers with a usable direct link, sorted.
    pub fn direct_peers(&self) -> Vec<NotebookId> {
        self.session.router.peers()
    }

    /// Direct sends not yet confirmed by the transport.
    pub fn direct_in_flight(&self) -> usize {
        self.session.router.in_flight()
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        self.session.events.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.session.events.unsubscribe(id)
    }

    pub fn register(&mut self, operation: &str, handler: Handler<Session>) -> Result<()> {
        Ok(self.dispatcher.register(operation, handler)?)
    }

    pub fn unregister(&mut self, operation: &str) -> bool {
        self.dispatcher.unregister(operation)
    }

    /// Drain actions queued by user operations.
    pub fn take_actions(&mut self) -> Vec<OutboundAction> {
        std::mem::take(&mut self.session.actions)
    }

    pub fn connect(&mut self) -> Vec<OutboundAction> {
        self.try_connect().unwrap_or_else(|_| self.take_actions())
    }

    /// Like `connect`, but a token the backend refuses to issue is returned
    /// as `AuthenticationFailed` as well as logged.
    pub fn try_connect(&mut self) -> Result<Vec<OutboundAction>> {
        let s = &mut self.session;
        if s.connection.status() == ConnectionStatus::Disconnected && !s.connection.has_token() {
            match s.backend.issue_or_validate_token(s.notebook.uuid, "") {
                Ok(token) => s.connection.set_token(token),
                Err(e) => {
                    let error = Error::AuthenticationFailed(e.to_string());
                    s.report_auth_failure(&error);
                    return Err(error);
                }
            }
        }
        let actions = s.connection.connect();
        s.apply_connection(actions);
        Ok(self.take_actions())
    }

    pub fn disconnect(&mut self) -> Vec<OutboundAction> {
        self.session.disconnect(REASON_USER, DisconnectCause::User);
        self.reassemblers.remove(&Channel::Primary);
        self.take_actions()
    }

    /// The embedding client is shutting down.
    pub fn disable(&mut self) -> Vec<OutboundAction> {
        self.session
            .disconnect(REASON_DISABLED, DisconnectCause::User);
        self.reassemblers.clear();
        self.take_actions()
    }

    pub fn on_transport_open(&mut self) -> Vec<OutboundAction> {
        let actions = self.session.connection.on_transport_open();
        self.session.apply_connection(actions);
        self.take_actions()
    }

    pub fn on_transport_closed(&mut self) -> Vec<OutboundAction> {
        self.session
            .disconnect(REASON_NETWORK, DisconnectCause::Network);
        self.reassemblers.remove(&Channel::Primary);
        self.take_actions()
    }

    /// The relay answered with an error instead of a frame.
    pub fn on_server_error(&mut self, reason: &str) -> Vec<OutboundAction> {
        self.session.log("samepage-error", reason, Intent::Error);
        if self.session.connection.status() == ConnectionStatus::Pending {
            self.session
                .disconnect(REASON_PENDING_ERROR, DisconnectCause::Error);
        }
        self.take_actions()
    }

    pub fn on_frame_received(&mut self, channel: Channel, frame: Frame) -> Vec<OutboundAction> {
        let config = &self.session.config;
        let reassembler = self.reassemblers.entry(channel).or_insert_with(|| {
            Reassembler::new(config.chunk_timeout_ticks, config.max_partial_messages)
        });
        match reassembler.ingest(frame) {
            Ok(Ingest::Incomplete) => {}
            Ok(Ingest::Complete(message)) => {
                if channel != Channel::Primary && message.operation == AUTHENTICATION {
                    tracing::warn!(?channel, "authentication over a direct link ignored");
                } else {
                    self.deliver(message);
                }
            }
            Err(e) => tracing::warn!(?channel, error = %e, "dropping malformed frame"),
        }
        self.take_actions()
    }

    pub fn on_peer_link_up(&mut self, peer: NotebookId) {
        tracing::info!(%peer, "direct link up");
        self.session.router.on_link_up(peer);
    }

    pub fn on_peer_link_down(&mut self, peer: NotebookId) -> Vec<OutboundAction> {
        tracing::info!(%peer, "direct link down");
        self.reassemblers.remove(&Channel::Direct(peer));
        for message in self.session.router.on_link_down(peer) {
            self.session.reroute(message);
        }
        self.take_actions()
    }

    pub fn on_direct_delivered(&mut self, message_id: &Uuid) {
        self.session.router.on_delivered(message_id);
    }

    pub fn on_direct_send_failed(&mut self, peer: NotebookId) -> Vec<OutboundAction> {
        tracing::warn!(%peer, "direct send failed, falling back to relay");
        for message in self.session.router.on_send_failed(peer) {
            self.session.reroute(message);
        }
        self.take_actions()
    }

    /// Advance time: purge stale partial messages and end an overdue resync.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        self.session.tick += 1;
        for (channel, reassembler) in self.reassemblers.iter_mut() {
            for id in reassembler.tick() {
                tracing::debug!(?channel, message = %id, "purged incomplete message");
            }
        }
        self.session.check_resync_deadline();
        self.take_actions()
    }

    pub fn send_to_notebook<T: Serialize>(
        &mut self,
        target: NotebookId,
        operation: &str,
        payload: &T,
    ) -> Result<()> {
        self.session.send_to(target, operation, payload)
    }

    /// Share a local page and invite `targets`. Sharing an open page again only adds invitees.
    pub fn share_page(&mut self, notebook_page_id: &str, targets: &[NotebookId]) -> Result<Uuid> {
        let s = &mut self.session;
        s.check_quota(QuotaResource::Pages)?;
        let content = s.host.get_current_page_content(notebook_page_id)?;
        let page = s.pages.share(notebook_page_id, notebook_page_id)?;
        if !s.engine.has_page(&page) {
            s.engine.open(page, &content);
        }
        for target in targets {
            s.invite(page, *target)?;
        }
        s.events.log(
            "share-page-success",
            format!("Successfully shared page {}", notebook_page_id),
            Intent::Success,
        );
        Ok(page)
    }

    pub fn invite(&mut self, notebook_page_id: &str, target: NotebookId) -> Result<()> {
        let page = self.session.open_page(notebook_page_id)?;
        self.session.invite(page, target)
    }

    /// Accept an invite: create the local page, answer the inviter and ask for a snapshot.
    pub fn accept(&mut self, notification: &Uuid) -> Result<()> {
        let s = &mut self.session;
        let pending = s
            .pages
            .notification(notification)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("no notification {}", notification)))?;
        s.host
            .create_local_page(&pending.notebook_page_id, &pending.title)?;
        let n = s.pages.accept(notification)?;
        let inviter = n.inviter.uuid;
        let response = SharePageResponse {
            page_uuid: n.page_uuid,
            accepted: true,
        };
        if let Err(e) = s.send_or_store(inviter, SHARE_PAGE_RESPONSE, &response) {
            tracing::warn!(page = %n.page_uuid, error = %e, "accept response not delivered");
        }
        let request = RequestPageSync {
            page_uuid: n.page_uuid,
            seen: Default::default(),
            snapshot: true,
        };
        if let Err(e) = s.send_to(inviter, REQUEST_PAGE_SYNC, &request) {
            tracing::debug!(page = %n.page_uuid, error = %e, "snapshot request deferred to next connection");
        }
        s.mark_message_read(n.message_uuid);
        Ok(())
    }

    pub fn reject(&mut self, notification: &Uuid) -> Result<()> {
        let s = &mut self.session;
        let n = s.pages.reject(notification)?;
        let response = SharePageResponse {
            page_uuid: n.page_uuid,
            accepted: false,
        };
        if let Err(e) = s.send_or_store(n.inviter.uuid, SHARE_PAGE_RESPONSE, &response) {
            tracing::warn!(page = %n.page_uuid, error = %e, "reject response not delivered");
        }
        s.mark_message_read(n.message_uuid);
        Ok(())
    }

    /// Dismiss a notification without answering it.
    pub fn mark_read(&mut self, notification: &Uuid) -> Result<()> {
        let n = self.session.pages.mark_read(notification)?;
        self.session.mark_message_read(n.message_uuid);
        Ok(())
    }

    /// Stop syncing a page here. Inbound edits for it are discarded from now on.
    pub fn close_page(&mut self, notebook_page_id: &str) -> Result<()> {
        let s = &mut self.session;
        let page = s.pages.resolve(notebook_page_id)?.page_uuid;
        s.pages.close(&page)?;
        s.engine.close(&page);
        s.repairs.forget(&page);
        s.repairing.remove(&page);
        s.settle(&page);
        Ok(())
    }

    /// Forget a shared page and delete it from the host.
    pub fn remove_page(&mut self, notebook_page_id: &str) -> Result<()> {
        let s = &mut self.session;
        let page = s.pages.resolve(notebook_page_id)?.page_uuid;
        s.host.delete_local_page(notebook_page_id)?;
        s.pages.remove(&page)?;
        s.engine.close(&page);
        s.repairs.forget(&page);
        s.repairing.remove(&page);
        s.settle(&page);
        Ok(())
    }

    pub fn insert(&mut self, notebook_page_id: &str, index: usize, text: &str) -> Result<()> {
        self.session.local_edit(
            notebook_page_id,
            LocalEdit::Insert {
                index,
                text: text.to_string(),
            },
        )
    }

    pub fn delete(&mut self, notebook_page_id: &str, index: usize, count: usize) -> Result<()> {
        self.session
            .local_edit(notebook_page_id, LocalEdit::Delete { index, count })
    }

    pub fn annotate(&mut self, notebook_page_id: &str, range: RangeAnnotation) -> Result<()> {
        self.session
            .local_edit(notebook_page_id, LocalEdit::Annotate(range))
    }

    pub fn remove_annotation(&mut self, notebook_page_id: &str, range: RangeAnnotation) -> Result<()> {
        self.session
            .local_edit(notebook_page_id, LocalEdit::RemoveAnnotation(range))
    }

    /// Re-read the host page and send whatever changed since the last render.
    pub fn refresh(&mut self, notebook_page_id: &str) -> Result<()> {
        let s = &mut self.session;
        let page = s.open_page(notebook_page_id)?;
        let content = s.host.get_current_page_content(notebook_page_id)?;
        if let Some(batch) = s.engine.refresh(&page, &content)? {
            s.broadcast_update(page, batch);
        }
        s.render(&page);
        Ok(())
    }

    pub fn notifications(&self) -> &[PendingNotification] {
        self.session.pages.notifications()
    }

    pub fn page_state(&self, notebook_page_id: &str) -> PageState {
        self.session.pages.state_by_local(notebook_page_id)
    }

    pub fn page_uuid(&self, notebook_page_id: &str) -> Option<Uuid> {
        self.session
            .pages
            .page_by_local(notebook_page_id)
            .map(|p| p.page_uuid)
    }

    pub fn page_view(&self, notebook_page_id: &str) -> Option<DocumentView> {
        let page = self.page_uuid(notebook_page_id)?;
        self.session.engine.view(&page)
    }

    pub fn page_checksum(&self, notebook_page_id: &str) -> Option<String> {
        let page = self.page_uuid(notebook_page_id)?;
        self.session.engine.checksum(&page)
    }

    fn deliver(&mut self, message: LogicalMessage) {
        tracing::trace!(operation = %message.operation, id = %message.id, "dispatching");
        match self.dispatcher.dispatch(&mut self.session, &message) {
            Dispatched::Handled => {}
            Dispatched::Unhandled(operation) => {
                tracing::warn!(%operation, "no handler registered");
                self.session
                    .events
                    .emit(Event::UnhandledOperation { operation });
            }
            Dispatched::Failed(e) if e.kind() == ErrorKind::MalformedMessage => {
                tracing::warn!(operation = %message.operation, error = %e, "dropping malformed message");
            }
            Dispatched::Failed(e) => {
                tracing::warn!(operation = %message.operation, error = %e, "handler failed");
                let id = format!(
                    "{}-failure",
                    message.operation.to_lowercase().replace('_', "-")
                );
                self.session.events.log(&id, e.reason(), Intent::Error);
            }
        }
        if std::mem::take(&mut self.session.just_authenticated) {
            self.after_authenticated();
        }
    }

    /// Deliver what arrived while we were away, then resync open pages.
    fn after_authenticated(&mut self) {
        let me = self.session.notebook.uuid;
        match self.session.backend.fetch_unmarked_messages(me) {
            Ok(unmarked) => {
                for stored in unmarked {
                    match self.session.backend.load_message(stored.uuid) {
                        Ok(mut message) => {
                            message.id = stored.uuid;
                            self.deliver(message);
                            if !protocol::requires_response(&stored.operation) {
                                self.session.mark_message_read(Some(stored.uuid));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(message = %stored.uuid, error = %e, "could not load stored message")
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch stored messages");
                self.session.events.log(
                    "samepage-warning",
                    format!("Could not load messages received while offline: {}", e),
                    Intent::Warning,
                );
            }
        }
        self.session.start_resync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{BackendError, HostError, UnmarkedMessage};
    use crate::identity::AppId;
    use crate::patch::Patch;
    use std::sync::{Arc, Mutex};
    use std::result::Result;

    #[derive(Default)]
    struct Store {
        messages: HashMap<Uuid, LogicalMessage>,
        unmarked: Vec<Uuid>,
        marked: Vec<Uuid>,
        enqueued: Vec<(NotebookId, String)>,
        quota_exceeded: bool,
        refuse_tokens: bool,
    }

    struct FakeBackend(Arc<Mutex<Store>>);

    impl Backend for FakeBackend {
        fn issue_or_validate_token(&mut self, _: NotebookId, token: &str) -> Result<String, BackendError> {
            if self.0.lock().unwrap().refuse_tokens {
                return Err(BackendError::Rejected("no such notebook".into()));
            }
            Ok(if token.is_empty() { "issued".into() } else { token.into() })
        }

        fn enqueue_message(
            &mut self,
            _: &Notebook,
            target: NotebookId,
            operation: &str,
            _: &serde_json::Value,
        ) -> Result<Uuid, BackendError> {
            self.0.lock().unwrap().enqueued.push((target, operation.to_string()));
            Ok(Uuid::new_v4())
        }

        fn fetch_unmarked_messages(&mut self, _: NotebookId) -> Result<Vec<UnmarkedMessage>, BackendError> {
            let store = self.0.lock().unwrap();
            Ok(store
                .unmarked
                .iter()
                .map(|id| UnmarkedMessage {
                    uuid: *id,
                    operation: store.messages[id].operation.clone(),
                })
                .collect())
        }

        fn load_message(&mut self, message: Uuid) -> Result<LogicalMessage, BackendError> {
            self.0
                .lock()
                .unwrap()
                .messages
                .get(&message)
                .cloned()
                .ok_or_else(|| BackendError::Rejected("no such message".into()))
        }

        fn mark_message_read(&mut self, message: Uuid) -> Result<(), BackendError> {
            let mut store = self.0.lock().unwrap();
            store.unmarked.retain(|id| *id != message);
            store.marked.push(message);
            Ok(())
        }

        fn enforce_quota(&mut self, _: NotebookId, _: QuotaResource) -> Result<QuotaStatus, BackendError> {
            Ok(if self.0.lock().unwrap().quota_exceeded {
                QuotaStatus::Exceeded
            } else {
                QuotaStatus::Ok
            })
        }
    }

    struct FakeHost(Arc<Mutex<HashMap<String, DocumentView>>>);

    impl HostApp for FakeHost {
        fn get_current_page_content(&mut self, page: &str) -> Result<DocumentView, HostError> {
            self.0
                .lock()
                .unwrap()
                .get(page)
                .cloned()
                .ok_or_else(|| HostError(format!("no page {}", page)))
        }

        fn apply_patch(&mut self, page: &str, patch: &Patch) -> Result<(), HostError> {
            let mut pages = self.0.lock().unwrap();
            let view = pages.entry(page.to_string()).or_default();
            *view = patch.apply(view);
            Ok(())
        }

        fn create_local_page(&mut self, page: &str, _: &str) -> Result<(), HostError> {
            self.0.lock().unwrap().entry(page.to_string()).or_default();
            Ok(())
        }

        fn delete_local_page(&mut self, page: &str) -> Result<(), HostError> {
            self.0.lock().unwrap().remove(page);
            Ok(())
        }
    }

    struct Fixture {
        core: SamePageCore,
        store: Arc<Mutex<Store>>,
        host: Arc<Mutex<HashMap<String, DocumentView>>>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    fn fixture_with(config: Config) -> Fixture {
        let store = Arc::new(Mutex::new(Store::default()));
        let host = Arc::new(Mutex::new(HashMap::new()));
        let notebook = Notebook::new(NotebookId::new_v4(), AppId::Roam, "main");
        let mut core = SamePageCore::new(
            config,
            notebook,
            "token",
            Box::new(FakeBackend(store.clone())),
            Box::new(FakeHost(host.clone())),
        )
        .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            core.subscribe(Box::new(move |e: &Event| events.lock().unwrap().push(e.clone())));
        }
        Fixture {
            core,
            store,
            host,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default())
    }

    fn peer() -> Notebook {
        Notebook::new(NotebookId::new_v4(), AppId::Obsidian, "vault")
    }

    fn feed(core: &mut SamePageCore, message: LogicalMessage) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        for frame in chunk::encode(&message, 0).unwrap() {
            out.extend(core.on_frame_received(Channel::Primary, frame));
        }
        out
    }

    fn sent(actions: &[OutboundAction]) -> Vec<LogicalMessage> {
        let mut r = Reassembler::default();
        let mut out = Vec::new();
        for action in actions {
            let frames = match action {
                OutboundAction::SendPrimary { frames, .. } => frames,
                OutboundAction::SendDirect { frames, .. } => frames,
                _ => continue,
            };
            for frame in frames {
                if let Ingest::Complete(m) = r.ingest(frame.clone()).unwrap() {
                    out.push(m);
                }
            }
        }
        out
    }

    fn auth(success: bool) -> LogicalMessage {
        LogicalMessage::with_payload(
            AUTHENTICATION,
            &AuthenticationResult {
                success,
                reason: (!success).then(|| "bad token".to_string()),
            },
            Target::Broadcast,
        )
        .unwrap()
    }

    fn connect(f: &mut Fixture) -> Vec<OutboundAction> {
        f.core.connect();
        f.core.on_transport_open();
        feed(&mut f.core, auth(true))
    }

    fn logs(f: &Fixture, id: &str) -> Vec<String> {
        f.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Log { id: i, content, .. } if i == id => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_sends_handshake_with_token() {
        let mut f = fixture();
        assert_eq!(f.core.connect(), vec![OutboundAction::OpenTransport]);
        assert_eq!(f.core.status(), ConnectionStatus::Pending);
        let actions = f.core.on_transport_open();
        assert!(matches!(
            &actions[..],
            [OutboundAction::SendPrimary {
                target: Target::Broadcast,
                ..
            }]
        ));
        let handshake = sent(&actions);
        assert_eq!(handshake[0].operation, AUTHENTICATION);
        assert_eq!(handshake[0].payload["token"], "token");
    }

    #[test]
    fn successful_authentication_logs_success_once() {
        let mut f = fixture();
        connect(&mut f);
        assert_eq!(f.core.status(), ConnectionStatus::Connected);
        assert_eq!(
            logs(&f, "samepage-success"),
            vec!["Successfully connected to SamePage Network!".to_string()]
        );
        let statuses: Vec<ConnectionStatus> = f
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::ConnectionChanged { status } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![ConnectionStatus::Pending, ConnectionStatus::Connected]);
    }

    #[test]
    fn failed_authentication_reports_failure_not_disconnect() {
        let mut f = fixture();
        f.core.connect();
        f.core.on_transport_open();
        let actions = feed(&mut f.core, auth(false));
        assert_eq!(f.core.status(), ConnectionStatus::Disconnected);
        assert!(actions
            .iter()
            .any(|a| matches!(a, OutboundAction::CloseTransport { .. })));
        assert_eq!(
            logs(&f, "samepage-failure"),
            vec!["Failed to connect to SamePage Network: bad token".to_string()]
        );
        assert!(logs(&f, "samepage-disconnect").is_empty());
    }

    #[test]
    fn refused_token_fails_connect_without_opening() {
        let store = Arc::new(Mutex::new(Store {
            refuse_tokens: true,
            ..Store::default()
        }));
        let notebook = Notebook::new(NotebookId::new_v4(), AppId::Roam, "main");
        let mut core = SamePageCore::new(
            Config::default(),
            notebook,
            "",
            Box::new(FakeBackend(store)),
            Box::new(FakeHost(Arc::new(Mutex::new(HashMap::new())))),
        )
        .unwrap();
        let err = core.try_connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(err.reason().contains("no such notebook"));
        assert_eq!(core.status(), ConnectionStatus::Disconnected);
        assert!(!core
            .connect()
            .iter()
            .any(|a| matches!(a, OutboundAction::OpenTransport)));
    }

    #[test]
    fn disconnect_while_pending_is_silent() {
        let mut f = fixture();
        f.core.connect();
        let actions = f.core.disconnect();
        assert!(actions.contains(&OutboundAction::CloseTransport {
            reason: REASON_USER.into()
        }));
        assert!(logs(&f, "samepage-disconnect").is_empty());
        assert!(f.core.disconnect().is_empty());
    }

    #[test]
    fn disable_reports_disabled_client() {
        let mut f = fixture();
        connect(&mut f);
        let actions = f.core.disable();
        assert_eq!(
            actions,
            vec![OutboundAction::CloseTransport {
                reason: REASON_DISABLED.into()
            }]
        );
        assert_eq!(
            logs(&f, "samepage-disconnect"),
            vec!["Disconnected from SamePage Network: Disabled Client".to_string()]
        );
    }

    #[test]
    fn network_drop_after_connect_logs_once() {
        let mut f = fixture();
        connect(&mut f);
        assert!(f.core.on_transport_closed().is_empty());
        f.core.on_transport_closed();
        assert_eq!(
            logs(&f, "samepage-disconnect"),
            vec!["Disconnected from SamePage Network: Network Disconnected".to_string()]
        );
    }

    #[test]
    fn error_while_pending_closes_connection() {
        let mut f = fixture();
        f.core.connect();
        f.core.on_transport_open();
        let error = LogicalMessage::with_payload(
            ERROR,
            &ErrorPayload {
                message: "server overloaded".into(),
            },
            Target::Broadcast,
        )
        .unwrap();
        let actions = feed(&mut f.core, error);
        assert!(actions.contains(&OutboundAction::CloseTransport {
            reason: REASON_PENDING_ERROR.into()
        }));
        assert_eq!(logs(&f, "samepage-error"), vec!["server overloaded".to_string()]);
    }

    #[test]
    fn missing_token_is_issued_before_connecting() {
        let store = Arc::new(Mutex::new(Store::default()));
        let mut core = SamePageCore::new(
            Config::default(),
            Notebook::new(NotebookId::new_v4(), AppId::LogSeq, "graph"),
            "",
            Box::new(FakeBackend(store)),
            Box::new(FakeHost(Arc::new(Mutex::new(HashMap::new())))),
        )
        .unwrap();
        core.connect();
        let handshake = sent(&core.on_transport_open());
        assert_eq!(handshake[0].payload["token"], "issued");
    }

    #[test]
    fn unknown_operation_is_reported() {
        let mut f = fixture();
        connect(&mut f);
        let msg = LogicalMessage::new("PING", serde_json::Value::Null, Target::Broadcast)
            .from_notebook(peer());
        feed(&mut f.core, msg);
        assert!(f.events.lock().unwrap().contains(&Event::UnhandledOperation {
            operation: "PING".into()
        }));
    }

    #[test]
    fn custom_handler_receives_messages_and_builtins_are_taken() {
        let mut f = fixture();
        let hits = Arc::new(Mutex::new(0));
        {
            let hits = hits.clone();
            f.core
                .register(
                    "PING",
                    Box::new(move |_: &mut Session, _: &LogicalMessage| {
                        *hits.lock().unwrap() += 1;
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let err = f
            .core
            .register(
                SHARE_PAGE,
                Box::new(|_: &mut Session, _: &LogicalMessage| Ok(())),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateHandler);
        feed(
            &mut f.core,
            LogicalMessage::new("PING", serde_json::Value::Null, Target::Broadcast),
        );
        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(f.core.unregister("PING"));
    }

    #[test]
    fn malformed_payload_is_dropped_quietly() {
        let mut f = fixture();
        connect(&mut f);
        let before = f.events.lock().unwrap().len();
        let bad = LogicalMessage::new(SHARE_PAGE, serde_json::json!({"nope": 1}), Target::Broadcast)
            .from_notebook(peer());
        feed(&mut f.core, bad);
        assert_eq!(f.events.lock().unwrap().len(), before);
    }

    #[test]
    fn send_while_disconnected_fails_fast() {
        let mut f = fixture();
        let err = f
            .core
            .send_to_notebook(NotebookId::new_v4(), "PING", &serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn stored_messages_delivered_after_connect() {
        let mut f = fixture();
        let inviter = peer();
        let invite = LogicalMessage::with_payload(
            SHARE_PAGE,
            &SharePage {
                page_uuid: Uuid::new_v4(),
                notebook_page_id: "plans".into(),
                title: "Plans".into(),
            },
            Target::Notebook(f.core.notebook().uuid),
        )
        .unwrap()
        .from_notebook(inviter.clone());
        let response = LogicalMessage::with_payload(
            SHARE_PAGE_RESPONSE,
            &SharePageResponse {
                page_uuid: Uuid::new_v4(),
                accepted: true,
            },
            Target::Notebook(f.core.notebook().uuid),
        )
        .unwrap()
        .from_notebook(inviter);
        {
            let mut store = f.store.lock().unwrap();
            for m in [&invite, &response] {
                store.messages.insert(m.id, m.clone());
                store.unmarked.push(m.id);
            }
        }
        connect(&mut f);
        assert_eq!(f.core.notifications().len(), 1);
        assert_eq!(f.core.notifications()[0].message_uuid, Some(invite.id));
        let store = f.store.lock().unwrap();
        assert_eq!(store.marked, vec![response.id]);
        assert_eq!(store.unmarked, vec![invite.id]);
    }

    #[test]
    fn share_checks_quota() {
        let mut f = fixture();
        f.host
            .lock()
            .unwrap()
            .insert("notes".into(), DocumentView::new("hi"));
        f.store.lock().unwrap().quota_exceeded = true;
        let err = f.core.share_page("notes", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(f.core.page_state("notes"), PageState::NotShared);
    }

    #[test]
    fn share_stores_invite_with_backend() {
        let mut f = fixture();
        f.host
            .lock()
            .unwrap()
            .insert("notes".into(), DocumentView::new("hi"));
        let target = NotebookId::new_v4();
        f.core.share_page("notes", &[target]).unwrap();
        assert_eq!(f.core.page_state("notes"), PageState::Open);
        assert_eq!(
            f.store.lock().unwrap().enqueued,
            vec![(target, SHARE_PAGE.to_string())]
        );
        assert_eq!(f.core.page_view("notes").unwrap().text, "hi");
    }

    #[test]
    fn edits_on_unshared_page_rejected() {
        let mut f = fixture();
        let err = f.core.insert("nowhere", 0, "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownPage);
    }

    #[test]
    fn edits_sent_to_open_members_when_connected() {
        let mut f = fixture();
        f.host
            .lock()
            .unwrap()
            .insert("notes".into(), DocumentView::new("hi"));
        let member = peer();
        let page = f.core.share_page("notes", &[member.uuid]).unwrap();
        connect(&mut f);
        let accepted = LogicalMessage::with_payload(
            SHARE_PAGE_RESPONSE,
            &SharePageResponse {
                page_uuid: page,
                accepted: true,
            },
            Target::Notebook(f.core.notebook().uuid),
        )
        .unwrap()
        .from_notebook(member.clone());
        feed(&mut f.core, accepted);
        f.core.insert("notes", 2, "!").unwrap();
        let out = sent(&f.core.take_actions());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].operation, SHARE_PAGE_UPDATE);
        assert_eq!(out[0].target, Target::Notebook(member.uuid));
        assert_eq!(f.core.page_view("notes").unwrap().text, "hi!");
    }

    #[test]
    fn full_refresh_mode_reads_host_content() {
        let mut f = fixture_with(Config {
            granular_changes: false,
            ..Config::default()
        });
        f.host
            .lock()
            .unwrap()
            .insert("notes".into(), DocumentView::new("hi"));
        f.core.share_page("notes", &[]).unwrap();
        f.host
            .lock()
            .unwrap()
            .insert("notes".into(), DocumentView::new("hi there"));
        // Position is ignored; the host's content is what counts.
        f.core.insert("notes", 0, "ignored").unwrap();
        assert_eq!(f.core.page_view("notes").unwrap().text, "hi there");
    }

    #[test]
    fn direct_link_preferred_and_failure_falls_back() {
        let mut f = fixture();
        connect(&mut f);
        let target = NotebookId::new_v4();
        f.core.on_peer_link_up(target);
        f.core
            .send_to_notebook(target, "PING", &serde_json::Value::Null)
            .unwrap();
        let actions = f.core.take_actions();
        assert!(matches!(&actions[..], [OutboundAction::SendDirect { peer, .. }] if *peer == target));
        assert_eq!(f.core.direct_peers(), vec![target]);
        assert_eq!(f.core.direct_in_flight(), 1);
        let rerouted = f.core.on_direct_send_failed(target);
        assert!(matches!(
            &rerouted[..],
            [OutboundAction::SendPrimary { target: Target::Notebook(t), .. }] if *t == target
        ));
        assert!(f.core.direct_peers().is_empty());
        assert_eq!(f.core.direct_in_flight(), 0);
    }

    #[test]
    fn stale_partial_purged_on_tick() {
        let mut f = fixture_with(Config {
            max_frame_size: 8,
            chunk_timeout_ticks: 2,
            ..Config::default()
        });
        let msg = LogicalMessage::new("PING", serde_json::json!("a long enough payload"), Target::Broadcast);
        let frames = chunk::encode(&msg, 8).unwrap();
        assert!(frames.len() > 1);
        f.core.on_frame_received(Channel::Primary, frames[0].clone());
        f.core.tick();
        f.core.tick();
        f.core.tick();
        for frame in frames.into_iter().skip(1) {
            f.core.on_frame_received(Channel::Primary, frame);
        }
        assert!(!f
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::UnhandledOperation { .. })));
    }
}
