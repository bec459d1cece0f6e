//! In-memory network for driving several cores: a relay that authenticates
//! and forwards frames, a shared message store behind `Backend`, and hosts
//! that keep page content in memory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use samepage_core::boundary::{BackendError, HostError, UnmarkedMessage};
use samepage_core::chunk::{self, Ingest, Reassembler};
use samepage_core::protocol::{AuthenticationResult, AUTHENTICATION};
use samepage_core::{
    AppId, Backend, Channel, Config, DocumentView, Event, HostApp, LogicalMessage, Notebook,
    NotebookId, OutboundAction, Patch, QuotaResource, QuotaStatus, SamePageCore, Target,
};
use uuid::Uuid;

#[derive(Default)]
pub struct Store {
    pub tokens: HashMap<NotebookId, String>,
    pub messages: HashMap<Uuid, LogicalMessage>,
    pub inbox: HashMap<NotebookId, Vec<Uuid>>,
    pub marked: Vec<Uuid>,
    pub online: HashSet<NotebookId>,
    /// Stored messages to push to online targets.
    pub live: VecDeque<(NotebookId, Uuid)>,
}

impl Store {
    fn store(&mut self, message: LogicalMessage, target: NotebookId) -> Uuid {
        let id = message.id;
        self.messages.insert(id, message);
        self.inbox.entry(target).or_default().push(id);
        if self.online.contains(&target) {
            self.live.push_back((target, id));
        }
        id
    }

    pub fn stored_for(&self, target: &NotebookId) -> Vec<LogicalMessage> {
        self.inbox
            .get(target)
            .map(|ids| ids.iter().map(|id| self.messages[id].clone()).collect())
            .unwrap_or_default()
    }
}

pub struct MemoryBackend(pub Arc<Mutex<Store>>);

impl Backend for MemoryBackend {
    fn issue_or_validate_token(&mut self, notebook: NotebookId, token: &str) -> Result<String, BackendError> {
        let mut store = self.0.lock().unwrap();
        let issued = store
            .tokens
            .entry(notebook)
            .or_insert_with(|| format!("token-{}", notebook));
        if token.is_empty() || token == issued {
            Ok(issued.clone())
        } else {
            Err(BackendError::Rejected("invalid token".into()))
        }
    }

    fn enqueue_message(
        &mut self,
        source: &Notebook,
        target: NotebookId,
        operation: &str,
        payload: &serde_json::Value,
    ) -> Result<Uuid, BackendError> {
        let message = LogicalMessage::new(operation, payload.clone(), Target::Notebook(target))
            .from_notebook(source.clone());
        Ok(self.0.lock().unwrap().store(message, target))
    }

    fn fetch_unmarked_messages(&mut self, notebook: NotebookId) -> Result<Vec<UnmarkedMessage>, BackendError> {
        let store = self.0.lock().unwrap();
        Ok(store
            .stored_for(&notebook)
            .into_iter()
            .map(|m| UnmarkedMessage {
                uuid: m.id,
                operation: m.operation,
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
            .ok_or_else(|| BackendError::Rejected(format!("no message {}", message)))
    }

    fn mark_message_read(&mut self, message: Uuid) -> Result<(), BackendError> {
        let mut store = self.0.lock().unwrap();
        for ids in store.inbox.values_mut() {
            ids.retain(|id| *id != message);
        }
        store.marked.push(message);
        Ok(())
    }

    fn enforce_quota(&mut self, _: NotebookId, _: QuotaResource) -> Result<QuotaStatus, BackendError> {
        Ok(QuotaStatus::Ok)
    }
}

#[derive(Default)]
pub struct HostState {
    pub pages: HashMap<String, DocumentView>,
    /// Reject every patch while set.
    pub broken: bool,
}

pub struct MemoryHost(pub Arc<Mutex<HostState>>);

impl HostApp for MemoryHost {
    fn get_current_page_content(&mut self, page: &str) -> Result<DocumentView, HostError> {
        self.0
            .lock()
            .unwrap()
            .pages
            .get(page)
            .cloned()
            .ok_or_else(|| HostError(format!("no page {}", page)))
    }

    fn apply_patch(&mut self, page: &str, patch: &Patch) -> Result<(), HostError> {
        let mut state = self.0.lock().unwrap();
        if state.broken {
            return Err(HostError("host is busy".into()));
        }
        let view = state
            .pages
            .get_mut(page)
            .ok_or_else(|| HostError(format!("no page {}", page)))?;
        *view = patch.apply(view);
        Ok(())
    }

    fn create_local_page(&mut self, page: &str, _: &str) -> Result<(), HostError> {
        self.0
            .lock()
            .unwrap()
            .pages
            .entry(page.to_string())
            .or_default();
        Ok(())
    }

    fn delete_local_page(&mut self, page: &str) -> Result<(), HostError> {
        self.0.lock().unwrap().pages.remove(page);
        Ok(())
    }
}

pub struct Node {
    pub core: SamePageCore,
    pub notebook: Notebook,
    pub host: Arc<Mutex<HostState>>,
    pub events: Arc<Mutex<Vec<Event>>>,
    transport_open: bool,
}

impl Node {
    pub fn id(&self) -> NotebookId {
        self.notebook.uuid
    }

    pub fn host_text(&self, page: &str) -> String {
        self.host
            .lock()
            .unwrap()
            .pages
            .get(page)
            .map(|v| v.text.clone())
            .unwrap_or_default()
    }

    pub fn replica_text(&self, page: &str) -> String {
        self.core
            .page_view(page)
            .map(|v| v.text)
            .unwrap_or_default()
    }

    pub fn logs(&self, id: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::Log { id: i, .. } if i == id))
            .count()
    }

    pub fn notification_ids(&self) -> Vec<Uuid> {
        self.core.notifications().iter().map(|n| n.uuid).collect()
    }
}

pub struct Network {
    pub store: Arc<Mutex<Store>>,
    pub nodes: Vec<Node>,
    relay: HashMap<NotebookId, Reassembler>,
    links: HashSet<(NotebookId, NotebookId)>,
    queue: VecDeque<(usize, OutboundAction)>,
    pub direct_sends: usize,
}

impl Network {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            nodes: Vec::new(),
            relay: HashMap::new(),
            links: HashSet::new(),
            queue: VecDeque::new(),
            direct_sends: 0,
        }
    }

    /// Small frames so every message is chunked.
    pub fn config() -> Config {
        Config {
            max_frame_size: 64,
            ..Config::default()
        }
    }

    pub fn add_node(&mut self, workspace: &str) -> usize {
        self.add_node_with(workspace, Self::config())
    }

    pub fn add_node_with(&mut self, workspace: &str, config: Config) -> usize {
        let notebook = Notebook::new(NotebookId::new_v4(), AppId::Roam, workspace);
        let host = Arc::new(Mutex::new(HostState::default()));
        let mut core = SamePageCore::new(
            config,
            notebook.clone(),
            "",
            Box::new(MemoryBackend(self.store.clone())),
            Box::new(MemoryHost(host.clone())),
        )
        .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            core.subscribe(Box::new(move |e: &Event| events.lock().unwrap().push(e.clone())));
        }
        self.nodes.push(Node {
            core,
            notebook,
            host,
            events,
            transport_open: false,
        });
        self.nodes.len() - 1
    }

    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    pub fn id(&self, i: usize) -> NotebookId {
        self.nodes[i].id()
    }

    pub fn set_page(&mut self, i: usize, page: &str, text: &str) {
        self.nodes[i]
            .host
            .lock()
            .unwrap()
            .pages
            .insert(page.to_string(), DocumentView::new(text));
    }

    pub fn connect(&mut self, i: usize) {
        let actions = self.nodes[i].core.connect();
        self.enqueue(i, actions);
        self.pump();
    }

    pub fn disconnect(&mut self, i: usize) {
        let actions = self.nodes[i].core.disconnect();
        self.enqueue(i, actions);
        self.pump();
    }

    /// The relay socket dies under node `i`.
    pub fn drop_connection(&mut self, i: usize) {
        let id = self.id(i);
        self.store.lock().unwrap().online.remove(&id);
        self.relay.remove(&id);
        self.nodes[i].transport_open = false;
        let actions = self.nodes[i].core.on_transport_closed();
        self.enqueue(i, actions);
        self.pump();
    }

    pub fn link(&mut self, a: usize, b: usize) {
        let (ia, ib) = (self.id(a), self.id(b));
        self.links.insert((ia, ib));
        self.links.insert((ib, ia));
        self.nodes[a].core.on_peer_link_up(ib);
        self.nodes[b].core.on_peer_link_up(ia);
    }

    /// Link stays "up" for the cores but drops every frame, like a half-dead socket.
    pub fn break_link(&mut self, a: usize, b: usize) {
        let (ia, ib) = (self.id(a), self.id(b));
        self.links.remove(&(ia, ib));
        self.links.remove(&(ib, ia));
    }

    /// Run a user operation on node `i` and deliver everything it sends.
    pub fn act<R>(&mut self, i: usize, f: impl FnOnce(&mut SamePageCore) -> R) -> R {
        let r = f(&mut self.nodes[i].core);
        let actions = self.nodes[i].core.take_actions();
        self.enqueue(i, actions);
        self.pump();
        r
    }

    /// Type into the host page, then tell the core.
    pub fn type_text(&mut self, i: usize, page: &str, index: usize, text: &str) {
        {
            let mut host = self.nodes[i].host.lock().unwrap();
            let view = host.pages.entry(page.to_string()).or_default();
            let mut chars: Vec<char> = view.text.chars().collect();
            let at = index.min(chars.len());
            chars.splice(at..at, text.chars());
            view.text = chars.into_iter().collect();
        }
        self.act(i, |core| core.insert(page, index, text)).unwrap();
    }

    pub fn erase(&mut self, i: usize, page: &str, index: usize, count: usize) {
        {
            let mut host = self.nodes[i].host.lock().unwrap();
            let view = host.pages.entry(page.to_string()).or_default();
            let mut chars: Vec<char> = view.text.chars().collect();
            let end = index.saturating_add(count).min(chars.len());
            chars.drain(index.min(end)..end);
            view.text = chars.into_iter().collect();
        }
        self.act(i, |core| core.delete(page, index, count)).unwrap();
    }

    /// Hand a message straight to node `i` as if the relay forwarded it.
    pub fn inject(&mut self, i: usize, message: LogicalMessage) {
        for frame in chunk::encode(&message, 64).unwrap() {
            let actions = self.nodes[i].core.on_frame_received(Channel::Primary, frame);
            self.enqueue(i, actions);
        }
        self.pump();
    }

    pub fn tick_all(&mut self) {
        for i in 0..self.nodes.len() {
            let actions = self.nodes[i].core.tick();
            self.enqueue(i, actions);
        }
        self.pump();
    }

    fn index_of(&self, id: &NotebookId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == *id)
    }

    fn enqueue(&mut self, i: usize, actions: Vec<OutboundAction>) {
        self.queue.extend(actions.into_iter().map(|a| (i, a)));
    }

    fn pump(&mut self) {
        let mut steps = 0;
        loop {
            steps += 1;
            assert!(steps < 100_000, "message storm");
            if let Some((i, action)) = self.queue.pop_front() {
                self.handle(i, action);
                continue;
            }
            let live = self.store.lock().unwrap().live.pop_front();
            match live {
                Some((target, id)) => {
                    let message = self.store.lock().unwrap().messages.get(&id).cloned();
                    if let (Some(t), Some(m)) = (self.index_of(&target), message) {
                        self.forward(t, &m);
                    }
                }
                None => break,
            }
        }
    }

    fn handle(&mut self, i: usize, action: OutboundAction) {
        let me = self.id(i);
        match action {
            OutboundAction::OpenTransport => {
                self.nodes[i].transport_open = true;
                let actions = self.nodes[i].core.on_transport_open();
                self.enqueue(i, actions);
            }
            OutboundAction::CloseTransport { .. } => {
                self.nodes[i].transport_open = false;
                self.store.lock().unwrap().online.remove(&me);
                self.relay.remove(&me);
            }
            OutboundAction::SendPrimary { frames, .. } => {
                if !self.nodes[i].transport_open {
                    return;
                }
                for frame in frames {
                    let done = self
                        .relay
                        .entry(me)
                        .or_default()
                        .ingest(frame)
                        .unwrap();
                    if let Ingest::Complete(message) = done {
                        self.route(i, message);
                    }
                }
            }
            OutboundAction::SendDirect {
                peer,
                message_id,
                frames,
            } => {
                if !self.links.contains(&(me, peer)) {
                    let actions = self.nodes[i].core.on_direct_send_failed(peer);
                    self.enqueue(i, actions);
                    return;
                }
                self.direct_sends += 1;
                if let Some(t) = self.index_of(&peer) {
                    for frame in frames {
                        let actions = self.nodes[t].core.on_frame_received(Channel::Direct(me), frame);
                        self.enqueue(t, actions);
                    }
                }
                self.nodes[i].core.on_direct_delivered(&message_id);
            }
        }
    }

    fn route(&mut self, from: usize, message: LogicalMessage) {
        let me = self.id(from);
        match message.target {
            Target::Broadcast if message.operation == AUTHENTICATION => {
                let token = message.payload["token"].as_str().unwrap_or_default().to_string();
                let success = {
                    let mut store = self.store.lock().unwrap();
                    let ok = store.tokens.get(&me) == Some(&token);
                    if ok {
                        store.online.insert(me);
                    }
                    ok
                };
                let reply = LogicalMessage::with_payload(
                    AUTHENTICATION,
                    &AuthenticationResult {
                        success,
                        reason: (!success).then(|| "invalid token".to_string()),
                    },
                    Target::Notebook(me),
                )
                .unwrap();
                self.forward(from, &reply);
            }
            Target::Broadcast => {}
            Target::Notebook(target) => {
                let online = self.store.lock().unwrap().online.contains(&target);
                match self.index_of(&target) {
                    Some(t) if online => self.forward(t, &message),
                    _ => {
                        self.store.lock().unwrap().store(message, target);
                    }
                }
            }
        }
    }

    fn forward(&mut self, to: usize, message: &LogicalMessage) {
        for frame in chunk::encode(message, 64).unwrap() {
            let actions = self.nodes[to].core.on_frame_received(Channel::Primary, frame);
            self.enqueue(to, actions);
        }
    }
}
