//! The core actor: owns `SamePageCore` on its own thread and turns inputs from
//! the relay, direct links, stdin and the ticker into core calls.

use std::collections::VecDeque;
use std::thread::JoinHandle;

use samepage_core::{AppId, Channel, Event, Frame, Notebook, NotebookId, OutboundAction, SamePageCore};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::HttpBackend;
use crate::config::NodeConfig;
use crate::control::{self, Command};
use crate::host::FsHost;
use crate::relay::RelayCommand;
use crate::transport::{Outgoing, PeerSenders};

#[derive(Debug)]
pub enum Input {
    Command(Command),
    TransportOpen,
    TransportClosed,
    ServerError(String),
    Frame(Channel, Frame),
    PeerUp(NotebookId),
    PeerDown(NotebookId),
    DirectDelivered(Uuid),
    DirectFailed(NotebookId),
    Tick,
    Shutdown,
}

pub fn notebook(cfg: &NodeConfig, uuid: Uuid) -> Notebook {
    Notebook::new(
        NotebookId::from_uuid(uuid),
        AppId::from(cfg.app),
        cfg.workspace.clone(),
    )
}

/// Start the actor thread. The backend client blocks, so it lives off the async runtime.
pub fn spawn(
    cfg: NodeConfig,
    notebook: Notebook,
    inputs: mpsc::UnboundedReceiver<Input>,
    relay: mpsc::UnboundedSender<RelayCommand>,
    peers: PeerSenders,
) -> std::io::Result<JoinHandle<anyhow::Result<()>>> {
    std::thread::Builder::new()
        .name("samepage-core".into())
        .spawn(move || {
            let backend = HttpBackend::new(&cfg.api_url, notebook.uuid, &cfg.token)?;
            let files = FsHost::new(&cfg.data_dir)?;
            let host = FsHost::new(&cfg.data_dir)?;
            let mut core = SamePageCore::new(
                cfg.core.clone(),
                notebook,
                cfg.token.clone(),
                Box::new(backend),
                Box::new(host),
            )?;
            core.subscribe(Box::new(|event: &Event| println!("{}", control::event_line(event))));
            tracing::info!(notebook = %core.notebook().uuid, data_dir = %files.dir().display(), "core started");
            run(&mut core, &files, inputs, &relay, &peers);
            Ok(())
        })
}

fn run(
    core: &mut SamePageCore,
    files: &FsHost,
    mut inputs: mpsc::UnboundedReceiver<Input>,
    relay: &mpsc::UnboundedSender<RelayCommand>,
    peers: &PeerSenders,
) {
    while let Some(input) = inputs.blocking_recv() {
        let shutdown = matches!(input, Input::Shutdown);
        let actions = match input {
            Input::Command(command) => {
                let mut actions = Vec::new();
                let result = control::apply(core, files, command, &mut actions)
                    .map_err(|e| e.reason());
                println!("{}", control::result_line(result));
                actions.extend(core.take_actions());
                actions
            }
            Input::TransportOpen => core.on_transport_open(),
            Input::TransportClosed => core.on_transport_closed(),
            Input::ServerError(reason) => core.on_server_error(&reason),
            Input::Frame(channel, frame) => core.on_frame_received(channel, frame),
            Input::PeerUp(peer) => {
                core.on_peer_link_up(peer);
                Vec::new()
            }
            Input::PeerDown(peer) => core.on_peer_link_down(peer),
            Input::DirectDelivered(id) => {
                core.on_direct_delivered(&id);
                Vec::new()
            }
            Input::DirectFailed(peer) => core.on_direct_send_failed(peer),
            Input::Tick => core.tick(),
            Input::Shutdown => core.disable(),
        };
        perform(core, actions, relay, peers);
        if shutdown {
            break;
        }
    }
    tracing::info!("core stopped");
}

fn perform(
    core: &mut SamePageCore,
    actions: Vec<OutboundAction>,
    relay: &mpsc::UnboundedSender<RelayCommand>,
    peers: &PeerSenders,
) {
    let mut queue: VecDeque<OutboundAction> = actions.into();
    while let Some(action) = queue.pop_front() {
        let command = match action {
            OutboundAction::OpenTransport => RelayCommand::Open,
            OutboundAction::CloseTransport { reason } => {
                tracing::info!(%reason, "closing relay");
                RelayCommand::Close
            }
            OutboundAction::SendPrimary { target, frames } => RelayCommand::Send { target, frames },
            OutboundAction::SendDirect {
                peer,
                message_id,
                frames,
            } => {
                let sent = peers
                    .blocking_lock()
                    .get(&peer)
                    .map(|tx| tx.send(Outgoing { message_id, frames }).is_ok())
                    .unwrap_or(false);
                if !sent {
                    queue.extend(core.on_direct_send_failed(peer));
                }
                continue;
            }
        };
        if relay.send(command).is_err() {
            tracing::warn!("relay task gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};

    use samepage_core::{
        Backend, BackendError, Config, DocumentView, HostApp, HostError, LogicalMessage, Patch,
        QuotaResource, QuotaStatus, UnmarkedMessage,
    };

    struct NoBackend;

    impl Backend for NoBackend {
        fn issue_or_validate_token(&mut self, _: NotebookId, token: &str) -> Result<String, BackendError> {
            Ok(token.to_string())
        }
        fn enqueue_message(
            &mut self,
            _: &Notebook,
            _: NotebookId,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<Uuid, BackendError> {
            Ok(Uuid::new_v4())
        }
        fn fetch_unmarked_messages(&mut self, _: NotebookId) -> Result<Vec<UnmarkedMessage>, BackendError> {
            Ok(Vec::new())
        }
        fn load_message(&mut self, m: Uuid) -> Result<LogicalMessage, BackendError> {
            Err(BackendError::Rejected(m.to_string()))
        }
        fn mark_message_read(&mut self, _: Uuid) -> Result<(), BackendError> {
            Ok(())
        }
        fn enforce_quota(&mut self, _: NotebookId, _: QuotaResource) -> Result<QuotaStatus, BackendError> {
            Ok(QuotaStatus::Ok)
        }
    }

    struct Pages(Arc<StdMutex<HashMap<String, DocumentView>>>);

    impl HostApp for Pages {
        fn get_current_page_content(&mut self, page: &str) -> Result<DocumentView, HostError> {
            Ok(self.0.lock().unwrap().get(page).cloned().unwrap_or_default())
        }
        fn apply_patch(&mut self, page: &str, patch: &Patch) -> Result<(), HostError> {
            let mut pages = self.0.lock().unwrap();
            let next = patch.apply(&pages.get(page).cloned().unwrap_or_default());
            pages.insert(page.to_string(), next);
            Ok(())
        }
        fn create_local_page(&mut self, _: &str, _: &str) -> Result<(), HostError> {
            Ok(())
        }
        fn delete_local_page(&mut self, page: &str) -> Result<(), HostError> {
            self.0.lock().unwrap().remove(page);
            Ok(())
        }
    }

    fn core() -> SamePageCore {
        let notebook = Notebook::new(NotebookId::new_v4(), AppId::Roam, "main");
        SamePageCore::new(
            Config::default(),
            notebook,
            "token",
            Box::new(NoBackend),
            Box::new(Pages(Arc::new(StdMutex::new(HashMap::new())))),
        )
        .unwrap()
    }

    #[test]
    fn connection_actions_go_to_the_relay() {
        let mut core = core();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peers: PeerSenders = Default::default();
        let actions = core.connect();
        perform(&mut core, actions, &tx, &peers);
        assert!(matches!(rx.try_recv(), Ok(RelayCommand::Open)));
        let actions = core.on_transport_open();
        perform(&mut core, actions, &tx, &peers);
        assert!(matches!(rx.try_recv(), Ok(RelayCommand::Send { .. })));
        let actions = core.disable();
        perform(&mut core, actions, &tx, &peers);
        assert!(matches!(rx.try_recv(), Ok(RelayCommand::Close)));
    }

    #[test]
    fn unlinked_direct_send_falls_back() {
        let mut core = core();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peers: PeerSenders = Default::default();
        let peer = NotebookId::new_v4();
        core.on_peer_link_up(peer);
        core.send_to_notebook(peer, "PING", &serde_json::json!({})).unwrap();
        let actions = core.take_actions();
        assert!(matches!(actions[..], [OutboundAction::SendDirect { .. }]));
        // Not connected to the relay either, so the fallback is stored.
        perform(&mut core, actions, &tx, &peers);
    }
}
