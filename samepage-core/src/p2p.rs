//! Direct peer routing: use a live direct link when one exists, else the relay.
//!
//! Messages sent directly are tracked until the host confirms delivery, so a
//! failed link hands them back for re-sending over the relay.

use std::collections::HashMap;

use uuid::Uuid;

use crate::identity::NotebookId;
use crate::protocol::{LogicalMessage, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Direct(NotebookId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Up,
    /// A send failed; unused until the host reports the link up again.
    Failed,
}

pub struct P2pRouter {
    links: HashMap<NotebookId, LinkState>,
    in_flight: HashMap<Uuid, (NotebookId, LogicalMessage)>,
    max_in_flight: usize,
}

impl P2pRouter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            links: HashMap::new(),
            in_flight: HashMap::new(),
            max_in_flight,
        }
    }

    pub fn on_link_up(&mut self, peer: NotebookId) {
        self.links.insert(peer, LinkState::Up);
    }

    /// Link closed. Returns messages that were in flight on it.
    pub fn on_link_down(&mut self, peer: NotebookId) -> Vec<LogicalMessage> {
        self.links.remove(&peer);
        self.take_in_flight(peer)
    }

    pub fn is_up(&self, peer: &NotebookId) -> bool {
        self.links.get(peer) == Some(&LinkState::Up)
    }

    pub fn peers(&self) -> Vec<NotebookId> {
        let mut up: Vec<NotebookId> = self
            .links
            .iter()
            .filter(|(_, s)| **s == LinkState::Up)
            .map(|(p, _)| *p)
            .collect();
        up.sort();
        up
    }

    pub fn route(&self, target: &Target) -> Route {
        match target {
            Target::Notebook(peer)
                if self.is_up(peer) && self.in_flight.len() < self.max_in_flight =>
            {
                Route::Direct(*peer)
            }
            _ => Route::Primary,
        }
    }

    pub fn track(&mut self, peer: NotebookId, message: LogicalMessage) {
        self.in_flight.insert(message.id, (peer, message));
    }

    pub fn on_delivered(&mut self, message_id: &Uuid) -> bool {
        self.in_flight.remove(message_id).is_some()
    }

    /// A direct send failed: stop using the link and hand back everything in flight on it.
    pub fn on_send_failed(&mut self, peer: NotebookId) -> Vec<LogicalMessage> {
        if let Some(state) = self.links.get_mut(&peer) {
            *state = LinkState::Failed;
        }
        self.take_in_flight(peer)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn take_in_flight(&mut self, peer: NotebookId) -> Vec<LogicalMessage> {
        let ids: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, (p, _))| *p == peer)
            .map(|(id, _)| *id)
            .collect();
        let mut out: Vec<LogicalMessage> = ids
            .into_iter()
            .filter_map(|id| self.in_flight.remove(&id).map(|(_, m)| m))
            .collect();
        out.sort_by_key(|m| m.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SHARE_PAGE_UPDATE;

    fn msg_to(peer: NotebookId) -> LogicalMessage {
        LogicalMessage::new(SHARE_PAGE_UPDATE, serde_json::Value::Null, Target::Notebook(peer))
    }

    #[test]
    fn routes_direct_only_with_live_link() {
        let mut r = P2pRouter::new(8);
        let peer = NotebookId::new_v4();
        assert_eq!(r.route(&Target::Notebook(peer)), Route::Primary);
        r.on_link_up(peer);
        assert_eq!(r.route(&Target::Notebook(peer)), Route::Direct(peer));
        assert_eq!(r.route(&Target::Broadcast), Route::Primary);
    }

    #[test]
    fn failed_send_returns_messages_and_disables_link() {
        let mut r = P2pRouter::new(8);
        let peer = NotebookId::new_v4();
        r.on_link_up(peer);
        let a = msg_to(peer);
        let b = msg_to(peer);
        r.track(peer, a.clone());
        r.track(peer, b.clone());
        assert!(r.on_delivered(&a.id));
        let back = r.on_send_failed(peer);
        assert_eq!(back, vec![b]);
        assert_eq!(r.route(&Target::Notebook(peer)), Route::Primary);
        r.on_link_up(peer);
        assert_eq!(r.route(&Target::Notebook(peer)), Route::Direct(peer));
    }

    #[test]
    fn link_down_returns_only_that_peers_messages() {
        let mut r = P2pRouter::new(8);
        let p1 = NotebookId::new_v4();
        let p2 = NotebookId::new_v4();
        r.on_link_up(p1);
        r.on_link_up(p2);
        r.track(p1, msg_to(p1));
        r.track(p2, msg_to(p2));
        assert_eq!(r.on_link_down(p1).len(), 1);
        assert_eq!(r.in_flight(), 1);
        assert_eq!(r.peers(), vec![p2]);
    }

    #[test]
    fn in_flight_bound_spills_to_primary() {
        let mut r = P2pRouter::new(1);
        let peer = NotebookId::new_v4();
        r.on_link_up(peer);
        r.track(peer, msg_to(peer));
        assert_eq!(r.route(&Target::Notebook(peer)), Route::Primary);
    }
}
