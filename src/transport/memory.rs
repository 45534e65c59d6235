//! In-process rendezvous over duplex pipes.
//!
//! Mirrors swarm client/server semantics: a client-mode member connects to
//! every server-mode member on the same topic, each pair exactly once, and two
//! client-only members never see each other.

use super::{ConnectionCallback, JoinMode, Membership, PeerConnection, PeerId, Rendezvous, RendezvousError, Topic};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const PIPE_CAPACITY: usize = 256 * 1024;

struct Member {
    id: PeerId,
    token: u64,
    mode: JoinMode,
    on_connection: ConnectionCallback,
}

#[derive(Default)]
struct HubState {
    next_token: u64,
    topics: HashMap<Topic, Vec<Member>>,
}

/// Shared switchboard; clone it into every `MemoryRendezvous`.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendezvous endpoint with a fresh random identity
    pub fn endpoint(&self) -> MemoryRendezvous {
        self.endpoint_with_id(PeerId::random())
    }

    pub fn endpoint_with_id(&self, id: PeerId) -> MemoryRendezvous {
        MemoryRendezvous { hub: self.clone(), local_id: id }
    }

    /// Number of members currently joined to `topic`
    pub fn members(&self, topic: &Topic) -> usize {
        self.state.lock().topics.get(topic).map(|m| m.len()).unwrap_or(0)
    }

    /// Open a fresh pipe between two joined members, as a swarm does when
    /// the underlying link drops and is re-established.
    pub fn reconnect(&self, topic: &Topic, a: &PeerId, b: &PeerId) -> bool {
        let pair = {
            let state = self.state.lock();
            let members = match state.topics.get(topic) {
                Some(members) => members,
                None => return false,
            };
            let find = |id: &PeerId| members.iter().find(|m| &m.id == id).map(|m| m.on_connection.clone());
            match (find(a), find(b)) {
                (Some(cb_a), Some(cb_b)) => (cb_a, cb_b),
                _ => return false,
            }
        };
        connect_pair(a, &pair.0, b, &pair.1);
        true
    }

    fn leave(&self, topic: &Topic, token: u64) {
        let mut state = self.state.lock();
        if let Some(members) = state.topics.get_mut(topic) {
            members.retain(|m| m.token != token);
            if members.is_empty() {
                state.topics.remove(topic);
            }
        }
    }
}

fn connect_pair(a: &PeerId, a_cb: &ConnectionCallback, b: &PeerId, b_cb: &ConnectionCallback) {
    let (a_side, b_side) = tokio::io::duplex(PIPE_CAPACITY);
    debug!("Memory hub connecting {} <-> {}", a.short(), b.short());
    a_cb(PeerConnection { remote_id: b.clone(), stream: Box::new(a_side) });
    b_cb(PeerConnection { remote_id: a.clone(), stream: Box::new(b_side) });
}

/// One node's view of a `MemoryHub`.
#[derive(Clone)]
pub struct MemoryRendezvous {
    hub: MemoryHub,
    local_id: PeerId,
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn join(
        &self,
        topic: &Topic,
        mode: JoinMode,
        on_connection: ConnectionCallback,
    ) -> Result<Membership, RendezvousError> {
        let (token, peers) = {
            let mut state = self.hub.state.lock();
            let token = state.next_token;
            state.next_token += 1;

            let members = state.topics.entry(*topic).or_default();
            let peers: Vec<(PeerId, ConnectionCallback)> = members
                .iter()
                .filter(|m| m.id != self.local_id && (mode.is_server() || m.mode.is_server()))
                .map(|m| (m.id.clone(), m.on_connection.clone()))
                .collect();
            members.push(Member {
                id: self.local_id.clone(),
                token,
                mode,
                on_connection: on_connection.clone(),
            });
            (token, peers)
        };

        for (peer_id, peer_cb) in peers {
            connect_pair(&self.local_id, &on_connection, &peer_id, &peer_cb);
        }

        let hub = self.hub.clone();
        let topic_key = *topic;
        Ok(Membership::new(*topic).with_leave_hook(move || hub.leave(&topic_key, token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn collector() -> (ConnectionCallback, mpsc::UnboundedReceiver<PeerConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: ConnectionCallback = Arc::new(move |conn| {
            let _ = tx.send(conn);
        });
        (cb, rx)
    }

    #[tokio::test]
    async fn client_meets_server_once() {
        let hub = MemoryHub::new();
        let topic = Topic::random();
        let a = hub.endpoint();
        let b = hub.endpoint();
        let (cb_a, mut rx_a) = collector();
        let (cb_b, mut rx_b) = collector();

        let _ma = a.join(&topic, JoinMode::ClientAndServer, cb_a).await.unwrap();
        let _mb = b.join(&topic, JoinMode::Client, cb_b).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().remote_id, *b.local_id());
        assert_eq!(rx_b.recv().await.unwrap().remote_id, *a.local_id());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.members(&topic), 2);
    }

    #[tokio::test]
    async fn clients_do_not_meet() {
        let hub = MemoryHub::new();
        let topic = Topic::random();
        let (cb_a, mut rx_a) = collector();
        let (cb_b, mut rx_b) = collector();
        let _ma = hub.endpoint().join(&topic, JoinMode::Client, cb_a).await.unwrap();
        let _mb = hub.endpoint().join(&topic, JoinMode::Client, cb_b).await.unwrap();
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_removes_member() {
        let hub = MemoryHub::new();
        let topic = Topic::random();
        let (cb, _rx) = collector();
        let mut membership = hub.endpoint().join(&topic, JoinMode::ClientAndServer, cb).await.unwrap();
        assert_eq!(hub.members(&topic), 1);
        membership.leave();
        assert_eq!(hub.members(&topic), 0);
    }
}
