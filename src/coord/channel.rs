use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::coord::core::ProcessId;
use crate::coord::error::CoordError;
use crate::coord::message::Message;

/// Point-to-point delivery to named peers.
///
/// Each link is reliable and ordered while up. `send` is best effort: a send
/// on a down link is reported as `PeerUnreachable` and the message is dropped.
/// Inbound traffic arrives on the receiver paired with the channel at creation.
pub trait PeerChannel: Send + Sync {
    fn send(&self, peer: ProcessId, message: &Message) -> Result<(), CoordError>;

    fn is_reachable(&self, peer: ProcessId) -> bool;
}

/// What a transport hands to the process event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A fully framed and decoded message, in arrival order
    Message(Message),
    /// The link to this peer closed
    LinkDown(ProcessId),
}

/// In-memory routing table connecting every process of a local cluster
#[derive(Debug)]
pub struct ClusterChannels {
    /// Map from process ID to its inbound queue
    senders: HashMap<ProcessId, mpsc::UnboundedSender<Inbound>>,
    /// Directed link state, (from, to) -> up
    links: HashMap<(ProcessId, ProcessId), Arc<AtomicBool>>,
    /// Liveness per process; a crashed process neither sends nor receives
    alive: HashMap<ProcessId, Arc<AtomicBool>>,
}

impl ClusterChannels {
    /// Creates channels for the given members, all links up
    pub fn new(
        ids: &[ProcessId],
    ) -> (Self, HashMap<ProcessId, mpsc::UnboundedReceiver<Inbound>>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let mut links = HashMap::new();
        let mut alive = HashMap::new();

        for &id in ids {
            let (sender, receiver) = mpsc::unbounded_channel();
            senders.insert(id, sender);
            receivers.insert(id, receiver);
            alive.insert(id, Arc::new(AtomicBool::new(true)));
            for &other in ids {
                if other != id {
                    links.insert((id, other), Arc::new(AtomicBool::new(true)));
                }
            }
        }

        (
            Self {
                senders,
                links,
                alive,
            },
            receivers,
        )
    }

    /// Gets the list of all process IDs in the cluster
    pub fn all_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.senders.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Channel endpoint used by process `id`
    pub fn endpoint(self: &Arc<Self>, id: ProcessId) -> LocalEndpoint {
        LocalEndpoint {
            id,
            cluster: Arc::clone(self),
        }
    }

    pub fn is_alive(&self, id: ProcessId) -> bool {
        self.alive
            .get(&id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn link_up(&self, from: ProcessId, to: ProcessId) -> bool {
        self.is_alive(from)
            && self.is_alive(to)
            && self
                .links
                .get(&(from, to))
                .map(|flag| flag.load(Ordering::SeqCst))
                .unwrap_or(false)
    }

    /// Cuts both directions between `a` and `b` and tells both sides
    pub fn disconnect(&self, a: ProcessId, b: ProcessId) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(flag) = self.links.get(&(from, to)) {
                flag.store(false, Ordering::SeqCst);
            }
            if let Some(sender) = self.senders.get(&from) {
                let _ = sender.send(Inbound::LinkDown(to));
            }
        }
    }

    /// Restores both directions between `a` and `b`
    pub fn reconnect(&self, a: ProcessId, b: ProcessId) {
        for key in [(a, b), (b, a)] {
            if let Some(flag) = self.links.get(&key) {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Simulates a process failure: it goes silent and every survivor sees its link drop
    pub fn crash(&self, id: ProcessId) {
        if let Some(flag) = self.alive.get(&id) {
            flag.store(false, Ordering::SeqCst);
        }
        warn!(process_id = id, "Process crashed");
        for (&other, sender) in &self.senders {
            if other != id && self.is_alive(other) {
                let _ = sender.send(Inbound::LinkDown(id));
            }
        }
    }

    /// Delivers `message` from `from` to `to` if the link is up
    pub fn route(&self, from: ProcessId, to: ProcessId, message: Message) -> Result<(), CoordError> {
        if !self.link_up(from, to) {
            return Err(CoordError::PeerUnreachable(to));
        }
        match self.senders.get(&to) {
            Some(sender) => sender
                .send(Inbound::Message(message))
                .map_err(|_| CoordError::PeerUnreachable(to)),
            None => Err(CoordError::PeerUnreachable(to)),
        }
    }
}

/// One process's view of [`ClusterChannels`]
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    id: ProcessId,
    cluster: Arc<ClusterChannels>,
}

impl PeerChannel for LocalEndpoint {
    fn send(&self, peer: ProcessId, message: &Message) -> Result<(), CoordError> {
        debug!(
            process_id = self.id,
            "Sending {} to {}",
            message.message_type(),
            peer
        );
        self.cluster.route(self.id, peer, message.clone())
    }

    fn is_reachable(&self, peer: ProcessId) -> bool {
        self.cluster.link_up(self.id, peer)
    }
}
