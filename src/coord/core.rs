use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::coord::bully::{BullyElection, BullySnapshot};
use crate::coord::channel::PeerChannel;
use crate::coord::clock::LamportClock;
use crate::coord::config::ClusterConfig;
use crate::coord::error::CoordError;
use crate::coord::events::CoordEventKind;
use crate::coord::message::Message;
use crate::coord::multicast::{MulticastSnapshot, TotalOrderMulticast};
use crate::coord::mutex::{MutualExclusion, ResourceSnapshot};
use crate::coord::timer::TimerKey;
use crate::coord::tree::{TreeElection, TreeSnapshot};

/// Type alias for process identifiers in the group
pub type ProcessId = u32;

/// Protocol family a process runs; selects the wire decoder and state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Total-order multicast
    Multicast,
    /// Ricart-Agrawala mutual exclusion
    Mutex,
    /// Inverted Bully election over the full mesh
    Bully,
    /// Capacity-weighted wave election over a spanning tree
    Tree,
}

impl Protocol {
    /// Wire tags understood by this protocol family
    pub fn message_types(&self) -> &'static [&'static str] {
        match self {
            Protocol::Multicast => &["MESSAGE", "ACK"],
            Protocol::Mutex => &["REQUEST", "REPLY"],
            Protocol::Bully => &["ELECTION", "OK", "COORDINATOR", "PING", "PONG"],
            Protocol::Tree => &["ELECTION", "ACK", "COORDINATOR"],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Multicast => write!(f, "multicast"),
            Protocol::Mutex => write!(f, "mutex"),
            Protocol::Bully => write!(f, "bully"),
            Protocol::Tree => write!(f, "tree"),
        }
    }
}

/// Side effect requested by a state machine, executed by the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send { to: ProcessId, message: Message },
    Schedule { key: TimerKey, after: Duration },
    Cancel(TimerKey),
    Emit(CoordEventKind),
}

/// Per-step view of the owning process handed to every protocol handler
pub struct Context<'a> {
    /// Local process id
    pub id: ProcessId,
    clock: &'a mut LamportClock,
    channel: &'a dyn PeerChannel,
    effects: Vec<Effect>,
}

impl<'a> Context<'a> {
    pub fn new(id: ProcessId, clock: &'a mut LamportClock, channel: &'a dyn PeerChannel) -> Self {
        Self {
            id,
            clock,
            channel,
            effects: Vec::new(),
        }
    }

    /// Advances the clock for a message this process originates
    pub fn tick(&mut self) -> u64 {
        self.clock.tick()
    }

    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    /// Self is always reachable
    pub fn is_reachable(&self, peer: ProcessId) -> bool {
        peer == self.id || self.channel.is_reachable(peer)
    }

    pub fn send(&mut self, to: ProcessId, message: impl Into<Message>) {
        self.effects.push(Effect::Send {
            to,
            message: message.into(),
        });
    }

    /// Sends one copy of `message` to every listed process, self included if listed
    pub fn send_all<'p>(
        &mut self,
        to: impl IntoIterator<Item = &'p ProcessId>,
        message: impl Into<Message>,
    ) {
        let message = message.into();
        for peer in to {
            self.send(*peer, message.clone());
        }
    }

    pub fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.effects.push(Effect::Schedule { key, after });
    }

    pub fn cancel(&mut self, key: TimerKey) {
        self.effects.push(Effect::Cancel(key));
    }

    pub fn emit(&mut self, kind: CoordEventKind) {
        self.effects.push(Effect::Emit(kind));
    }

    pub(crate) fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

/// Operator entry points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Multicast(String),
    Request(String),
    Release(String),
    StartElection,
}

/// The protocol state machine a process runs
#[derive(Debug)]
pub enum Algorithm {
    Multicast(TotalOrderMulticast),
    Mutex(MutualExclusion),
    Bully(BullyElection),
    Tree(TreeElection),
}

impl Algorithm {
    pub fn protocol(&self) -> Protocol {
        match self {
            Algorithm::Multicast(_) => Protocol::Multicast,
            Algorithm::Mutex(_) => Protocol::Mutex,
            Algorithm::Bully(_) => Protocol::Bully,
            Algorithm::Tree(_) => Protocol::Tree,
        }
    }
}

/// Read-only view of a process for the operator surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub clock: u64,
    pub state: AlgorithmSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmSnapshot {
    Multicast(MulticastSnapshot),
    Mutex(Vec<ResourceSnapshot>),
    Bully(BullySnapshot),
    Tree(TreeSnapshot),
}

impl ProcessSnapshot {
    /// Leader currently known by an election process
    pub fn leader(&self) -> Option<ProcessId> {
        match &self.state {
            AlgorithmSnapshot::Bully(bully) => bully.current_leader,
            AlgorithmSnapshot::Tree(tree) => tree.current_leader,
            _ => None,
        }
    }
}

impl fmt::Display for ProcessSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Process {} [clock {}]", self.id, self.clock)?;
        match &self.state {
            AlgorithmSnapshot::Multicast(multicast) => write!(f, "{multicast}"),
            AlgorithmSnapshot::Mutex(resources) => {
                for resource in resources {
                    writeln!(f, "{resource}")?;
                }
                Ok(())
            }
            AlgorithmSnapshot::Bully(bully) => write!(f, "{bully}"),
            AlgorithmSnapshot::Tree(tree) => write!(f, "{tree}"),
        }
    }
}

/// One member of the group: its clock and the state machine it runs.
///
/// Handlers run to completion. Messages a handler addresses to this process
/// are looped back and handled before the call returns, so the returned
/// effects never contain a send to self.
#[derive(Debug)]
pub struct Process {
    pub id: ProcessId,
    clock: LamportClock,
    algorithm: Algorithm,
}

impl Process {
    pub fn new(id: ProcessId, algorithm: Algorithm) -> Self {
        Self {
            id,
            clock: LamportClock::new(),
            algorithm,
        }
    }

    /// Builds the state machine for `protocol` from the shared cluster configuration
    pub fn from_config(
        id: ProcessId,
        protocol: Protocol,
        config: &ClusterConfig,
    ) -> Result<Self, CoordError> {
        config.validate(id)?;
        let peers = config.peer_ids();
        let timing = &config.timing;
        let algorithm = match protocol {
            Protocol::Multicast => Algorithm::Multicast(TotalOrderMulticast::new(id, peers)),
            Protocol::Mutex => Algorithm::Mutex(MutualExclusion::new(
                id,
                peers,
                config.resources.iter().cloned(),
            )),
            Protocol::Bully => Algorithm::Bully(BullyElection::new(
                id,
                peers,
                timing.election_timeout(),
                timing.heartbeat_interval(),
                timing.pong_timeout(),
            )),
            Protocol::Tree => Algorithm::Tree(TreeElection::new(
                id,
                config.capacity(id),
                peers,
                config.neighbors(id),
                timing.propagation_delay(),
            )),
        };
        Ok(Self::new(id, algorithm))
    }

    pub fn protocol(&self) -> Protocol {
        self.algorithm.protocol()
    }

    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    /// Handles one inbound message
    pub fn handle_message(&mut self, message: Message, channel: &dyn PeerChannel) -> Vec<Effect> {
        let effects = self.receive(message, channel);
        self.settle(effects, channel)
    }

    /// Handles an expired timer
    pub fn handle_timer(&mut self, key: TimerKey, channel: &dyn PeerChannel) -> Vec<Effect> {
        let mut ctx = Context::new(self.id, &mut self.clock, channel);
        match (&mut self.algorithm, key) {
            (Algorithm::Bully(bully), key) => bully.on_timer(&mut ctx, key),
            (Algorithm::Tree(tree), TimerKey::Wave { election_id, step }) => {
                tree.on_wave_timer(&mut ctx, election_id, step)
            }
            (_, key) => debug!(process_id = self.id, "Ignoring unrelated timer {:?}", key),
        }
        let effects = ctx.into_effects();
        self.settle(effects, channel)
    }

    /// Runs an operator command; on error nothing was changed
    pub fn handle_command(
        &mut self,
        command: Command,
        channel: &dyn PeerChannel,
    ) -> Result<Vec<Effect>, CoordError> {
        let mut ctx = Context::new(self.id, &mut self.clock, channel);
        match (&mut self.algorithm, command) {
            (Algorithm::Multicast(multicast), Command::Multicast(content)) => {
                multicast.multicast(&mut ctx, content)?
            }
            (Algorithm::Mutex(mutex), Command::Request(resource_id)) => {
                mutex.request(&mut ctx, &resource_id)?
            }
            (Algorithm::Mutex(mutex), Command::Release(resource_id)) => {
                mutex.release(&mut ctx, &resource_id)?
            }
            (Algorithm::Bully(bully), Command::StartElection) => bully.start_election(&mut ctx)?,
            (Algorithm::Tree(tree), Command::StartElection) => tree.start_election(&mut ctx)?,
            (algorithm, command) => {
                return Err(CoordError::invalid(format!(
                    "{:?} is not supported by the {} protocol",
                    command,
                    algorithm.protocol()
                )));
            }
        }
        let effects = ctx.into_effects();
        Ok(self.settle(effects, channel))
    }

    /// Transport reported that the outbound link to `peer` closed
    pub fn handle_link_down(&mut self, peer: ProcessId, channel: &dyn PeerChannel) -> Vec<Effect> {
        let mut ctx = Context::new(self.id, &mut self.clock, channel);
        if let Algorithm::Bully(bully) = &mut self.algorithm {
            bully.on_link_down(&mut ctx, peer);
        }
        let effects = ctx.into_effects();
        self.settle(effects, channel)
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let state = match &self.algorithm {
            Algorithm::Multicast(multicast) => AlgorithmSnapshot::Multicast(multicast.snapshot()),
            Algorithm::Mutex(mutex) => AlgorithmSnapshot::Mutex(mutex.snapshot()),
            Algorithm::Bully(bully) => AlgorithmSnapshot::Bully(bully.snapshot()),
            Algorithm::Tree(tree) => AlgorithmSnapshot::Tree(tree.snapshot()),
        };
        ProcessSnapshot {
            id: self.id,
            clock: self.clock.value(),
            state,
        }
    }

    /// Clock update, then dispatch to the owning state machine
    fn receive(&mut self, message: Message, channel: &dyn PeerChannel) -> Vec<Effect> {
        let protocol = self.protocol();
        if message.protocol() != Some(protocol) {
            let error = match &message {
                Message::Unrecognized { tag } => CoordError::UnknownMessageType(tag.clone()),
                other => CoordError::UnknownMessageType(format!(
                    "{} ({:?} traffic)",
                    other.message_type(),
                    other.protocol()
                )),
            };
            warn!(process_id = self.id, "Dropping message: {}", error);
            return Vec::new();
        }

        let clock = self.clock.observe(message.timestamp().unwrap_or(0));
        trace!(
            process_id = self.id,
            clock,
            "Received {} from {:?}",
            message.message_type(),
            message.sender_id()
        );

        let mut ctx = Context::new(self.id, &mut self.clock, channel);
        let result = match (&mut self.algorithm, message) {
            (Algorithm::Multicast(multicast), Message::Multicast(message)) => {
                multicast.on_message(&mut ctx, message)
            }
            (Algorithm::Mutex(mutex), Message::Mutex(message)) => mutex.on_message(&mut ctx, message),
            (Algorithm::Bully(bully), Message::Bully(message)) => bully.on_message(&mut ctx, message),
            (Algorithm::Tree(tree), Message::Tree(message)) => tree.on_message(&mut ctx, message),
            // Protocol mismatch was rejected above
            _ => Ok(()),
        };
        match result {
            Err(CoordError::StaleMessage(reason)) => {
                debug!(process_id = self.id, "Discarding stale message: {}", reason)
            }
            Err(error) => warn!(process_id = self.id, "Message rejected: {}", error),
            Ok(()) => {}
        }
        ctx.into_effects()
    }

    /// Handles loop-back sends synchronously, returning only outward effects in order
    fn settle(&mut self, effects: Vec<Effect>, channel: &dyn PeerChannel) -> Vec<Effect> {
        let mut outward = Vec::with_capacity(effects.len());
        let mut loopback = VecDeque::new();
        self.split_loopback(effects, &mut outward, &mut loopback);

        while let Some(message) = loopback.pop_front() {
            let effects = self.receive(message, channel);
            self.split_loopback(effects, &mut outward, &mut loopback);
        }
        outward
    }

    fn split_loopback(
        &self,
        effects: Vec<Effect>,
        outward: &mut Vec<Effect>,
        loopback: &mut VecDeque<Message>,
    ) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } if to == self.id => loopback.push_back(message),
                other => outward.push(other),
            }
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Process{} [{}] clock:{}",
            self.id,
            self.protocol(),
            self.clock.value()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::message::{MulticastMessage, MutexMessage};

    struct AllReachable;

    impl PeerChannel for AllReachable {
        fn send(&self, _peer: ProcessId, _message: &Message) -> Result<(), CoordError> {
            Ok(())
        }

        fn is_reachable(&self, _peer: ProcessId) -> bool {
            true
        }
    }

    fn multicast_process(id: ProcessId) -> Process {
        Process::new(
            id,
            Algorithm::Multicast(TotalOrderMulticast::new(id, vec![1, 2, 3])),
        )
    }

    #[test]
    fn test_receive_advances_clock_past_message() {
        let mut process = multicast_process(1);
        process.handle_message(
            MulticastMessage::Message {
                sender_id: 2,
                timestamp: 10,
                content: "hello".to_string(),
            }
            .into(),
            &AllReachable,
        );
        // observe(10) = 11, the ACK tick = 12, loop-back ACK observe(12) = 13
        assert_eq!(process.clock(), 13);
    }

    #[test]
    fn test_loopback_sends_never_leave_the_process() {
        let mut process = multicast_process(1);
        let effects = process
            .handle_command(Command::Multicast("hi".to_string()), &AllReachable)
            .unwrap();
        assert!(effects.iter().all(|effect| !matches!(
            effect,
            Effect::Send { to: 1, .. }
        )));
        // MESSAGE and ACK to both peers, MESSAGE first on each link
        let sends: Vec<(ProcessId, &str)> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send { to, message } => Some((*to, message.message_type())),
                _ => None,
            })
            .collect();
        assert_eq!(
            sends,
            vec![(2, "MESSAGE"), (3, "MESSAGE"), (2, "ACK"), (3, "ACK")]
        );
    }

    #[test]
    fn test_foreign_protocol_traffic_is_dropped() {
        let mut process = multicast_process(1);
        let effects = process.handle_message(
            MutexMessage::Request {
                sender_id: 2,
                timestamp: 50,
                resource_id: "r1".to_string(),
            }
            .into(),
            &AllReachable,
        );
        assert!(effects.is_empty());
        assert_eq!(process.clock(), 0);

        let effects = process.handle_message(
            Message::Unrecognized {
                tag: "HELLO".to_string(),
            },
            &AllReachable,
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_unsupported_command_is_invalid() {
        let mut process = multicast_process(1);
        let result = process.handle_command(Command::StartElection, &AllReachable);
        assert!(matches!(result, Err(CoordError::InvalidOperation(_))));
        assert_eq!(process.clock(), 0);
    }
}
