use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::coord::core::{Context, ProcessId};
use crate::coord::error::CoordError;
use crate::coord::events::CoordEventKind;
use crate::coord::message::{Candidate, TreeMessage};
use crate::coord::timer::{TimerKey, WaveStep};

/// This process's part in one election wave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    /// `None` at the initiator
    pub parent: Option<ProcessId>,
    pub children: BTreeSet<ProcessId>,
    pub acked: BTreeSet<ProcessId>,
    /// Best node of the subtree rooted here, self included
    pub best: Candidate,
    /// All children answered and the result was passed on
    pub complete: bool,
}

impl Wave {
    fn new(parent: Option<ProcessId>, children: BTreeSet<ProcessId>, own: Candidate) -> Self {
        Self {
            parent,
            children,
            acked: BTreeSet::new(),
            best: own,
            complete: false,
        }
    }
}

/// Echo-style wave election over a static neighbor topology.
///
/// The initiator's id names the wave. ELECTION floods outward and builds a
/// spanning tree from the first sender each node hears from. ACKs flow back
/// carrying the best candidate of each subtree, and the root announces the
/// overall winner to the full group. Concurrent waves are resolved in favour
/// of the highest election id. Every wave send waits for the propagation delay.
#[derive(Debug)]
pub struct TreeElection {
    id: ProcessId,
    capacity: u64,
    peers: Vec<ProcessId>,
    neighbors: Vec<ProcessId>,
    propagation_delay: Duration,
    waves: BTreeMap<ProcessId, Wave>,
    current_leader: Option<ProcessId>,
}

impl TreeElection {
    pub fn new(
        id: ProcessId,
        capacity: u64,
        peers: Vec<ProcessId>,
        neighbors: Vec<ProcessId>,
        propagation_delay: Duration,
    ) -> Self {
        Self {
            id,
            capacity,
            peers,
            neighbors,
            propagation_delay,
            waves: BTreeMap::new(),
            current_leader: None,
        }
    }

    pub fn current_leader(&self) -> Option<ProcessId> {
        self.current_leader
    }

    pub fn wave(&self, election_id: ProcessId) -> Option<&Wave> {
        self.waves.get(&election_id)
    }

    fn own_candidate(&self) -> Candidate {
        Candidate::new(self.id, self.capacity)
    }

    pub fn start_election(&mut self, ctx: &mut Context<'_>) -> Result<(), CoordError> {
        if let Some((&highest, _)) = self.waves.last_key_value() {
            if highest >= self.id {
                return Err(CoordError::invalid(format!(
                    "wave {highest} is still running"
                )));
            }
        }

        self.abandon_below(ctx, self.id);
        info!(
            process_id = self.id,
            "Starting wave {} over neighbors {:?}", self.id, self.neighbors
        );
        ctx.emit(CoordEventKind::ElectionStarted {
            election_id: self.id,
        });

        if self.neighbors.is_empty() {
            info!(process_id = self.id, "No neighbors, announcing myself");
            self.announce(ctx, self.id);
            return Ok(());
        }

        let children = self.neighbors.iter().copied().collect();
        self.waves
            .insert(self.id, Wave::new(None, children, self.own_candidate()));
        self.schedule(ctx, self.id, WaveStep::Forward);
        Ok(())
    }

    pub fn on_message(
        &mut self,
        ctx: &mut Context<'_>,
        message: TreeMessage,
    ) -> Result<(), CoordError> {
        match message {
            TreeMessage::Election {
                sender_id,
                election_id,
            } => {
                self.on_election(ctx, sender_id, election_id);
                Ok(())
            }
            TreeMessage::Ack {
                sender_id,
                election_id,
                best_node,
            } => self.on_ack(ctx, sender_id, election_id, best_node),
            TreeMessage::Coordinator { leader_id, .. } => {
                self.on_coordinator(ctx, leader_id);
                Ok(())
            }
        }
    }

    fn on_election(&mut self, ctx: &mut Context<'_>, sender_id: ProcessId, election_id: ProcessId) {
        if let Some((&highest, _)) = self.waves.last_key_value() {
            if highest > election_id {
                debug!(
                    process_id = self.id,
                    "Wave {} from {} superseded by {}", election_id, sender_id, highest
                );
                self.null_ack(ctx, sender_id, election_id);
                return;
            }
        }
        self.abandon_below(ctx, election_id);

        if self.waves.contains_key(&election_id) {
            debug!(
                process_id = self.id,
                "Already in wave {}, null ACK to {}", election_id, sender_id
            );
            self.null_ack(ctx, sender_id, election_id);
            return;
        }

        let children: BTreeSet<ProcessId> = self
            .neighbors
            .iter()
            .copied()
            .filter(|&neighbor| neighbor != sender_id)
            .collect();
        debug!(
            process_id = self.id,
            "Joined wave {} under {}, children {:?}", election_id, sender_id, children
        );
        let step = if children.is_empty() {
            WaveStep::Report
        } else {
            WaveStep::Forward
        };
        self.waves.insert(
            election_id,
            Wave::new(Some(sender_id), children, self.own_candidate()),
        );
        self.schedule(ctx, election_id, step);
    }

    fn on_ack(
        &mut self,
        ctx: &mut Context<'_>,
        sender_id: ProcessId,
        election_id: ProcessId,
        best_node: Option<Candidate>,
    ) -> Result<(), CoordError> {
        let wave = self.waves.get_mut(&election_id).ok_or_else(|| {
            CoordError::stale(format!("ACK from {sender_id} for inactive wave {election_id}"))
        })?;
        if !wave.children.contains(&sender_id) {
            return Err(CoordError::stale(format!(
                "ACK from {sender_id}, not a child in wave {election_id}"
            )));
        }

        wave.acked.insert(sender_id);
        match best_node {
            Some(candidate) => {
                debug!(
                    process_id = self.id,
                    "ACK from {} in wave {}: best {} (capacity {})",
                    sender_id,
                    election_id,
                    candidate.id,
                    candidate.capacity
                );
                if candidate.outranks(&wave.best) {
                    wave.best = candidate;
                }
            }
            None => debug!(
                process_id = self.id,
                "Null ACK from {} in wave {}", sender_id, election_id
            ),
        }

        if wave.complete || wave.acked.len() < wave.children.len() {
            return Ok(());
        }
        wave.complete = true;
        let step = match wave.parent {
            None => {
                info!(
                    process_id = self.id,
                    "Wave {} complete, best is {}", election_id, wave.best.id
                );
                WaveStep::Announce
            }
            Some(_) => WaveStep::Report,
        };
        self.schedule(ctx, election_id, step);
        Ok(())
    }

    fn on_coordinator(&mut self, ctx: &mut Context<'_>, leader_id: ProcessId) {
        if self.current_leader != Some(leader_id) {
            info!(process_id = self.id, "Process {} is the new leader", leader_id);
            self.current_leader = Some(leader_id);
            ctx.emit(CoordEventKind::LeaderElected { leader_id });
        }
        let waves: Vec<ProcessId> = self.waves.keys().copied().collect();
        for election_id in waves {
            self.discard(ctx, election_id);
        }
    }

    /// Runs a delayed wave step; steps of discarded waves are dropped
    pub fn on_wave_timer(&mut self, ctx: &mut Context<'_>, election_id: ProcessId, step: WaveStep) {
        let Some(wave) = self.waves.get(&election_id) else {
            debug!(
                process_id = self.id,
                "Wave {} gone, skipping {:?}", election_id, step
            );
            return;
        };

        match (step, wave.parent) {
            (WaveStep::Forward, _) => {
                let children: Vec<ProcessId> = wave.children.iter().copied().collect();
                debug!(
                    process_id = self.id,
                    "Forwarding wave {} to {:?}", election_id, children
                );
                ctx.send_all(
                    &children,
                    TreeMessage::Election {
                        sender_id: self.id,
                        election_id,
                    },
                );
            }
            (WaveStep::Report, Some(parent)) => {
                let best = wave.best;
                debug!(
                    process_id = self.id,
                    "Reporting best {} of wave {} to {}", best.id, election_id, parent
                );
                ctx.send(
                    parent,
                    TreeMessage::Ack {
                        sender_id: self.id,
                        election_id,
                        best_node: Some(best),
                    },
                );
            }
            (WaveStep::Announce, None) => {
                let winner = wave.best.id;
                self.waves.remove(&election_id);
                self.announce(ctx, winner);
            }
            (step, parent) => debug!(
                process_id = self.id,
                "Step {:?} does not apply with parent {:?}", step, parent
            ),
        }
    }

    /// Broadcasts COORDINATOR to the whole group, self included
    fn announce(&mut self, ctx: &mut Context<'_>, leader_id: ProcessId) {
        info!(
            process_id = self.id,
            "Best node is {}, announcing it as leader", leader_id
        );
        let timestamp = ctx.tick();
        ctx.send_all(
            &self.peers,
            TreeMessage::Coordinator {
                sender_id: self.id,
                timestamp,
                leader_id,
            },
        );
    }

    fn null_ack(&self, ctx: &mut Context<'_>, to: ProcessId, election_id: ProcessId) {
        ctx.send(
            to,
            TreeMessage::Ack {
                sender_id: self.id,
                election_id,
                best_node: None,
            },
        );
    }

    fn abandon_below(&mut self, ctx: &mut Context<'_>, election_id: ProcessId) {
        let lower: Vec<ProcessId> = self.waves.range(..election_id).map(|(&id, _)| id).collect();
        for id in lower {
            debug!(
                process_id = self.id,
                "Abandoning wave {} for {}", id, election_id
            );
            self.discard(ctx, id);
        }
    }

    fn discard(&mut self, ctx: &mut Context<'_>, election_id: ProcessId) {
        if self.waves.remove(&election_id).is_some() {
            for step in [WaveStep::Forward, WaveStep::Report, WaveStep::Announce] {
                ctx.cancel(TimerKey::Wave { election_id, step });
            }
        }
    }

    fn schedule(&self, ctx: &mut Context<'_>, election_id: ProcessId, step: WaveStep) {
        ctx.schedule(TimerKey::Wave { election_id, step }, self.propagation_delay);
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            capacity: self.capacity,
            neighbors: self.neighbors.clone(),
            current_leader: self.current_leader,
            waves: self
                .waves
                .iter()
                .map(|(&election_id, wave)| WaveSnapshot {
                    election_id,
                    parent: wave.parent,
                    pending: wave.children.difference(&wave.acked).copied().collect(),
                    best: wave.best,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveSnapshot {
    pub election_id: ProcessId,
    pub parent: Option<ProcessId>,
    /// Children that have not acknowledged yet
    pub pending: Vec<ProcessId>,
    pub best: Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
    pub capacity: u64,
    pub neighbors: Vec<ProcessId>,
    pub current_leader: Option<ProcessId>,
    pub waves: Vec<WaveSnapshot>,
}

impl fmt::Display for TreeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Capacity: {}, neighbors {:?}", self.capacity, self.neighbors)?;
        match self.current_leader {
            Some(leader) => writeln!(f, "Current leader: {leader}")?,
            None => writeln!(f, "Current leader: unknown")?,
        }
        if self.waves.is_empty() {
            return writeln!(f, "No active elections");
        }
        for wave in &self.waves {
            let parent = wave
                .parent
                .map_or_else(|| "root".to_string(), |parent| parent.to_string());
            writeln!(
                f,
                "Wave {}: parent {}, waiting on {:?}, best {} (capacity {})",
                wave.election_id, parent, wave.pending, wave.best.id, wave.best.capacity
            )?;
        }
        Ok(())
    }
}
