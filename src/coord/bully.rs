use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coord::core::{Context, ProcessId};
use crate::coord::error::CoordError;
use crate::coord::events::CoordEventKind;
use crate::coord::message::BullyMessage;
use crate::coord::timer::TimerKey;

/// Election role of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    Idle,
    Electing,
    Leader,
    Follower,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "IDLE"),
            ElectionState::Electing => write!(f, "ELECTING"),
            ElectionState::Leader => write!(f, "LEADER"),
            ElectionState::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Bully election where the lowest live id wins.
///
/// A candidate challenges every reachable process with a lower id. Any OK
/// means a better candidate is alive and the challenger steps back to wait for
/// its COORDINATOR; silence until the election timeout makes the challenger
/// the leader. Followers PING the leader on a fixed interval and start a new
/// election when it stops answering.
#[derive(Debug)]
pub struct BullyElection {
    id: ProcessId,
    peers: Vec<ProcessId>,
    state: ElectionState,
    current_leader: Option<ProcessId>,
    /// Incremented per election; scopes the election timeout
    attempt: u64,
    awaiting_pong: bool,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    pong_timeout: Duration,
}

impl BullyElection {
    pub fn new(
        id: ProcessId,
        peers: Vec<ProcessId>,
        election_timeout: Duration,
        heartbeat_interval: Duration,
        pong_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peers,
            state: ElectionState::Idle,
            current_leader: None,
            attempt: 0,
            awaiting_pong: false,
            election_timeout,
            heartbeat_interval,
            pong_timeout,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn current_leader(&self) -> Option<ProcessId> {
        self.current_leader
    }

    pub fn in_progress(&self) -> bool {
        self.state == ElectionState::Electing
    }

    pub fn start_election(&mut self, ctx: &mut Context<'_>) -> Result<(), CoordError> {
        if self.in_progress() {
            return Err(CoordError::invalid("an election is already in progress"));
        }

        self.attempt += 1;
        self.stop_monitoring(ctx);
        self.transition(ctx, ElectionState::Electing, "election started");
        ctx.emit(CoordEventKind::ElectionStarted {
            election_id: self.id,
        });

        let lower: Vec<ProcessId> = self
            .peers
            .iter()
            .copied()
            .filter(|&peer| peer < self.id && ctx.is_reachable(peer))
            .collect();

        if lower.is_empty() {
            info!(process_id = self.id, "No reachable lower id, taking leadership");
            self.become_leader(ctx);
            return Ok(());
        }

        info!(
            process_id = self.id,
            "Starting election {}, challenging {:?}", self.attempt, lower
        );
        let timestamp = ctx.tick();
        ctx.send_all(
            &lower,
            BullyMessage::Election {
                sender_id: self.id,
                timestamp,
            },
        );
        ctx.schedule(
            TimerKey::ElectionTimeout {
                attempt: self.attempt,
            },
            self.election_timeout,
        );
        Ok(())
    }

    pub fn on_message(
        &mut self,
        ctx: &mut Context<'_>,
        message: BullyMessage,
    ) -> Result<(), CoordError> {
        match message {
            BullyMessage::Election { sender_id, .. } => {
                debug!(process_id = self.id, "ELECTION from {}", sender_id);
                let timestamp = ctx.tick();
                ctx.send(
                    sender_id,
                    BullyMessage::Ok {
                        sender_id: self.id,
                        timestamp,
                    },
                );
                if self.in_progress() {
                    debug!(process_id = self.id, "Already electing");
                    return Ok(());
                }
                self.start_election(ctx)
            }
            BullyMessage::Ok { sender_id, .. } => {
                if !self.in_progress() {
                    return Err(CoordError::stale(format!("OK from {sender_id} outside an election")));
                }
                info!(
                    process_id = self.id,
                    "OK from {}, waiting for COORDINATOR", sender_id
                );
                ctx.cancel(TimerKey::ElectionTimeout {
                    attempt: self.attempt,
                });
                self.transition(ctx, ElectionState::Follower, "lower id answered");
                Ok(())
            }
            BullyMessage::Coordinator { leader_id, .. } => {
                self.on_coordinator(ctx, leader_id);
                Ok(())
            }
            BullyMessage::Ping { sender_id } => {
                ctx.send(sender_id, BullyMessage::Pong { sender_id: self.id });
                Ok(())
            }
            BullyMessage::Pong { sender_id } => {
                if Some(sender_id) != self.current_leader || !self.awaiting_pong {
                    return Err(CoordError::stale(format!("unexpected PONG from {sender_id}")));
                }
                self.awaiting_pong = false;
                ctx.cancel(TimerKey::PongDeadline);
                Ok(())
            }
        }
    }

    pub fn on_timer(&mut self, ctx: &mut Context<'_>, key: TimerKey) {
        match key {
            TimerKey::ElectionTimeout { attempt } => {
                if attempt != self.attempt || !self.in_progress() {
                    debug!(
                        process_id = self.id,
                        "Ignoring election timeout of attempt {}", attempt
                    );
                    return;
                }
                info!(process_id = self.id, "Election timed out without OK");
                self.become_leader(ctx);
            }
            TimerKey::Heartbeat => self.heartbeat(ctx),
            TimerKey::PongDeadline => {
                if !self.awaiting_pong {
                    return;
                }
                if let Some(leader) = self.current_leader {
                    warn!(process_id = self.id, "Leader {} missed its PONG", leader);
                    self.suspect(ctx, leader);
                }
            }
            TimerKey::Wave { .. } => {}
        }
    }

    /// Transport lost its link to `peer`
    pub fn on_link_down(&mut self, ctx: &mut Context<'_>, peer: ProcessId) {
        if self.current_leader == Some(peer) && peer != self.id {
            warn!(process_id = self.id, "Link to leader {} went down", peer);
            self.suspect(ctx, peer);
        }
    }

    fn on_coordinator(&mut self, ctx: &mut Context<'_>, leader_id: ProcessId) {
        if self.current_leader == Some(leader_id) {
            if leader_id == self.id {
                return;
            }
            // Re-announced leader: ends our election, and any election since
            // the last announcement stopped monitoring
            if self.in_progress() {
                ctx.cancel(TimerKey::ElectionTimeout {
                    attempt: self.attempt,
                });
                self.transition(ctx, ElectionState::Follower, "leader re-announced");
            }
            if self.state == ElectionState::Follower {
                self.monitor(ctx);
            }
            return;
        }

        info!(process_id = self.id, "Process {} is the new leader", leader_id);
        ctx.cancel(TimerKey::ElectionTimeout {
            attempt: self.attempt,
        });
        self.stop_monitoring(ctx);
        self.current_leader = Some(leader_id);
        ctx.emit(CoordEventKind::LeaderElected { leader_id });
        if leader_id == self.id {
            self.transition(ctx, ElectionState::Leader, "announced as leader");
        } else {
            self.transition(ctx, ElectionState::Follower, "COORDINATOR received");
            self.monitor(ctx);
        }
    }

    fn become_leader(&mut self, ctx: &mut Context<'_>) {
        ctx.cancel(TimerKey::ElectionTimeout {
            attempt: self.attempt,
        });
        self.stop_monitoring(ctx);
        self.current_leader = Some(self.id);
        self.transition(ctx, ElectionState::Leader, "no lower id answered");
        info!(process_id = self.id, "Announcing myself as leader");
        ctx.emit(CoordEventKind::LeaderElected {
            leader_id: self.id,
        });

        let timestamp = ctx.tick();
        let others = self.peers.iter().filter(|&&peer| peer != self.id);
        ctx.send_all(
            others,
            BullyMessage::Coordinator {
                sender_id: self.id,
                timestamp,
                leader_id: self.id,
            },
        );
    }

    fn heartbeat(&mut self, ctx: &mut Context<'_>) {
        let leader = match self.current_leader {
            Some(leader) if leader != self.id && self.state == ElectionState::Follower => leader,
            _ => return,
        };

        if !ctx.is_reachable(leader) {
            warn!(process_id = self.id, "Leader {} unreachable for PING", leader);
            self.suspect(ctx, leader);
            return;
        }

        ctx.send(leader, BullyMessage::Ping { sender_id: self.id });
        if !self.awaiting_pong {
            self.awaiting_pong = true;
            ctx.schedule(TimerKey::PongDeadline, self.pong_timeout);
        }
        ctx.schedule(TimerKey::Heartbeat, self.heartbeat_interval);
    }

    fn monitor(&mut self, ctx: &mut Context<'_>) {
        ctx.schedule(TimerKey::Heartbeat, self.heartbeat_interval);
    }

    fn stop_monitoring(&mut self, ctx: &mut Context<'_>) {
        self.awaiting_pong = false;
        ctx.cancel(TimerKey::Heartbeat);
        ctx.cancel(TimerKey::PongDeadline);
    }

    /// Forgets the leader and runs a new election
    fn suspect(&mut self, ctx: &mut Context<'_>, leader: ProcessId) {
        ctx.emit(CoordEventKind::LeaderSuspected { leader_id: leader });
        self.current_leader = None;
        self.stop_monitoring(ctx);
        if self.in_progress() {
            return;
        }
        if let Err(error) = self.start_election(ctx) {
            warn!(process_id = self.id, "Could not start election: {}", error);
        }
    }

    fn transition(&mut self, ctx: &mut Context<'_>, to: ElectionState, reason: &str) {
        if self.state == to {
            return;
        }
        debug!(
            process_id = self.id,
            "{} -> {} ({})", self.state, to, reason
        );
        ctx.emit(CoordEventKind::StateChange {
            from_state: self.state,
            to_state: to,
            reason: reason.to_string(),
        });
        self.state = to;
    }

    pub fn snapshot(&self) -> BullySnapshot {
        BullySnapshot {
            state: self.state,
            current_leader: self.current_leader,
            in_progress: self.in_progress(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BullySnapshot {
    pub state: ElectionState,
    pub current_leader: Option<ProcessId>,
    pub in_progress: bool,
}

impl fmt::Display for BullySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State: {}", self.state)?;
        match self.current_leader {
            Some(leader) => writeln!(f, "Current leader: {leader}")?,
            None => writeln!(f, "Current leader: unknown")?,
        }
        writeln!(
            f,
            "Election in progress: {}",
            if self.in_progress { "yes" } else { "no" }
        )
    }
}
