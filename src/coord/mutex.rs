use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info};

use crate::coord::core::{Context, ProcessId};
use crate::coord::error::CoordError;
use crate::coord::events::CoordEventKind;
use crate::coord::message::{MutexMessage, ReplyStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Released,
    Wanted,
    Held,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Released => write!(f, "RELEASED"),
            LockState::Wanted => write!(f, "WANTED"),
            LockState::Held => write!(f, "HELD"),
        }
    }
}

/// A REQUEST answered only once the resource is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredRequest {
    pub requester_id: ProcessId,
    pub timestamp: u64,
}

/// Local view of one shared resource
#[derive(Debug, Clone)]
pub struct ResourceLock {
    pub resource_id: String,
    pub state: LockState,
    /// Set only while WANTED
    pub request_timestamp: Option<u64>,
    /// Processes that granted the current request, self included
    pub replies: BTreeSet<ProcessId>,
    pub deferred: Vec<DeferredRequest>,
}

impl ResourceLock {
    fn new(resource_id: String) -> Self {
        Self {
            resource_id,
            state: LockState::Released,
            request_timestamp: None,
            replies: BTreeSet::new(),
            deferred: Vec::new(),
        }
    }
}

/// Ricart-Agrawala mutual exclusion over a set of named resources.
///
/// A process enters the critical section for a resource once every member of
/// the group has replied to its request. Competing requests are ordered by
/// (request timestamp, process id); the loser replies at once and the winner
/// defers its reply until it releases.
#[derive(Debug)]
pub struct MutualExclusion {
    id: ProcessId,
    peers: Vec<ProcessId>,
    resources: BTreeMap<String, ResourceLock>,
}

impl MutualExclusion {
    pub fn new(
        id: ProcessId,
        peers: Vec<ProcessId>,
        resources: impl IntoIterator<Item = String>,
    ) -> Self {
        let resources = resources
            .into_iter()
            .map(|resource_id| (resource_id.clone(), ResourceLock::new(resource_id)))
            .collect();
        Self {
            id,
            peers,
            resources,
        }
    }

    pub fn resource(&self, resource_id: &str) -> Option<&ResourceLock> {
        self.resources.get(resource_id)
    }

    pub fn state(&self, resource_id: &str) -> Option<LockState> {
        self.resources.get(resource_id).map(|lock| lock.state)
    }

    /// RELEASED -> WANTED, broadcasting REQUEST to every other member
    pub fn request(&mut self, ctx: &mut Context<'_>, resource_id: &str) -> Result<(), CoordError> {
        let lock = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| CoordError::invalid(format!("unknown resource {resource_id}")))?;
        if lock.state != LockState::Released {
            return Err(CoordError::invalid(format!(
                "cannot request {resource_id} while {}",
                lock.state
            )));
        }

        let timestamp = ctx.tick();
        lock.state = LockState::Wanted;
        lock.request_timestamp = Some(timestamp);
        lock.replies.clear();
        lock.replies.insert(self.id);
        info!(
            process_id = self.id,
            "Requesting {} at T={}", resource_id, timestamp
        );
        ctx.emit(CoordEventKind::ResourceRequested {
            resource_id: resource_id.to_string(),
            timestamp,
        });

        let others = self.peers.iter().filter(|&&peer| peer != self.id);
        ctx.send_all(
            others,
            MutexMessage::Request {
                sender_id: self.id,
                timestamp,
                resource_id: resource_id.to_string(),
            },
        );

        if Self::granted_by_all(&self.peers, lock) {
            Self::acquire(self.id, lock, ctx);
        }
        Ok(())
    }

    /// HELD -> RELEASED, answering every deferred request
    pub fn release(&mut self, ctx: &mut Context<'_>, resource_id: &str) -> Result<(), CoordError> {
        let lock = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| CoordError::invalid(format!("unknown resource {resource_id}")))?;
        if lock.state != LockState::Held {
            return Err(CoordError::invalid(format!(
                "cannot release {resource_id} while {}",
                lock.state
            )));
        }

        lock.state = LockState::Released;
        lock.request_timestamp = None;
        lock.replies.clear();
        let deferred = std::mem::take(&mut lock.deferred);
        info!(
            process_id = self.id,
            "Released {}, answering {} deferred request(s)",
            resource_id,
            deferred.len()
        );
        for request in &deferred {
            Self::reply(self.id, ctx, resource_id, request.requester_id);
        }
        ctx.emit(CoordEventKind::ResourceReleased {
            resource_id: resource_id.to_string(),
            deferred_replies: deferred.len(),
        });
        Ok(())
    }

    pub fn on_message(
        &mut self,
        ctx: &mut Context<'_>,
        message: MutexMessage,
    ) -> Result<(), CoordError> {
        match message {
            MutexMessage::Request {
                sender_id,
                timestamp,
                resource_id,
            } => {
                self.on_request(ctx, sender_id, timestamp, &resource_id);
                Ok(())
            }
            MutexMessage::Reply {
                sender_id,
                resource_id,
                recipient_id,
                status,
                ..
            } => self.on_reply(ctx, sender_id, &resource_id, recipient_id, status),
        }
    }

    fn on_request(
        &mut self,
        ctx: &mut Context<'_>,
        sender_id: ProcessId,
        timestamp: u64,
        resource_id: &str,
    ) {
        let Some(lock) = self.resources.get_mut(resource_id) else {
            debug!(
                process_id = self.id,
                "REQUEST for untracked {} from {}, granting", resource_id, sender_id
            );
            Self::reply(self.id, ctx, resource_id, sender_id);
            return;
        };

        let defer = match (lock.state, lock.request_timestamp) {
            (LockState::Held, _) => true,
            // Smaller (timestamp, id) has priority
            (LockState::Wanted, Some(own)) => (own, self.id) < (timestamp, sender_id),
            _ => false,
        };

        if defer {
            debug!(
                process_id = self.id,
                "Deferring {} for {} (T={}, own state {})", resource_id, sender_id, timestamp, lock.state
            );
            lock.deferred.retain(|request| request.requester_id != sender_id);
            lock.deferred.push(DeferredRequest {
                requester_id: sender_id,
                timestamp,
            });
            ctx.emit(CoordEventKind::RequestDeferred {
                resource_id: resource_id.to_string(),
                requester_id: sender_id,
            });
        } else {
            Self::reply(self.id, ctx, resource_id, sender_id);
        }
    }

    fn on_reply(
        &mut self,
        ctx: &mut Context<'_>,
        sender_id: ProcessId,
        resource_id: &str,
        recipient_id: ProcessId,
        status: ReplyStatus,
    ) -> Result<(), CoordError> {
        if recipient_id != self.id {
            return Err(CoordError::stale(format!(
                "REPLY from {sender_id} addressed to {recipient_id}"
            )));
        }
        if !self.peers.contains(&sender_id) {
            return Err(CoordError::stale(format!(
                "REPLY from {sender_id}, not a member of the group"
            )));
        }
        if status == ReplyStatus::Busy {
            debug!(process_id = self.id, "Ignoring BUSY from {} for {}", sender_id, resource_id);
            return Ok(());
        }
        let group_size = self.peers.len();
        let lock = match self.resources.get_mut(resource_id) {
            Some(lock) if lock.state == LockState::Wanted => lock,
            _ => {
                return Err(CoordError::stale(format!(
                    "REPLY from {sender_id} for {resource_id} not wanted"
                )))
            }
        };

        lock.replies.insert(sender_id);
        debug!(
            process_id = self.id,
            "REPLY from {} for {} ({}/{})",
            sender_id,
            resource_id,
            lock.replies.len(),
            group_size
        );
        if Self::granted_by_all(&self.peers, lock) {
            Self::acquire(self.id, lock, ctx);
        }
        Ok(())
    }

    fn granted_by_all(peers: &[ProcessId], lock: &ResourceLock) -> bool {
        peers.iter().all(|peer| lock.replies.contains(peer))
    }

    fn acquire(id: ProcessId, lock: &mut ResourceLock, ctx: &mut Context<'_>) {
        lock.state = LockState::Held;
        lock.request_timestamp = None;
        info!(process_id = id, "Acquired {}", lock.resource_id);
        ctx.emit(CoordEventKind::ResourceAcquired {
            resource_id: lock.resource_id.clone(),
        });
    }

    fn reply(id: ProcessId, ctx: &mut Context<'_>, resource_id: &str, to: ProcessId) {
        let timestamp = ctx.tick();
        ctx.send(
            to,
            MutexMessage::Reply {
                sender_id: id,
                timestamp,
                resource_id: resource_id.to_string(),
                recipient_id: to,
                status: ReplyStatus::Ok,
            },
        );
    }

    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        self.resources
            .values()
            .map(|lock| ResourceSnapshot {
                resource_id: lock.resource_id.clone(),
                state: lock.state,
                request_timestamp: lock.request_timestamp,
                replies_received: lock.replies.len(),
                replies_needed: self.peers.len(),
                deferred: lock.deferred.iter().map(|r| r.requester_id).collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub resource_id: String,
    pub state: LockState,
    pub request_timestamp: Option<u64>,
    pub replies_received: usize,
    pub replies_needed: usize,
    pub deferred: Vec<ProcessId>,
}

impl fmt::Display for ResourceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource_id, self.state)?;
        if let Some(timestamp) = self.request_timestamp {
            write!(
                f,
                " (T={}, replies {}/{})",
                timestamp, self.replies_received, self.replies_needed
            )?;
        }
        if !self.deferred.is_empty() {
            let deferred: Vec<String> = self.deferred.iter().map(ToString::to_string).collect();
            write!(f, " deferred [{}]", deferred.join(", "))?;
        }
        Ok(())
    }
}
