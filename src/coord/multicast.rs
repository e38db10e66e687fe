use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use tracing::{debug, info};

use crate::coord::core::{Context, ProcessId};
use crate::coord::error::CoordError;
use crate::coord::events::CoordEventKind;
use crate::coord::message::MulticastMessage;

/// (origin timestamp, origin sender): the global delivery order
pub type MessageKey = (u64, ProcessId);

/// A multicast waiting for acknowledgements from the whole group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastEntry {
    pub content: String,
    pub timestamp: u64,
    pub sender_id: ProcessId,
    pub acks: BTreeSet<ProcessId>,
}

/// A multicast that has been handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub content: String,
    pub timestamp: u64,
    pub sender_id: ProcessId,
}

/// ISIS-style total-order multicast with positive acknowledgement.
///
/// Entries wait in a queue ordered by (timestamp, sender). The head is
/// delivered once every member has acknowledged it; an entry is never
/// delivered ahead of an earlier one. There is no retransmission, so an
/// unreachable member stalls delivery of every entry it has not acknowledged.
#[derive(Debug)]
pub struct TotalOrderMulticast {
    id: ProcessId,
    peers: Vec<ProcessId>,
    queue: BTreeMap<MessageKey, MulticastEntry>,
    /// ACKs that raced ahead of their MESSAGE
    ack_buffer: HashMap<MessageKey, BTreeSet<ProcessId>>,
    delivered: Vec<DeliveredMessage>,
    delivered_keys: HashSet<MessageKey>,
}

impl TotalOrderMulticast {
    /// `peers` is the full membership, this process included
    pub fn new(id: ProcessId, peers: Vec<ProcessId>) -> Self {
        Self {
            id,
            peers,
            queue: BTreeMap::new(),
            ack_buffer: HashMap::new(),
            delivered: Vec::new(),
            delivered_keys: HashSet::new(),
        }
    }

    /// Originates a MESSAGE: handled locally right away and sent to every peer
    pub fn multicast(&mut self, ctx: &mut Context<'_>, content: String) -> Result<(), CoordError> {
        if content.trim().is_empty() {
            return Err(CoordError::invalid("cannot multicast an empty message"));
        }

        let timestamp = ctx.tick();
        info!(
            process_id = self.id,
            "Multicasting \"{}\" at T={}", content, timestamp
        );
        ctx.send_all(
            &self.peers,
            MulticastMessage::Message {
                sender_id: self.id,
                timestamp,
                content,
            },
        );
        Ok(())
    }

    pub fn on_message(
        &mut self,
        ctx: &mut Context<'_>,
        message: MulticastMessage,
    ) -> Result<(), CoordError> {
        match message {
            MulticastMessage::Message {
                sender_id,
                timestamp,
                content,
            } => self.on_payload(ctx, sender_id, timestamp, content)?,
            MulticastMessage::Ack {
                original_timestamp,
                original_sender_id,
                ack_sender_id,
                ..
            } => self.on_ack((original_timestamp, original_sender_id), ack_sender_id)?,
        }
        self.deliver(ctx);
        Ok(())
    }

    fn on_payload(
        &mut self,
        ctx: &mut Context<'_>,
        sender_id: ProcessId,
        timestamp: u64,
        content: String,
    ) -> Result<(), CoordError> {
        let key = (timestamp, sender_id);
        if self.queue.contains_key(&key) || self.delivered_keys.contains(&key) {
            return Err(CoordError::stale(format!(
                "duplicate MESSAGE ({timestamp}, {sender_id})"
            )));
        }

        let acks = self.ack_buffer.remove(&key).unwrap_or_default();
        debug!(
            process_id = self.id,
            "Queued \"{}\" from {} @ T={} ({} early ACKs)",
            content,
            sender_id,
            timestamp,
            acks.len()
        );
        self.queue.insert(
            key,
            MulticastEntry {
                content,
                timestamp,
                sender_id,
                acks,
            },
        );

        let ack_timestamp = ctx.tick();
        ctx.send_all(
            &self.peers,
            MulticastMessage::Ack {
                sender_id: self.id,
                timestamp: ack_timestamp,
                original_timestamp: timestamp,
                original_sender_id: sender_id,
                ack_sender_id: self.id,
            },
        );
        Ok(())
    }

    fn on_ack(&mut self, key: MessageKey, ack_sender_id: ProcessId) -> Result<(), CoordError> {
        if let Some(entry) = self.queue.get_mut(&key) {
            entry.acks.insert(ack_sender_id);
            debug!(
                process_id = self.id,
                "ACK from {} for \"{}\" ({}/{})",
                ack_sender_id,
                entry.content,
                entry.acks.len(),
                self.peers.len()
            );
        } else if self.delivered_keys.contains(&key) {
            return Err(CoordError::stale(format!(
                "ACK from {} for delivered ({}, {})",
                ack_sender_id, key.0, key.1
            )));
        } else {
            debug!(
                process_id = self.id,
                "Buffering early ACK from {} for ({}, {})", ack_sender_id, key.0, key.1
            );
            self.ack_buffer.entry(key).or_default().insert(ack_sender_id);
        }
        Ok(())
    }

    /// Pops fully acknowledged entries off the head, stopping at the first that is not
    fn deliver(&mut self, ctx: &mut Context<'_>) {
        while let Some((_, head)) = self.queue.first_key_value() {
            if !self.peers.iter().all(|peer| head.acks.contains(peer)) {
                break;
            }
            let Some((key, entry)) = self.queue.pop_first() else {
                break;
            };
            info!(
                process_id = self.id,
                "DELIVERED \"{}\" (from {} @ T={})", entry.content, entry.sender_id, entry.timestamp
            );
            ctx.emit(CoordEventKind::MessageDelivered {
                sender_id: entry.sender_id,
                timestamp: entry.timestamp,
                content: entry.content.clone(),
            });
            self.delivered_keys.insert(key);
            self.delivered.push(DeliveredMessage {
                content: entry.content,
                timestamp: entry.timestamp,
                sender_id: entry.sender_id,
            });
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &MulticastEntry> {
        self.queue.values()
    }

    pub fn delivered(&self) -> &[DeliveredMessage] {
        &self.delivered
    }

    pub fn snapshot(&self) -> MulticastSnapshot {
        MulticastSnapshot {
            group_size: self.peers.len(),
            pending: self.queue.values().cloned().collect(),
            delivered: self.delivered.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastSnapshot {
    pub group_size: usize,
    /// Queue order; the first entry is the head
    pub pending: Vec<MulticastEntry>,
    pub delivered: Vec<DeliveredMessage>,
}

impl fmt::Display for MulticastSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pending queue:")?;
        if self.pending.is_empty() {
            writeln!(f, "  (empty)")?;
        }
        for (index, entry) in self.pending.iter().enumerate() {
            let marker = if index == 0 { "=>" } else { "  " };
            let acks: Vec<String> = entry.acks.iter().map(ToString::to_string).collect();
            writeln!(
                f,
                "{} {}. [T:{}, from:{}] \"{}\" | ACKs [{}] {}/{}",
                marker,
                index + 1,
                entry.timestamp,
                entry.sender_id,
                entry.content,
                acks.join(", "),
                entry.acks.len(),
                self.group_size
            )?;
        }
        writeln!(f, "Delivered:")?;
        if self.delivered.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for (index, message) in self.delivered.iter().enumerate() {
            writeln!(
                f,
                "   {}. [T:{}, from:{}] \"{}\"",
                index + 1,
                message.timestamp,
                message.sender_id,
                message.content
            )?;
        }
        Ok(())
    }
}
