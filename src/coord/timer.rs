use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::coord::core::ProcessId;

/// Step of a wave election that runs after the propagation delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WaveStep {
    /// Send ELECTION to every child
    Forward,
    /// Send the aggregated ACK to the parent
    Report,
    /// Root only: announce the winner
    Announce,
}

/// Identifies a pending timer. Scheduling a key that is already pending replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Bully: give up waiting for OK in the given election attempt
    ElectionTimeout { attempt: u64 },
    /// Bully: time to PING the leader
    Heartbeat,
    /// Bully: PONG did not arrive in time
    PongDeadline,
    /// Tree: delayed wave step
    Wave {
        election_id: ProcessId,
        step: WaveStep,
    },
}

/// Deadline table driven by the process event loop
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKey, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `key` to fire `after` from `now`, replacing any earlier deadline for it
    pub fn schedule(&mut self, key: TimerKey, now: Instant, after: Duration) {
        self.deadlines.insert(key, now + after);
    }

    /// Disarms `key`; returns whether it was pending
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns every timer due at `now`, earliest first
    pub fn expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(Instant, TimerKey)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, *key))
            .collect();
        due.sort();
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_in_deadline_order() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(TimerKey::Heartbeat, now, Duration::from_millis(30));
        timers.schedule(TimerKey::PongDeadline, now, Duration::from_millis(10));
        timers.schedule(
            TimerKey::ElectionTimeout { attempt: 1 },
            now,
            Duration::from_millis(100),
        );

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        let due = timers.expired(now + Duration::from_millis(50));
        assert_eq!(due, vec![TimerKey::PongDeadline, TimerKey::Heartbeat]);
        assert_eq!(timers.len(), 1);
        assert!(timers.is_pending(&TimerKey::ElectionTimeout { attempt: 1 }));
    }

    #[test]
    fn test_reschedule_replaces_and_cancel_disarms() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(TimerKey::Heartbeat, now, Duration::from_millis(10));
        timers.schedule(TimerKey::Heartbeat, now, Duration::from_millis(40));
        assert!(timers.expired(now + Duration::from_millis(20)).is_empty());

        assert!(timers.cancel(&TimerKey::Heartbeat));
        assert!(!timers.cancel(&TimerKey::Heartbeat));
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
