/// Process, state machine dispatch and effects
pub mod core;

/// Lamport logical clock
pub mod clock;

/// Wire messages for every protocol family
pub mod message;

/// Error taxonomy shared by all protocols
pub mod error;

/// Cancellable timers keyed by purpose
pub mod timer;

/// Protocol milestones published to observers
pub mod events;

/// Static cluster description and presets
pub mod config;

/// ISIS total-order multicast
pub mod multicast;

/// Ricart-Agrawala mutual exclusion
pub mod mutex;

/// Inverted Bully leader election
pub mod bully;

/// Spanning-tree wave election
pub mod tree;

/// Peer channel abstraction and the in-memory cluster transport
pub mod channel;

/// TCP transport
pub mod transport;

/// Async runtime driving processes
pub mod simulation;


/// Integration tests for cluster behavior
#[cfg(test)]
pub mod integration_tests;

pub use config::ClusterConfig;
pub use self::core::{Command, Process, ProcessId, Protocol};
pub use simulation::{run_process, spawn_cluster, ProcessHandle};
