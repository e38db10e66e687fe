use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coord::core::{ProcessId, Protocol};
use crate::coord::error::CoordError;

/// Address and capacity of one group member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: ProcessId,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Only meaningful for the tree election
    #[serde(default)]
    pub capacity: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

/// Protocol and transport timing, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Bully: how long a candidate waits for OK
    pub election_timeout_ms: u64,
    /// Bully: PING interval of followers
    pub heartbeat_interval_ms: u64,
    /// Bully: how long a PING may go unanswered
    pub pong_timeout_ms: u64,
    /// Tree: delay before every wave send
    pub propagation_delay_ms: u64,
    /// Transport: wait between connection attempts
    pub reconnect_backoff_ms: u64,
    /// Transport: wait after listening before dialing peers
    pub connect_delay_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            election_timeout_ms: 5000,
            heartbeat_interval_ms: 4000,
            pong_timeout_ms: 3000,
            propagation_delay_ms: 1500,
            reconnect_backoff_ms: 3000,
            connect_delay_ms: 1000,
        }
    }
}

impl Timing {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn propagation_delay(&self) -> Duration {
        Duration::from_millis(self.propagation_delay_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

/// Static description of the process group, shared by every member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub peers: Vec<PeerConfig>,
    /// Tree election neighbors; must be symmetric
    #[serde(default)]
    pub topology: BTreeMap<ProcessId, Vec<ProcessId>>,
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,
    #[serde(default)]
    pub timing: Timing,
}

fn default_resources() -> Vec<String> {
    vec!["r1".to_string(), "r2".to_string()]
}

fn local_peers(count: u32) -> Vec<PeerConfig> {
    (1..=count)
        .map(|id| PeerConfig {
            id,
            host: default_host(),
            port: 8000 + id as u16,
            capacity: 0,
        })
        .collect()
}

impl ClusterConfig {
    /// Built-in local deployment for each protocol
    pub fn preset(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Multicast | Protocol::Mutex => Self {
                peers: local_peers(3),
                topology: BTreeMap::new(),
                resources: default_resources(),
                timing: Timing::default(),
            },
            Protocol::Bully => Self {
                peers: local_peers(5),
                topology: BTreeMap::new(),
                resources: default_resources(),
                timing: Timing::default(),
            },
            Protocol::Tree => {
                let capacities = [10, 20, 30, 40, 50, 60, 95, 80, 90, 100];
                let peers = local_peers(10)
                    .into_iter()
                    .zip(capacities)
                    .map(|(peer, capacity)| PeerConfig { capacity, ..peer })
                    .collect();
                let topology = BTreeMap::from([
                    (1, vec![2, 3]),
                    (2, vec![1, 4, 5]),
                    (3, vec![1, 6, 7]),
                    (4, vec![2, 8, 9]),
                    (5, vec![2, 10]),
                    (6, vec![3]),
                    (7, vec![3]),
                    (8, vec![4]),
                    (9, vec![4]),
                    (10, vec![5]),
                ]);
                Self {
                    peers,
                    topology,
                    resources: default_resources(),
                    timing: Timing {
                        reconnect_backoff_ms: 5000,
                        ..Timing::default()
                    },
                }
            }
        }
    }

    /// Loads a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoordError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| CoordError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Checks the group description and that `local_id` is a member of it
    pub fn validate(&self, local_id: ProcessId) -> Result<(), CoordError> {
        if self.peers.is_empty() {
            return Err(CoordError::Config("no peers configured".into()));
        }
        let mut ids = HashSet::new();
        for peer in &self.peers {
            if peer.id == 0 {
                return Err(CoordError::Config("process ids must be positive".into()));
            }
            if !ids.insert(peer.id) {
                return Err(CoordError::Config(format!("duplicate process id {}", peer.id)));
            }
        }
        if !ids.contains(&local_id) {
            let mut known: Vec<ProcessId> = ids.into_iter().collect();
            known.sort_unstable();
            return Err(CoordError::Config(format!(
                "invalid process id {local_id}, valid ids are {known:?}"
            )));
        }

        for (node, neighbors) in &self.topology {
            if !ids.contains(node) {
                return Err(CoordError::Config(format!(
                    "topology names unknown process {node}"
                )));
            }
            for neighbor in neighbors {
                if !ids.contains(neighbor) || neighbor == node {
                    return Err(CoordError::Config(format!(
                        "process {node} has invalid neighbor {neighbor}"
                    )));
                }
                let symmetric = self
                    .topology
                    .get(neighbor)
                    .is_some_and(|back| back.contains(node));
                if !symmetric {
                    return Err(CoordError::Config(format!(
                        "link {node}-{neighbor} is not symmetric"
                    )));
                }
            }
        }

        let mut resources = BTreeSet::new();
        for resource in &self.resources {
            if resource.trim().is_empty() || !resources.insert(resource) {
                return Err(CoordError::Config(format!("invalid resource id {resource:?}")));
            }
        }
        Ok(())
    }

    /// All member ids in ascending order
    pub fn peer_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.peers.iter().map(|peer| peer.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn peer(&self, id: ProcessId) -> Option<&PeerConfig> {
        self.peers.iter().find(|peer| peer.id == id)
    }

    pub fn neighbors(&self, id: ProcessId) -> Vec<ProcessId> {
        self.topology.get(&id).cloned().unwrap_or_default()
    }

    pub fn capacity(&self, id: ProcessId) -> u64 {
        self.peer(id).map(|peer| peer.capacity).unwrap_or(0)
    }

    /// Resolves the listen/dial address of a member
    pub fn address(&self, id: ProcessId) -> Result<SocketAddr, CoordError> {
        let peer = self
            .peer(id)
            .ok_or_else(|| CoordError::Config(format!("unknown process {id}")))?;
        let host = if peer.host == "localhost" {
            "127.0.0.1"
        } else {
            peer.host.as_str()
        };
        format!("{}:{}", host, peer.port)
            .parse()
            .map_err(|e| CoordError::Config(format!("address of process {id}: {e}")))
    }
}
