use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::coord::channel::{ClusterChannels, Inbound, PeerChannel};
use crate::coord::config::ClusterConfig;
use crate::coord::core::{Command, Effect, Process, ProcessId, ProcessSnapshot, Protocol};
use crate::coord::error::CoordError;
use crate::coord::events::{CoordEvent, EventBroadcaster};
use crate::coord::timer::Timers;

/// Idle wake-up when no timer is pending
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Operator request delivered to a running process
#[derive(Debug)]
pub enum OperatorRequest {
    Command(Command, oneshot::Sender<Result<(), CoordError>>),
    Snapshot(oneshot::Sender<ProcessSnapshot>),
}

/// Handle for driving a running process from the console or a test
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// Process ID this handle represents
    pub id: ProcessId,
    sender: mpsc::UnboundedSender<OperatorRequest>,
}

impl ProcessHandle {
    /// Creates a handle and the receiver the process loop reads requests from
    pub fn new(id: ProcessId) -> (Self, mpsc::UnboundedReceiver<OperatorRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { id, sender }, receiver)
    }

    /// Runs a command on the process and waits for it to be accepted or rejected
    pub async fn execute(&self, command: Command) -> Result<(), CoordError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(OperatorRequest::Command(command, reply))
            .map_err(|_| CoordError::PeerUnreachable(self.id))?;
        response
            .await
            .map_err(|_| CoordError::PeerUnreachable(self.id))?
    }

    pub async fn snapshot(&self) -> Result<ProcessSnapshot, CoordError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(OperatorRequest::Snapshot(reply))
            .map_err(|_| CoordError::PeerUnreachable(self.id))?;
        response.await.map_err(|_| CoordError::PeerUnreachable(self.id))
    }
}

/// Runs a single process: inbound traffic, timers and operator requests.
/// This is the only task touching the process state, so every handler runs
/// to completion before the next event is looked at.
pub async fn run_process(
    mut process: Process,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut requests: mpsc::UnboundedReceiver<OperatorRequest>,
    channel: Arc<dyn PeerChannel>,
    event_broadcaster: EventBroadcaster,
) {
    let mut timers = Timers::new();
    let mut operator_attached = true;

    loop {
        let deadline = timers
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

        tokio::select! {
            received = inbound.recv() => {
                let effects = match received {
                    Some(Inbound::Message(message)) => {
                        trace!(
                            process_id = process.id,
                            "📥 {} from {:?}",
                            message.message_type(),
                            message.sender_id()
                        );
                        process.handle_message(message, channel.as_ref())
                    }
                    Some(Inbound::LinkDown(peer)) => {
                        debug!(process_id = process.id, "🔌 Link to {} is down", peer);
                        process.handle_link_down(peer, channel.as_ref())
                    }
                    // Transport gone, nothing left to drive the process
                    None => break,
                };
                apply_effects(&process, effects, &mut timers, channel.as_ref(), &event_broadcaster);
            }
            request = requests.recv(), if operator_attached => match request {
                Some(OperatorRequest::Command(command, reply)) => {
                    debug!(process_id = process.id, "Operator command {:?}", command);
                    let result = match process.handle_command(command, channel.as_ref()) {
                        Ok(effects) => {
                            apply_effects(&process, effects, &mut timers, channel.as_ref(), &event_broadcaster);
                            Ok(())
                        }
                        Err(error) => {
                            warn!(process_id = process.id, "❌ Command rejected: {}", error);
                            Err(error)
                        }
                    };
                    let _ = reply.send(result);
                }
                Some(OperatorRequest::Snapshot(reply)) => {
                    let _ = reply.send(process.snapshot());
                }
                None => operator_attached = false,
            },
            _ = sleep_until(deadline), if !timers.is_empty() => {
                for key in timers.expired(Instant::now()) {
                    trace!(process_id = process.id, "⏰ Timer {:?} fired", key);
                    let effects = process.handle_timer(key, channel.as_ref());
                    apply_effects(&process, effects, &mut timers, channel.as_ref(), &event_broadcaster);
                }
            }
        }
    }
}

/// Executes the side effects a handler asked for
fn apply_effects(
    process: &Process,
    effects: Vec<Effect>,
    timers: &mut Timers,
    channel: &dyn PeerChannel,
    event_broadcaster: &EventBroadcaster,
) {
    for effect in effects {
        match effect {
            Effect::Send { to, message } => {
                if let Err(error) = channel.send(to, &message) {
                    debug!(
                        process_id = process.id,
                        "Dropped {} to {}: {}",
                        message.message_type(),
                        to,
                        error
                    );
                }
            }
            Effect::Schedule { key, after } => timers.schedule(key, Instant::now(), after),
            Effect::Cancel(key) => {
                timers.cancel(&key);
            }
            Effect::Emit(kind) => {
                // No subscribers is fine
                let _ = event_broadcaster.emit(CoordEvent::new(process.id, process.clock(), kind));
            }
        }
    }
}

/// A group of processes wired through in-memory channels
#[derive(Debug)]
pub struct LocalCluster {
    pub channels: Arc<ClusterChannels>,
    pub events: EventBroadcaster,
    pub handles: Vec<ProcessHandle>,
    tasks: HashMap<ProcessId, JoinHandle<()>>,
}

impl LocalCluster {
    pub fn handle(&self, id: ProcessId) -> Option<&ProcessHandle> {
        self.handles.iter().find(|handle| handle.id == id)
    }

    /// Stops a process without any goodbye; the others see its links drop
    pub fn crash(&mut self, id: ProcessId) {
        self.channels.crash(id);
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }

    pub fn shutdown(self) {
        for (id, task) in self.tasks {
            task.abort();
            debug!(process_id = id, "🛑 Process stopped");
        }
    }
}

/// Spawns one task per configured member, all running `protocol`
pub async fn spawn_cluster(
    config: &ClusterConfig,
    protocol: Protocol,
) -> Result<LocalCluster, CoordError> {
    let ids = config.peer_ids();
    info!("🎆 Creating {} cluster with {} processes", protocol, ids.len());

    // Build every process first so a bad config spawns nothing
    let processes = ids
        .iter()
        .map(|&id| Process::from_config(id, protocol, config))
        .collect::<Result<Vec<_>, _>>()?;

    let (channels, mut receivers) = ClusterChannels::new(&ids);
    let channels = Arc::new(channels);
    let (events, _) = EventBroadcaster::new(1000);
    let mut handles = Vec::new();
    let mut tasks = HashMap::new();

    for process in processes {
        let id = process.id;
        let inbound = receivers
            .remove(&id)
            .ok_or(CoordError::PeerUnreachable(id))?;
        let (handle, requests) = ProcessHandle::new(id);
        let channel: Arc<dyn PeerChannel> = Arc::new(channels.endpoint(id));
        let events_clone = events.clone();

        let task = tokio::spawn(async move {
            info!(process_id = id, "🟢 Process {} started", id);
            run_process(process, inbound, requests, channel, events_clone).await;
            info!(process_id = id, "🔴 Process {} stopped", id);
        });
        handles.push(handle);
        tasks.insert(id, task);
    }

    info!("✅ All {} processes spawned", handles.len());
    Ok(LocalCluster {
        channels,
        events,
        handles,
        tasks,
    })
}
