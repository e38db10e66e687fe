use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coord::channel::{Inbound, PeerChannel};
use crate::coord::config::ClusterConfig;
use crate::coord::core::{ProcessId, Protocol};
use crate::coord::error::CoordError;
use crate::coord::message::Message;

/// Outbound side of one peer link
#[derive(Debug)]
struct Link {
    lines: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

/// [`PeerChannel`] over TCP: one outbound connection per peer, newline-delimited JSON
#[derive(Debug)]
pub struct TcpPeerChannel {
    id: ProcessId,
    links: HashMap<ProcessId, Link>,
}

impl TcpPeerChannel {
    /// Number of peers with an established outbound connection
    pub fn connected_count(&self) -> usize {
        self.links
            .values()
            .filter(|link| link.connected.load(Ordering::SeqCst))
            .count()
    }

    pub fn peer_count(&self) -> usize {
        self.links.len()
    }

    /// (peer, online) in ascending id order
    pub fn peer_states(&self) -> Vec<(ProcessId, bool)> {
        let mut states: Vec<(ProcessId, bool)> = self
            .links
            .iter()
            .map(|(&peer, link)| (peer, link.connected.load(Ordering::SeqCst)))
            .collect();
        states.sort_unstable();
        states
    }
}

impl PeerChannel for TcpPeerChannel {
    fn send(&self, peer: ProcessId, message: &Message) -> Result<(), CoordError> {
        let link = self
            .links
            .get(&peer)
            .filter(|link| link.connected.load(Ordering::SeqCst))
            .ok_or(CoordError::PeerUnreachable(peer))?;
        let mut line = message.encode()?;
        line.push('\n');
        debug!(
            process_id = self.id,
            "📤 {} to {}",
            message.message_type(),
            peer
        );
        link.lines
            .send(line)
            .map_err(|_| CoordError::PeerUnreachable(peer))
    }

    fn is_reachable(&self, peer: ProcessId) -> bool {
        self.links
            .get(&peer)
            .is_some_and(|link| link.connected.load(Ordering::SeqCst))
    }
}

/// A started transport: the channel for sending and the inbound queue for the process loop
#[derive(Debug)]
pub struct TcpTransport {
    pub channel: Arc<TcpPeerChannel>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Binds the local listener and starts dialing every other member
pub async fn start(
    config: &ClusterConfig,
    id: ProcessId,
    protocol: Protocol,
) -> Result<TcpTransport, CoordError> {
    let address = config.address(id)?;
    let listener = TcpListener::bind(address).await?;
    info!(process_id = id, "👂 Listening on {}", address);

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let mut tasks = vec![tokio::spawn(accept_loop(
        id,
        listener,
        protocol,
        inbound_tx.clone(),
    ))];

    let mut links = HashMap::new();
    for peer in config.peer_ids().into_iter().filter(|&peer| peer != id) {
        let (lines, outgoing) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        tasks.push(tokio::spawn(maintain_link(
            id,
            peer,
            config.address(peer)?,
            outgoing,
            Arc::clone(&connected),
            inbound_tx.clone(),
            config.timing.connect_delay(),
            config.timing.reconnect_backoff(),
        )));
        links.insert(peer, Link { lines, connected });
    }

    Ok(TcpTransport {
        channel: Arc::new(TcpPeerChannel { id, links }),
        inbound,
        tasks,
    })
}

async fn accept_loop(
    id: ProcessId,
    listener: TcpListener,
    protocol: Protocol,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, remote)) => {
                debug!(process_id = id, "Accepted connection from {}", remote);
                tokio::spawn(read_records(id, socket, protocol, inbound.clone()));
            }
            Err(error) => warn!(process_id = id, "Accept failed: {}", error),
        }
    }
}

/// Decodes one record per line until the peer hangs up; a bad record only costs itself
async fn read_records(
    id: ProcessId,
    socket: TcpStream,
    protocol: Protocol,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let mut reader = BufReader::new(socket);
    let mut record = Vec::new();
    loop {
        record.clear();
        match reader.read_until(b'\n', &mut record).await {
            Ok(0) => return,
            Ok(_) => {
                let decoded = std::str::from_utf8(&record)
                    .map_err(|error| CoordError::MalformedMessage(format!("not UTF-8: {error}")))
                    .and_then(|line| match line.trim() {
                        "" => Ok(None),
                        line => Message::decode(protocol, line).map(Some),
                    });
                match decoded {
                    Ok(Some(message)) => {
                        if inbound.send(Inbound::Message(message)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => warn!(process_id = id, "Dropping record: {}", error),
                }
            }
            Err(error) => {
                debug!(process_id = id, "Inbound connection failed: {}", error);
                return;
            }
        }
    }
}

/// Keeps the outbound connection to `peer` up, reconnecting on a fixed backoff
#[allow(clippy::too_many_arguments)]
async fn maintain_link(
    id: ProcessId,
    peer: ProcessId,
    address: SocketAddr,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
    inbound: mpsc::UnboundedSender<Inbound>,
    connect_delay: Duration,
    backoff: Duration,
) {
    tokio::time::sleep(connect_delay).await;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                info!(process_id = id, "🔗 Connected to process {}", peer);
                connected.store(true, Ordering::SeqCst);
                let closed_by_owner = forward_lines(stream, &mut outgoing).await;
                connected.store(false, Ordering::SeqCst);
                if closed_by_owner {
                    return;
                }
                warn!(process_id = id, "Disconnected from process {}", peer);
                if inbound.send(Inbound::LinkDown(peer)).is_err() {
                    return;
                }
            }
            Err(error) => debug!(
                process_id = id,
                "Connecting to process {} failed: {}", peer, error
            ),
        }
        tokio::time::sleep(backoff).await;
    }
}

/// Writes queued lines until the connection drops; true when the queue itself closed
async fn forward_lines(stream: TcpStream, outgoing: &mut mpsc::UnboundedReceiver<String>) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    // Peers never write on our outbound connection; a read only completes at EOF
    let mut probe = [0u8; 64];
    loop {
        tokio::select! {
            line = outgoing.recv() => match line {
                Some(line) => {
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        return false;
                    }
                }
                None => return true,
            },
            read = reader.read(&mut probe) => match read {
                Ok(0) | Err(_) => return false,
                Ok(_) => continue,
            },
        }
    }
}
