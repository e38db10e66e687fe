mod coord;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use coord::channel::PeerChannel;
use coord::core::{AlgorithmSnapshot, ProcessSnapshot};
use coord::events::{CoordEvent, CoordEventKind, EventBroadcaster};
use coord::simulation::LocalCluster;
use coord::transport::{self, TcpPeerChannel};
use coord::{run_process, spawn_cluster, ClusterConfig, Command, Process, ProcessHandle, ProcessId, Protocol};

/// Distributed coordination playground: multicast, mutual exclusion and leader election
#[derive(Debug, Parser)]
#[command(name = "coord-poc", version, about)]
struct Args {
    /// Protocol this process runs
    #[arg(value_enum)]
    protocol: Protocol,

    /// Id of this process (with --local, the process the console talks to)
    #[arg(long)]
    id: ProcessId,

    /// JSON cluster description; defaults to the built-in preset of the protocol
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run every member inside this process over in-memory channels
    #[arg(long)]
    local: bool,
}

/// Where the console's commands go
enum Deployment {
    /// One member of a TCP cluster
    Tcp {
        handle: ProcessHandle,
        channel: Arc<TcpPeerChannel>,
        tasks: Vec<JoinHandle<()>>,
    },
    /// The whole group in this process
    Local {
        cluster: LocalCluster,
        target: ProcessId,
    },
}

impl Deployment {
    fn target(&self) -> Option<&ProcessHandle> {
        match self {
            Deployment::Tcp { handle, .. } => Some(handle),
            Deployment::Local { cluster, target } => cluster.handle(*target),
        }
    }

    fn shutdown(self) {
        match self {
            Deployment::Tcp { tasks, .. } => {
                for task in tasks {
                    task.abort();
                }
            }
            Deployment::Local { cluster, .. } => cluster.shutdown(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber with environment-based filtering
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("coord_poc=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::preset(args.protocol),
    };
    config.validate(args.id)?;

    info!(
        "🚀 coord-poc starting: {} as process {}{}",
        args.protocol,
        args.id,
        if args.local { " (local cluster)" } else { "" }
    );

    let (mut deployment, events) = if args.local {
        let cluster = spawn_cluster(&config, args.protocol).await?;
        let events = cluster.events.clone();
        (
            Deployment::Local {
                cluster,
                target: args.id,
            },
            events,
        )
    } else {
        start_tcp(&config, args.id, args.protocol).await?
    };
    let printer = spawn_event_printer(&events);

    print_help(args.protocol, args.local);

    // Setup graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        warn!("🛑 Received Ctrl+C, shutting down...");
    };

    tokio::select! {
        _ = shutdown_signal => {}
        _ = console(&mut deployment, args.protocol) => {
            warn!("🏁 Console closed");
        }
    }

    printer.abort();
    deployment.shutdown();
    info!("✅ coord-poc stopped");
    Ok(())
}

/// Starts this member over TCP and its process loop
async fn start_tcp(
    config: &ClusterConfig,
    id: ProcessId,
    protocol: Protocol,
) -> Result<(Deployment, EventBroadcaster), Box<dyn std::error::Error>> {
    let process = Process::from_config(id, protocol, config)?;
    let transport = transport::start(config, id, protocol).await?;
    let (handle, requests) = ProcessHandle::new(id);
    let (events, _) = EventBroadcaster::new(256);

    let channel: Arc<dyn PeerChannel> = transport.channel.clone();
    let mut tasks = transport.tasks;
    tasks.push(tokio::spawn(run_process(
        process,
        transport.inbound,
        requests,
        channel,
        events.clone(),
    )));
    tasks.push(tokio::spawn(announce_ready(
        Arc::clone(&transport.channel),
        handle.clone(),
        protocol,
    )));

    Ok((
        Deployment::Tcp {
            handle,
            channel: transport.channel,
            tasks,
        },
        events,
    ))
}

/// Waits for every peer link; the Bully group then runs its first election
async fn announce_ready(channel: Arc<TcpPeerChannel>, handle: ProcessHandle, protocol: Protocol) {
    while channel.connected_count() < channel.peer_count() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    println!("\n[Process {}] All processes connected. System ready.", handle.id);

    if protocol == Protocol::Bully {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Err(e) = handle.execute(Command::StartElection).await {
            warn!(process_id = handle.id, "Initial election not started: {}", e);
        }
    }
}

fn spawn_event_printer(events: &EventBroadcaster) -> JoinHandle<()> {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Event printer skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &CoordEvent) {
    let text = match &event.kind {
        CoordEventKind::MessageDelivered {
            sender_id,
            timestamp,
            content,
        } => format!("✅ DELIVERED \"{content}\" (from {sender_id} @ T={timestamp})"),
        CoordEventKind::ResourceAcquired { resource_id } => {
            format!("🔒 Entered the critical section of {resource_id}")
        }
        CoordEventKind::ResourceReleased {
            resource_id,
            deferred_replies,
        } => format!("🔓 Released {resource_id}, {deferred_replies} deferred request(s) answered"),
        CoordEventKind::LeaderElected { leader_id } => format!("👑 Process {leader_id} is the leader"),
        CoordEventKind::LeaderSuspected { leader_id } => {
            format!("💔 Leader {leader_id} seems to have failed")
        }
        _ => return,
    };
    println!("[Process {} | Clock: {}] {}", event.process_id, event.clock, text);
}

fn print_help(protocol: Protocol, local: bool) {
    println!("\n=== coord-poc console ({protocol}) ===");
    println!("Commands:");
    match protocol {
        Protocol::Multicast => {
            println!("  multicast <text>  - Send a message to the group in total order");
            println!("  queue             - Show the pending queue and its ACKs");
            println!("  delivered         - Show delivered messages");
        }
        Protocol::Mutex => {
            println!("  request <r>       - Ask for the critical section of resource r");
            println!("  release <r>       - Leave the critical section of resource r");
            println!("  resources         - Show the state of every resource");
        }
        Protocol::Bully | Protocol::Tree => {
            println!("  elect             - Start a leader election");
        }
    }
    println!("  status            - Show process state");
    if local {
        println!("  use <id>          - Direct commands to another process");
        println!("  fail              - Crash the current process");
    } else {
        println!("  fail              - Simulate a failure (exits immediately)");
    }
    println!("  help              - Show this help message");
    println!("  quit              - Shutdown and exit");
    println!("======================================\n");
}

async fn console(deployment: &mut Deployment, protocol: Protocol) {
    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                // Keep the process serving its peers without a console
                warn!("📜 EOF reached, running in background. Use Ctrl+C to stop.");
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                error!("Error reading input: {}", e);
                return;
            }
        };

        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word {
            "" => continue,
            "multicast" | "request" | "release" if rest.is_empty() => {
                println!("Usage: {word} <argument>");
                continue;
            }
            "multicast" => Command::Multicast(rest.to_string()),
            "request" => Command::Request(rest.to_string()),
            "release" => Command::Release(rest.to_string()),
            "elect" => Command::StartElection,
            "status" | "queue" | "delivered" | "resources" => {
                show(deployment, word).await;
                continue;
            }
            "use" => {
                select_target(deployment, rest);
                continue;
            }
            "fail" => {
                fail(deployment);
                continue;
            }
            "help" => {
                print_help(protocol, matches!(deployment, Deployment::Local { .. }));
                continue;
            }
            "exit" | "quit" => {
                warn!("🔚 Exiting...");
                return;
            }
            other => {
                println!("Unknown command: '{other}'. Type 'help' for available commands.");
                continue;
            }
        };

        match deployment.target() {
            Some(handle) => {
                if let Err(e) = handle.execute(command).await {
                    println!("❌ {e}");
                }
            }
            None => println!("❌ The selected process is not running"),
        }
    }
}

fn select_target(deployment: &mut Deployment, rest: &str) {
    let Deployment::Local { cluster, target } = deployment else {
        println!("'use' is only available with --local");
        return;
    };
    match rest.parse::<ProcessId>() {
        Ok(id) if cluster.handle(id).is_some() => {
            *target = id;
            println!("Commands now go to process {id}");
        }
        _ => println!("Usage: use <id> (a running process)"),
    }
}

fn fail(deployment: &mut Deployment) {
    match deployment {
        Deployment::Tcp { handle, .. } => {
            warn!(process_id = handle.id, "💥 Simulating failure...");
            // Abrupt exit: peers only notice through their links
            std::process::exit(1);
        }
        Deployment::Local { cluster, target } => {
            warn!(process_id = *target, "💥 Crashing process");
            cluster.crash(*target);
        }
    }
}

async fn show(deployment: &Deployment, what: &str) {
    let Some(handle) = deployment.target() else {
        println!("❌ The selected process is not running");
        return;
    };
    let snapshot = match handle.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            println!("❌ {e}");
            return;
        }
    };

    match (what, &snapshot.state) {
        ("queue", AlgorithmSnapshot::Multicast(multicast)) => {
            let pending = ProcessSnapshot {
                state: AlgorithmSnapshot::Multicast(coord::multicast::MulticastSnapshot {
                    delivered: Vec::new(),
                    ..multicast.clone()
                }),
                ..snapshot.clone()
            };
            print!("{pending}");
        }
        ("delivered", AlgorithmSnapshot::Multicast(multicast)) => {
            println!("Delivered by process {}:", snapshot.id);
            for (index, message) in multicast.delivered.iter().enumerate() {
                println!(
                    "  {}. [T:{}, from:{}] \"{}\"",
                    index + 1,
                    message.timestamp,
                    message.sender_id,
                    message.content
                );
            }
        }
        ("resources", AlgorithmSnapshot::Mutex(_)) | ("status", _) => {
            print!("{snapshot}");
            if let Deployment::Tcp { channel, .. } = deployment {
                let peers: Vec<String> = channel
                    .peer_states()
                    .into_iter()
                    .map(|(peer, online)| {
                        format!("P{} ({})", peer, if online { "Online" } else { "Offline" })
                    })
                    .collect();
                println!("Peers: [{}]", peers.join(", "));
            }
        }
        (what, _) => println!("'{what}' is not available for this protocol"),
    }
}
