// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! termbuddy CLI
//!
//! # Usage
//!
//! ```bash
//! # Host a room (OS-assigned port, announced on the LAN)
//! termbuddy host --name Ann
//!
//! # List rooms for five seconds
//! termbuddy scan --seconds 5
//!
//! # Join a room directly, or the first one found
//! termbuddy join 192.168.1.20 40123 --name Bob
//! termbuddy join --first
//! ```
//!
//! While in a session, type `rose`, `poop` or `hammer` (optionally followed
//! by `left` or `right`) to throw something, `typing`, `idle` or `offline`
//! to force a status, `roster` to list peers and `quit` to leave.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use termbuddy::activity::{
    ActivityMonitor, ActivitySource, KeyPress, KeyboardHub, KeyboardSubscription,
    ACTIVITY_SOURCE_ENV,
};
use termbuddy::discovery::interfaces::primary_ipv4;
use termbuddy::session::room_name;
use termbuddy::{
    ActivityState, ConnectionStatus, DiscoveredRoom, LeaveStats, ProjectileDirection,
    ProjectileKind, Role, Scanner, ScannerConfig, Session, SessionConfig, SessionEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Fallback when neither `--name` nor the hostname is usable.
const DEFAULT_LOCAL_NAME: &str = "buddy";

/// termbuddy - LAN presence for terminal users
#[derive(Parser, Debug)]
#[command(name = "termbuddy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Key activity source (terminal, keyboard)
    #[arg(
        long,
        env = ACTIVITY_SOURCE_ENV,
        default_value = "terminal",
        global = true
    )]
    activity_source: ActivitySource,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host a room and relay presence between peers
    Host {
        /// Display name (defaults to the hostname)
        #[arg(short, long)]
        name: Option<String>,

        /// TCP port (0 = OS-assigned)
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not announce the room on the LAN
        #[arg(long)]
        no_announce: bool,
    },

    /// List rooms announced on the LAN
    Scan {
        /// How long to listen
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },

    /// Join a room
    Join {
        /// Host address
        #[arg(required_unless_present = "first")]
        ip: Option<IpAddr>,

        /// Host TCP port
        #[arg(required_unless_present = "first")]
        port: Option<u16>,

        /// Display name (defaults to the hostname)
        #[arg(short, long)]
        name: Option<String>,

        /// Host name, if known
        #[arg(long)]
        host_name: Option<String>,

        /// Scan and join the first room found
        #[arg(long, conflicts_with_all = ["ip", "port"])]
        first: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Host {
            name,
            port,
            no_announce,
        } => {
            if no_announce {
                config.announce = false;
            }
            let name = local_name(name);
            let (events_tx, events) = mpsc::unbounded_channel();
            let session = Session::start_host(&name, port, &config, events_tx).await?;

            let port = session.listen_addr().map(|a| a.port()).unwrap_or_default();
            println!("termbuddy v{}", env!("CARGO_PKG_VERSION"));
            println!("=====================================");
            match primary_ipv4() {
                Some(ip) => println!(
                    "Hosting '{}' on {}:{}",
                    room_name(session.local_name()),
                    ip,
                    port
                ),
                None => println!(
                    "Hosting '{}' on port {}",
                    room_name(session.local_name()),
                    port
                ),
            }
            if !config.announce {
                println!("(not announced; peers must join by address)");
            }
            print_help();

            run_session(session, events, &config, args.activity_source).await;
        }
        Commands::Scan { seconds } => {
            cmd_scan(&config, Duration::from_secs(seconds)).await?;
        }
        Commands::Join {
            ip,
            port,
            name,
            host_name,
            first,
        } => {
            let name = local_name(name);
            let (ip, port, host_name) = match (first, ip, port) {
                (false, Some(ip), Some(port)) => (ip, port, host_name),
                _ => match wait_for_first_room(&config).await? {
                    Some(room) => {
                        println!("Joining '{}' at {}", room.room_name, room.addr());
                        (room.ip, room.tcp_port, Some(room.host_name))
                    }
                    None => return Ok(()),
                },
            };

            let (events_tx, events) = mpsc::unbounded_channel();
            let session = Session::start_client(
                &name,
                ip,
                port,
                host_name.as_deref(),
                &config,
                events_tx,
            )
            .await?;
            println!("Connected to {}:{} as {}", ip, port, session.local_name());
            print_help();

            run_session(session, events, &config, args.activity_source).await;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig, termbuddy::ConfigError> {
    let config = match path {
        Some(path) => {
            info!("Loading config from {:?}", path);
            SessionConfig::from_file(path)?
        }
        None => SessionConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// `--name`, else the hostname, else a fixed fallback.
fn local_name(name: Option<String>) -> String {
    let host = hostname::get().ok().and_then(|h| h.into_string().ok());
    choose_name(name, host)
}

fn choose_name(flag: Option<String>, host: Option<String>) -> String {
    let usable = |n: String| Some(n.trim().to_string()).filter(|n| !n.is_empty());
    flag.and_then(usable)
        .or_else(|| host.and_then(usable))
        .unwrap_or_else(|| DEFAULT_LOCAL_NAME.to_string())
}

async fn cmd_scan(config: &SessionConfig, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let scanner = Scanner::start(ScannerConfig::from(config)).await?;
    let mut updates = scanner.subscribe();
    println!("Scanning on {} for {:?}...", scanner.local_addr(), duration);

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut last_keys: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let rooms = updates.borrow_and_update().clone();
                let keys: Vec<String> = rooms.iter().map(|r| r.addr().to_string()).collect();
                if keys != last_keys {
                    print_rooms(&rooms);
                    last_keys = keys;
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let rooms = scanner.rooms();
    scanner.stop().await;
    if rooms.is_empty() {
        println!("No rooms found.");
    }
    Ok(())
}

/// Scan until a room shows up; `None` on Ctrl+C.
async fn wait_for_first_room(
    config: &SessionConfig,
) -> Result<Option<DiscoveredRoom>, Box<dyn std::error::Error>> {
    let scanner = Scanner::start(ScannerConfig::from(config)).await?;
    let mut updates = scanner.subscribe();
    println!("Looking for a room (Ctrl+C to cancel)...");

    let room = tokio::select! {
        found = updates.wait_for(|rooms| !rooms.is_empty()) => {
            found.ok().and_then(|rooms| rooms.first().cloned())
        }
        _ = tokio::signal::ctrl_c() => None,
    };

    scanner.stop().await;
    Ok(room)
}

fn print_rooms(rooms: &[DiscoveredRoom]) {
    println!();
    println!("{:<24} {:<16} {:<22}", "ROOM", "HOST", "ADDRESS");
    for room in rooms {
        println!(
            "{:<24} {:<16} {:<22}",
            room.room_name,
            room.host_name,
            room.addr()
        );
    }
}

fn print_help() {
    println!("Commands: rose|poop|hammer [left|right], typing|idle|offline, roster, quit");
    println!("Press Ctrl+C to leave.");
    println!();
}

/// One line of interactive input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Throw(ProjectileKind, ProjectileDirection),
    Status(ActivityState),
    Roster,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let mut words = line.split_whitespace().map(str::to_ascii_lowercase);
    let Some(first) = words.next() else {
        return Input::Empty;
    };

    let kind = match first.as_str() {
        "rose" => Some(ProjectileKind::Rose),
        "poop" => Some(ProjectileKind::Poop),
        "hammer" => Some(ProjectileKind::Hammer),
        _ => None,
    };
    if let Some(kind) = kind {
        let direction = match words.next().as_deref() {
            Some("left") => ProjectileDirection::RightToLeft,
            _ => ProjectileDirection::LeftToRight,
        };
        return Input::Throw(kind, direction);
    }

    match first.as_str() {
        "typing" => Input::Status(ActivityState::Typing),
        "idle" => Input::Status(ActivityState::Idle),
        "offline" => Input::Status(ActivityState::Offline),
        "roster" | "who" => Input::Roster,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(line.trim().to_string()),
    }
}

async fn next_key(keyboard: &mut Option<KeyboardSubscription>) -> Option<KeyPress> {
    match keyboard {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Drive a session until the user leaves, the link drops, or Ctrl+C.
async fn run_session(
    session: Session,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    config: &SessionConfig,
    source: ActivitySource,
) {
    let mut monitor = ActivityMonitor::new(config.idle_after());
    let mut poll = tokio::time::interval(config.activity_poll());

    let hub = KeyboardHub::xinput();
    let mut keyboard = match source {
        ActivitySource::Keyboard => match hub.acquire() {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("{}; falling back to terminal input", e);
                None
            }
        },
        ActivitySource::Terminal => None,
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut connected = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => {
                        stdin_open = false;
                        continue;
                    }
                };
                if keyboard.is_none() {
                    if let Some(state) = monitor.record_key_press(Instant::now()) {
                        if connected {
                            session.send_local_status(state).await;
                        }
                    }
                }
                match parse_input(&line) {
                    Input::Throw(kind, direction) => {
                        session.send_projectile(kind, direction).await;
                        println!("You threw a {}", kind);
                    }
                    Input::Status(state) => session.send_local_status(state).await,
                    Input::Roster => print_roster(&session.roster().await),
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Unknown(text) => println!("Unknown command: {}", text),
                }
            }
            key = next_key(&mut keyboard) => {
                match key {
                    Some(_) => {
                        if let Some(state) = monitor.record_key_press(Instant::now()) {
                            if connected {
                                session.send_local_status(state).await;
                            }
                        }
                    }
                    None => keyboard = None,
                }
            }
            _ = poll.tick() => {
                if let Some(state) = monitor.poll(Instant::now()) {
                    if connected {
                        session.send_local_status(state).await;
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                print_event(&event);
                if let SessionEvent::ConnectionStatusChanged(status) = event {
                    connected = status == ConnectionStatus::Connected;
                    if connected {
                        session.send_local_status(monitor.state()).await;
                    }
                    if status == ConnectionStatus::Disconnected && session.role() == Role::Client {
                        println!("Connection to the host was lost.");
                        break;
                    }
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    drop(keyboard);
    let stats = session.stop(monitor.key_presses()).await;
    print_stats(&stats);
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StatusChanged { peer_id, state } => println!("[{}] is {}", peer_id, state),
        SessionEvent::ProjectileReceived {
            kind,
            direction,
            sender_name,
        } => {
            println!(
                "{} threw a {} {}",
                sender_name.as_deref().unwrap_or("Someone"),
                kind,
                incoming_arrow(*direction)
            );
        }
        SessionEvent::RosterChanged(peers) => print_roster(peers),
        SessionEvent::ConnectionStatusChanged(status) => println!("Status: {}", status),
    }
}

/// The sender's throw, as seen from this side of the room.
fn incoming_arrow(direction: ProjectileDirection) -> &'static str {
    match direction.flipped() {
        ProjectileDirection::LeftToRight => "->",
        ProjectileDirection::RightToLeft => "<-",
    }
}

fn print_roster(peers: &[termbuddy::Peer]) {
    if peers.is_empty() {
        println!("Roster: (empty)");
        return;
    }
    println!("Roster:");
    for peer in peers {
        println!("  {:<20} {}", peer.name, peer.state);
    }
}

fn print_stats(stats: &LeaveStats) {
    println!();
    println!("Session Statistics:");
    println!("  Duration:    {:?}", stats.session_duration());
    println!("  Connected:   {:?}", stats.connected_duration());
    println!("  Key presses: {}", stats.key_presses);
    if let Some(peer) = &stats.peer_name {
        println!("  With:        {}", peer);
    }
}
