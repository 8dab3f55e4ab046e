//! TFTP Session Dispatcher
//!
//! Owns the well-known listening socket and demultiplexes incoming initial
//! requests into independent per-session transfers. Each accepted request
//! gets its own transfer identifier, an ephemeral port the session socket
//! is bound to, so concurrent transfers never share a socket.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

use crate::handler::{Direction, Handler};
use crate::protocol::{ErrorCode, Mode, Packet};
use crate::transfer::{self, TransferConfig};

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

/// Transfer identifiers are drawn from the unprivileged port range so the
/// session sockets never need elevated rights.
const TID_MIN: u16 = 1024;

/// Attempts to find a free TID before giving up on a request. The range
/// holds 64512 ports, so running out in practice means the registry leaked.
const MAX_TID_ATTEMPTS: usize = 1024;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on, also used to bind per-session sockets.
    pub address: IpAddr,
    /// Dispatcher port.
    pub port: u16,
    /// Transfer settings handed to every session.
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            transfer: TransferConfig::default(),
        }
    }
}

/// TFTP server: accept loop plus the registry of live sessions.
///
/// Bind it, then drive it with [`run`](Server::run); request a graceful
/// stop from another task with [`stop`](Server::stop). Sessions already in
/// flight when the server stops run to their natural end.
pub struct Server<H> {
    config: ServerConfig,
    handler: Arc<H>,
    socket: UdpSocket,
    clients: Arc<Mutex<HashMap<u16, String>>>,
    running: AtomicBool,
}

impl<H: Handler> Server<H> {
    /// Bind the well-known listening socket.
    ///
    /// This is the only fatal failure the dispatcher knows; everything that
    /// goes wrong later is contained to a single datagram or session.
    pub async fn bind(config: ServerConfig, handler: H) -> Result<Self> {
        let socket = UdpSocket::bind((config.address, config.port))
            .await
            .context("Failed to bind TFTP server socket")?;

        Ok(Self {
            config,
            handler: Arc::new(handler),
            socket,
            clients: Arc::new(Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
        })
    }

    /// The address the dispatcher is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to get local address")
    }

    /// Number of sessions currently holding a TID.
    pub fn active_sessions(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Run the accept loop until [`stop`](Server::stop) is called.
    ///
    /// On return, every session spawned by this loop has finished.
    pub async fn run(&self) -> Result<()> {
        let local = self.local_addr()?;
        tracing::info!("UDP server loop at {}", local);
        self.running.store(true, Ordering::SeqCst);

        let mut sessions = JoinSet::new();
        let mut buf = [0u8; 2048];

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Receive error on dispatcher socket: {}", e);
                    continue;
                }
            };
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            while sessions.try_join_next().is_some() {}

            let peer_tag = format!("[{}]", peer);
            tracing::debug!("{} New initial packet received", peer_tag);

            let pkt = match Packet::decode(&buf[..len]) {
                Ok(pkt) => pkt,
                Err(e) => {
                    tracing::warn!("{} Packet parse error: {}", peer_tag, e);
                    continue;
                }
            };

            let Some(tid) = self.claim_tid(peer) else {
                tracing::warn!("{} No free TID, dropping request", peer_tag);
                continue;
            };
            let tag = format!("[{}:{}]", peer, tid);

            let socket = match self.open_session_socket(tid, peer).await {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!("{} Failed to open session socket: {}", tag, e);
                    self.release_tid(tid);
                    continue;
                }
            };

            let (direction, filename, mode) = match pkt {
                Packet::ReadRequest { filename, mode } => (Direction::Read, filename, mode),
                Packet::WriteRequest { filename, mode } => (Direction::Write, filename, mode),
                other => {
                    tracing::warn!("{} Bad initial packet: {}", tag, other.opcode());
                    send_error(&socket, ErrorCode::IllegalOperation, "Illegal TFTP operation.").await;
                    self.release_tid(tid);
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            let clients = Arc::clone(&self.clients);
            let transfer_config = self.config.transfer;
            sessions.spawn(async move {
                run_session(&tag, direction, &filename, mode, &socket, &*handler, &transfer_config).await;
                clients.lock().unwrap().remove(&tid);
                tracing::info!("{} Session ended", tag);
            });
        }

        tracing::info!("UDP server loop has stopped");
        if !sessions.is_empty() {
            tracing::info!("Waiting for {} outstanding sessions", sessions.len());
        }
        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    /// Ask the accept loop to exit.
    ///
    /// Flips the running flag, then nudges the listening socket with a dummy
    /// datagram so the blocked receive wakes up and observes the flag.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("Stopping UDP server loop");
        self.running.store(false, Ordering::SeqCst);

        let local = self.local_addr()?;
        let target = SocketAddr::new(loopback_for(local.ip()), local.port());
        let bind_addr = SocketAddr::new(unspecified_for(local.ip()), 0);
        let nudge = UdpSocket::bind(bind_addr).await.context("Failed to bind nudge socket")?;
        nudge.send_to(b"break", target).await.context("Failed to nudge server loop")?;
        Ok(())
    }

    /// Reserve a fresh TID for a session with the given peer.
    ///
    /// Picks random candidates from the unprivileged range until one is not
    /// held by a live session. Registration happens under the same lock as
    /// the collision check, so concurrent accepts cannot race.
    fn claim_tid(&self, peer: SocketAddr) -> Option<u16> {
        let mut clients = self.clients.lock().unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_TID_ATTEMPTS {
            let tid = rng.gen_range(TID_MIN..=u16::MAX);
            if let Entry::Vacant(entry) = clients.entry(tid) {
                entry.insert(peer.to_string());
                return Some(tid);
            }
        }
        None
    }

    fn release_tid(&self, tid: u16) {
        self.clients.lock().unwrap().remove(&tid);
    }

    /// Bind a fresh socket to the session's TID and connect it to the peer.
    async fn open_session_socket(&self, tid: u16, peer: SocketAddr) -> Result<UdpSocket> {
        let socket = UdpSocket::bind((self.config.address, tid))
            .await
            .context("Failed to bind session socket")?;
        socket.connect(peer).await.context("Failed to connect session socket")?;
        Ok(socket)
    }
}

/// Run one accepted session to completion.
///
/// Consults the handler for the storage policy, runs the matching transfer
/// loop and cleans up a partial destination after a failed write. Policy
/// refusals are reported to the peer as ERROR packets.
async fn run_session<H: Handler>(
    tag: &str,
    direction: Direction,
    filename: &str,
    mode: Mode,
    socket: &UdpSocket,
    handler: &H,
    config: &TransferConfig,
) {
    if let Err(e) = handler.authorize(direction, filename) {
        tracing::info!("{} Denied {} request for {}", tag, direction, filename);
        send_error(socket, e.code(), &e.to_string()).await;
        return;
    }

    match direction {
        Direction::Read => {
            tracing::info!("{} Read request for {} ({})", tag, filename, mode);
            match handler.open_source(filename, mode) {
                Ok(mut source) => {
                    transfer::send(tag, socket, source.as_mut(), config).await;
                }
                Err(e) => {
                    tracing::warn!("{} {}", tag, e);
                    send_error(socket, e.code(), &e.to_string()).await;
                }
            }
        }
        Direction::Write => {
            tracing::info!("{} Write request for {} ({})", tag, filename, mode);
            match handler.open_sink(filename, mode) {
                Ok(mut sink) => {
                    let ok = transfer::receive(tag, socket, sink.as_mut(), config).await;
                    drop(sink);
                    if !ok {
                        tracing::warn!("{} Removing partial file {}", tag, filename);
                        handler.discard(filename);
                    }
                }
                Err(e) => {
                    tracing::warn!("{} {}", tag, e);
                    send_error(socket, e.code(), &e.to_string()).await;
                }
            }
        }
    }
}

/// Best-effort ERROR packet on a connected session socket.
async fn send_error(socket: &UdpSocket, code: ErrorCode, message: &str) {
    let pkt = Packet::Error {
        code,
        message: message.to_string(),
    };
    if let Err(e) = socket.send(&pkt.encode()).await {
        tracing::debug!("Failed to send error packet: {}", e);
    }
}

fn loopback_for(ip: IpAddr) -> IpAddr {
    if ip.is_unspecified() {
        match ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    } else {
        ip
    }
}

fn unspecified_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
