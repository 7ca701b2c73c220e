//! The relay engine.
//!
//! A [`Relay`] owns the node's identity, the local bridge and the
//! connection table, and drives two long-lived loops:
//!
//! - **inbound-local**: receive a frame from the local segment, drop it if
//!   this relay already appears in its path, otherwise stamp the local quad
//!   and fan it out to every connected peer;
//! - **accept**: accept inbound TCP connections from remote relays, read the
//!   announcing handshake and register the new link.
//!
//! Each peer link additionally runs its own receive task (TCP to local
//! broadcast, see [`crate::peer`]). Cross-task coordination happens only
//! through the connection table; shutdown is a watch signal every loop
//! observes at its next suspension point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::LocalBridge;
use crate::identity::{RelayIdentity, DEFAULT_PORT};
use crate::packet::{Packet, MAX_PACKET_SIZE, QUAD_SIZE};
use crate::peer::{decode_peer_id, encode_peer_id, PeerLink, HANDSHAKE_SIZE};
use crate::table::ConnectionTable;

/// How long an inbound connection may take to announce its identifier
/// before it is dropped. Keeps a silent peer from occupying the relay.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One relay node: bridges its local UDP segment with the TCP peer mesh.
pub struct Relay {
    identity: RelayIdentity,
    bridge: Arc<dyn LocalBridge>,
    table: ConnectionTable,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    /// Bind the peer listener and start the engine loops.
    ///
    /// `listen` is the TCP address for inbound peer connections, normally
    /// `0.0.0.0:<identity port>`. Binding failure is fatal.
    pub async fn start(
        identity: RelayIdentity,
        listen: &str,
        bridge: Arc<dyn LocalBridge>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("bind peer listener on {listen}"))?;
        let local_addr = listener
            .local_addr()
            .context("resolve peer listener address")?;

        let table = ConnectionTable::spawn();
        let (shutdown, _) = watch::channel(false);

        let inbound_local = tokio::spawn(inbound_local_loop(
            identity.quad(),
            bridge.clone(),
            table.clone(),
            shutdown.subscribe(),
        ));
        let acceptor = tokio::spawn(accept_loop(
            listener,
            identity.quad(),
            bridge.clone(),
            table.clone(),
            shutdown.subscribe(),
        ));

        info!(identity = %identity, listen = %local_addr, "relay started");

        Ok(Self {
            identity,
            bridge,
            table,
            local_addr,
            shutdown,
            loops: Mutex::new(vec![inbound_local, acceptor]),
        })
    }

    pub fn identity(&self) -> RelayIdentity {
        self.identity
    }

    /// The bound TCP address peers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connect out to a remote relay at `address` (`host[:port]`, default
    /// port 24779), announce our identity and register the link.
    ///
    /// On connect failure an error is returned and the table is unchanged.
    /// Returns the peer identifier the link was registered under.
    pub async fn add_peer(&self, address: &str) -> Result<String> {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("invalid peer port {port:?}"))?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };

        let mut stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("TCP connection to {host}:{port} failed"))?;
        let peer_addr = stream
            .peer_addr()
            .context("resolve peer socket address")?;

        // Announce who we are so the remote table can key our link.
        stream
            .write_all(&encode_peer_id(&self.identity.quad_string()))
            .await
            .with_context(|| format!("handshake with {host}:{port} failed"))?;

        let peer_id = host.to_string();
        let (link, task) = PeerLink::spawn(
            peer_id.clone(),
            peer_addr,
            stream,
            self.identity.quad(),
            self.bridge.clone(),
            self.table.clone(),
        );
        self.table.add_or_replace(link, task).await;
        info!(peer = %peer_id, addr = %peer_addr, "registered outbound peer");
        Ok(peer_id)
    }

    /// Orderly teardown of the link to `peer_id`; false if no such
    /// connection exists.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let removed = self.table.remove(peer_id).await;
        if removed {
            info!(peer = %peer_id, "deleted peer");
        }
        removed
    }

    /// Snapshot of connected peers for display, in identifier order.
    pub async fn peers(&self) -> Vec<(String, SocketAddr)> {
        self.table
            .snapshot()
            .await
            .into_iter()
            .map(|(peer_id, link)| (peer_id, link.peer_addr()))
            .collect()
    }

    /// Signal every loop, tear down all peer links and join everything.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.table.shutdown().await;
        let mut loops = self.loops.lock().await;
        for task in loops.drain(..) {
            let _ = task.await;
        }
        info!(identity = %self.identity, "relay shut down");
    }
}

/// UDP to TCP: local broadcasts fan out to every connected peer.
async fn inbound_local_loop(
    self_quad: [u8; QUAD_SIZE],
    bridge: Arc<dyn LocalBridge>,
    table: ConnectionTable,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        let len = tokio::select! {
            _ = shutdown_rx.changed() => break,
            res = bridge.receive(&mut buf) => match res {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "local receive failed");
                    continue;
                }
            }
        };

        let mut packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "ignoring non-relay frame");
                continue;
            }
        };
        if packet.is_duplicate(&self_quad) {
            debug!(hop = packet.hop(), "dropping local frame already relayed here");
            continue;
        }
        if let Err(e) = packet.stamp(self_quad) {
            warn!(error = %e, "dropping local packet");
            continue;
        }

        let frame = packet.encode();
        for (peer_id, link) in table.snapshot().await {
            match link.send(&frame).await {
                Ok(()) => debug!(
                    peer = %peer_id,
                    payload = %String::from_utf8_lossy(packet.payload()),
                    "relayed to peer"
                ),
                Err(e) => {
                    // One dead peer must not abort delivery to the rest.
                    warn!(peer = %peer_id, error = %e, "send failed, removing peer");
                    table.remove(&peer_id).await;
                }
            }
        }
    }
}

/// Accept inbound peer connections and register their links.
async fn accept_loop(
    listener: TcpListener,
    self_quad: [u8; QUAD_SIZE],
    bridge: Arc<dyn LocalBridge>,
    table: ConnectionTable,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown_rx.changed() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    // A refused or reset connection is not fatal to the relay.
                    warn!(error = %e, "accept failed");
                    continue;
                }
            }
        };
        debug!(addr = %peer_addr, "inbound connection");

        // Handshake in its own task so a silent peer cannot stall accepts.
        let bridge = bridge.clone();
        let table = table.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream)).await {
                Ok(Ok(peer_id)) => {
                    info!(peer = %peer_id, addr = %peer_addr, "registered inbound peer");
                    let (link, task) =
                        PeerLink::spawn(peer_id, peer_addr, stream, self_quad, bridge, table.clone());
                    table.add_or_replace(link, task).await;
                }
                Ok(Err(e)) => warn!(addr = %peer_addr, error = %e, "peer handshake failed"),
                Err(_) => warn!(addr = %peer_addr, "peer handshake timed out"),
            }
        });
    }
}

/// Read the fixed announcement block from a freshly accepted connection.
async fn read_handshake(stream: &mut TcpStream) -> std::io::Result<String> {
    use tokio::io::AsyncReadExt;

    let mut block = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut block).await?;
    let peer_id = decode_peer_id(&block);
    if peer_id.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "empty peer identifier",
        ));
    }
    Ok(peer_id)
}
