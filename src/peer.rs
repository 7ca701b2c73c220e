//! Peer links: one TCP connection to a remote relay.
//!
//! A [`PeerLink`] owns exactly one socket for its lifetime: the write half
//! lives behind the link's async mutex, the read half is consumed by the
//! link's background receive task. The connection table holds the link by
//! `Arc` keyed on the peer identifier.
//!
//! Teardown is cooperative: [`PeerLink::terminate`] flips the link's cancel
//! signal and shuts down the write half; the receive task observes the
//! signal (or the dying socket) at its next suspension point and exits after
//! removing its own table entry.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::LocalBridge;
use crate::packet::{Packet, MAX_PACKET_SIZE, QUAD_SIZE};
use crate::table::ConnectionTable;

/// Size of the fixed handshake block announcing a peer identifier.
/// Sent by the connecting side immediately after the TCP connect.
pub const HANDSHAKE_SIZE: usize = 32;

/// Bound on a single frame write. A peer stalled longer than this is
/// treated as dead so a full send buffer cannot wedge the relay.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Encode a peer identifier into a NUL-padded handshake block.
/// Identifiers longer than the block are truncated.
pub fn encode_peer_id(peer_id: &str) -> [u8; HANDSHAKE_SIZE] {
    let mut block = [0u8; HANDSHAKE_SIZE];
    let bytes = peer_id.as_bytes();
    let len = bytes.len().min(HANDSHAKE_SIZE);
    block[..len].copy_from_slice(&bytes[..len]);
    block
}

/// Decode a handshake block back into the announced identifier.
pub fn decode_peer_id(block: &[u8; HANDSHAKE_SIZE]) -> String {
    let len = block.iter().position(|&b| b == 0).unwrap_or(HANDSHAKE_SIZE);
    String::from_utf8_lossy(&block[..len]).into_owned()
}

/// One live TCP connection to a remote relay.
pub struct PeerLink {
    peer_id: String,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    cancel: watch::Sender<bool>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl PeerLink {
    /// Wrap an established connection and start its receive task.
    ///
    /// The task reads fixed-size frames, drops duplicates, stamps the local
    /// quad and re-broadcasts on the local segment; when the socket closes
    /// or the link is cancelled it removes its own table entry and exits.
    /// The returned [`JoinHandle`] belongs in the connection table so the
    /// task can be joined on teardown.
    pub fn spawn(
        peer_id: String,
        peer_addr: SocketAddr,
        stream: TcpStream,
        self_quad: [u8; QUAD_SIZE],
        bridge: Arc<dyn LocalBridge>,
        table: ConnectionTable,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (read_half, write_half) = stream.into_split();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let link = Arc::new(Self {
            peer_id,
            peer_addr,
            writer: Mutex::new(write_half),
            cancel: cancel_tx,
        });
        let task = tokio::spawn(run_receive(
            read_half,
            cancel_rx,
            link.clone(),
            self_quad,
            bridge,
            table,
        ));
        (link, task)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one wire frame to the peer.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(SEND_TIMEOUT, writer.write_all(frame)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer send timed out",
            )),
        }
    }

    /// Orderly teardown: cancel the receive task and half-close the socket.
    /// Idempotent; a repeated shutdown on a closed socket is ignored.
    pub async fn terminate(&self) {
        let _ = self.cancel.send(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

async fn run_receive(
    mut reader: OwnedReadHalf,
    mut cancel_rx: watch::Receiver<bool>,
    link: Arc<PeerLink>,
    self_quad: [u8; QUAD_SIZE],
    bridge: Arc<dyn LocalBridge>,
    table: ConnectionTable,
) {
    let peer_id = link.peer_id().to_string();
    let mut frame = [0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                debug!(peer = %peer_id, "receive task cancelled");
                break;
            }
            res = reader.read_exact(&mut frame) => {
                match res {
                    Ok(_) => relay_inbound(&frame, &peer_id, self_quad, bridge.as_ref()).await,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        debug!(peer = %peer_id, "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "peer receive failed");
                        break;
                    }
                }
            }
        }
    }

    // Reclaim our entry unless a replacement already took the name.
    table.remove_link(&link);
}

/// One frame off the TCP leg: decode, drop duplicates, stamp, re-broadcast.
async fn relay_inbound(
    frame: &[u8; MAX_PACKET_SIZE],
    peer_id: &str,
    self_quad: [u8; QUAD_SIZE],
    bridge: &dyn LocalBridge,
) {
    let mut packet = match Packet::decode(frame) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "ignoring malformed frame");
            return;
        }
    };

    if packet.is_duplicate(&self_quad) {
        debug!(peer = %peer_id, hop = packet.hop(), "dropping packet already relayed here");
        return;
    }

    debug!(
        peer = %peer_id,
        bytes = packet.payload().len(),
        payload = %String::from_utf8_lossy(packet.payload()),
        "received from peer"
    );

    if let Err(e) = packet.stamp(self_quad) {
        warn!(peer = %peer_id, error = %e, "dropping packet");
        return;
    }
    if let Err(e) = bridge.broadcast(&packet.encode()).await {
        warn!(peer = %peer_id, error = %e, "local broadcast failed");
    }
}
