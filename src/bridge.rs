//! Local broadcast transport.
//!
//! The relay engine only needs two primitives from its local segment: send
//! one frame to everyone on it, and block until someone else's frame
//! arrives. [`LocalBridge`] is that seam; [`UdpBridge`] is the production
//! implementation over a UDP broadcast or multicast group. Tests substitute
//! channel-backed doubles.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

/// Send/receive primitives for the local segment.
///
/// `receive` must accept a buffer of at least
/// [`MAX_PACKET_SIZE`](crate::packet::MAX_PACKET_SIZE) bytes.
#[async_trait]
pub trait LocalBridge: Send + Sync + 'static {
    /// Broadcast one frame to the local segment.
    async fn broadcast(&self, frame: &[u8]) -> io::Result<()>;

    /// Block until a frame arrives from the local segment; returns its length.
    async fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// UDP implementation of [`LocalBridge`].
///
/// The relay identity's quad doubles as the segment address: when it is a
/// multicast group the socket joins it, otherwise plain broadcast is
/// enabled. Frames are sent to `quad:port` and received on `port`.
pub struct UdpBridge {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl UdpBridge {
    /// Bind the local segment socket for the given group address and port.
    pub async fn bind(group_addr: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        if group_addr.is_multicast() {
            socket.join_multicast_v4(group_addr, Ipv4Addr::UNSPECIFIED)?;
        } else {
            socket.set_broadcast(true)?;
        }
        debug!(group = %group_addr, port, "local bridge bound");
        Ok(Self {
            socket,
            group: SocketAddrV4::new(group_addr, port),
        })
    }
}

#[async_trait]
impl LocalBridge for UdpBridge {
    async fn broadcast(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send_to(frame, self.group).await?;
        Ok(())
    }

    async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (len, _from) = self.socket.recv_from(buf).await?;
        Ok(len)
    }
}
