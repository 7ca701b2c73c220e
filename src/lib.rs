//! # Segrelay - UDP Segment Relay over a TCP Peer Mesh
//!
//! A segrelay node bridges one local UDP broadcast/multicast segment with a
//! mesh of remote peer relays reachable over TCP. Messages broadcast on the
//! local segment are forwarded to every connected peer; messages arriving
//! from any peer are re-broadcast locally. Peers are relays on other
//! segments, so a message injected anywhere floods to every transitively
//! connected segment.
//!
//! Loop prevention is path-vector: every packet carries the quads of the
//! relays it has traversed, each forwarding relay stamps its own quad, and
//! no relay re-forwards a packet whose path already contains it.
//!
//! ## Architecture
//!
//! Shared state is owned by actors: the connection table is a public
//! [`ConnectionTable`] handle in front of a private actor task that is the
//! sole mutator of the peer map. Everything else is a long-lived task
//! blocking on its own I/O source - the inbound-local loop, the accept
//! loop, and one receive task per peer link - coordinating only through the
//! table. Teardown is cooperative: removal shuts the peer socket down and
//! flips a cancel signal, and the receive task exits at its next suspension
//! point.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | The relay engine: engine loops and peer management |
//! | `identity` | Relay identity (quad + port) and startup-string parsing |
//! | `packet` | Wire packet codec and path-vector duplicate detection |
//! | `bridge` | Local segment transport seam and its UDP implementation |
//! | `peer` | Peer links: socket ownership, handshake, receive task |
//! | `table` | Actor-owned connection table and task reclamation |
//! | `console` | Line-oriented admin console |

mod bridge;
pub mod console;
mod identity;
mod node;
mod packet;
mod peer;
mod table;

pub use bridge::{LocalBridge, UdpBridge};
pub use identity::{AddressError, RelayIdentity, ADDR_STR_LEN, DEFAULT_PORT};
pub use node::{Relay, HANDSHAKE_TIMEOUT};
pub use packet::{Packet, PacketError, MAX_PACKET_SIZE, PACKET_MAGIC, QUAD_SIZE};
pub use peer::{decode_peer_id, encode_peer_id, PeerLink, HANDSHAKE_SIZE, SEND_TIMEOUT};
pub use table::{ConnectionTable, EXPIRED_TASK_BACKLOG};
