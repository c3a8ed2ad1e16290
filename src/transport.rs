pub mod backoff;
pub mod frame;
pub mod metrics;
pub mod quic;
pub mod stream;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::transport::stream::GossipStream;

/// A "packet" in the sense the membership protocol uses the word: a best-effort,
///  datagram-sized message from a peer. Delivery is not guaranteed, ordering is not
///  guaranteed across peers, and losses show up as counters rather than errors.
#[derive(Debug)]
pub struct Packet {
    /// The raw payload, with framing and integrity trailer already stripped.
    pub buf: Vec<u8>,

    /// The address the sender wants to be known by (`"ip:port"`). This is carried inside the
    ///  frame rather than taken from the socket: every outbound connection uses a fresh random
    ///  source port, so the socket address would mis-identify the sender.
    pub from: String,

    /// When the packet was read off the wire.
    pub timestamp: Instant,
}

/// The contract the membership layer programs against. It decouples failure detection and
///  state sync from how bytes actually move between nodes.
///
/// Inbound traffic arrives on two channels: packets on the packet channel, accepted streams on
///  the stream channel. Each receiver can be taken exactly once; both channels hand off with
///  minimal buffering, so a slow consumer applies backpressure all the way to the accept loop.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Takes the receiving end of the packet channel. Fails on the second call.
    async fn take_packet_ch(&self) -> anyhow::Result<mpsc::Receiver<Packet>>;

    /// Takes the receiving end of the stream channel. Fails on the second call.
    ///
    /// Streams arriving here are owned by the caller, including the responsibility to close
    ///  them when done.
    async fn take_stream_ch(&self) -> anyhow::Result<mpsc::Receiver<GossipStream>>;

    /// Fires off one packet to `addr` (an `"ip:port"` string) and returns the send time.
    ///
    /// Send failures are counted and logged but deliberately not surfaced: the membership
    ///  layer treats packet sends as fire-and-forget and re-drives its probes on loss.
    async fn write_to(&self, msg: &[u8], addr: &str) -> Instant;

    /// Opens a bidirectional byte stream to `addr` for two-way communication with a peer.
    ///  A zero timeout means no timeout.
    async fn dial_timeout(&self, addr: &str, timeout: Duration) -> anyhow::Result<GossipStream>;

    /// Given the user's configured advertise hints (which may be absent), resolves the address
    ///  this node publishes to the rest of the cluster, and caches it for inclusion in
    ///  outbound packet frames.
    async fn final_advertise_addr(&self, ip: Option<&str>, port: u16)
        -> anyhow::Result<(IpAddr, u16)>;

    /// The port all listeners are bound to. Relevant when the configured bind port was 0 and
    ///  the kernel picked one.
    fn auto_bind_port(&self) -> u16;

    /// Closes all listeners and waits for the acceptor workers to exit. Called exactly once.
    async fn shutdown(&self) -> anyhow::Result<()>;
}
