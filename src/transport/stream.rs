use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bidirectional byte stream between two nodes, used by the membership layer for state
///  push/pull. It adapts one QUIC connection and its first bidirectional stream to the plain
///  `AsyncRead` / `AsyncWrite` interface the membership layer expects; callers that need a
///  bound on stream I/O wrap their reads and writes in `tokio::time::timeout`.
///
/// The stream owns the connection: dropping it (or calling [GossipStream::close]) tears the
///  connection down. For outbound dials it also owns the client endpoint that produced the
///  connection, so the connection does not die when the dial call returns.
pub struct GossipStream {
    conn: Connection,
    send: SendStream,
    recv: RecvStream,
    _endpoint: Option<Endpoint>,
}

impl GossipStream {
    pub(crate) fn incoming(conn: Connection, send: SendStream, recv: RecvStream) -> GossipStream {
        GossipStream {
            conn,
            send,
            recv,
            _endpoint: None,
        }
    }

    pub(crate) fn outgoing(endpoint: Endpoint, conn: Connection, send: SendStream, recv: RecvStream) -> GossipStream {
        GossipStream {
            conn,
            send,
            recv,
            _endpoint: Some(endpoint),
        }
    }

    /// The peer's socket address. For inbound streams this has the peer's random source port,
    ///  not its advertised address.
    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Closes the underlying connection immediately, discarding anything still in flight.
    pub fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"");
    }
}

impl Debug for GossipStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GossipStream{{remote:{}}}", self.conn.remote_address())
    }
}

impl AsyncRead for GossipStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for GossipStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
