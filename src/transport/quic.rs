use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _};
use quinn::{Connecting, Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::QuicTransportConfig;
use crate::transport::backoff::AcceptBackoff;
use crate::transport::frame::{self, MessageType};
use crate::transport::metrics::TransportMetrics;
use crate::transport::stream::GossipStream;
use crate::transport::{Packet, Transport};
use crate::util::net;

/// A [Transport] that carries both packets and streams over QUIC.
///
/// Every operation uses a fresh QUIC connection - there is deliberately no connection reuse,
///  mirroring the sendto-style semantics the membership layer expects for packets. The type
///  byte written as the first byte of a connection's first stream decides whether the rest is
///  one framed packet or an opaque stream handed to the membership layer.
#[derive(Debug)]
pub struct QuicTransport {
    shared: Arc<TransportShared>,
    // Endpoints are clonable handles onto their driver, so storing them by value is fine.
    listeners: Vec<Endpoint>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    stream_rx: Mutex<Option<mpsc::Receiver<GossipStream>>>,
}

/// The part of the transport's state that acceptor workers and dispatcher tasks hold on to
///  after the constructor returns.
#[derive(Debug)]
struct TransportShared {
    cfg: QuicTransportConfig,
    packet_tx: mpsc::Sender<Packet>,
    stream_tx: mpsc::Sender<GossipStream>,
    shutdown: AtomicBool,
    advertise_addr: RwLock<String>,
    metrics: TransportMetrics,
}

impl QuicTransport {
    /// Creates the transport. On success all listeners are bound and their acceptor workers
    ///  are running, so this must be called from within a tokio runtime.
    pub fn new(mut cfg: QuicTransportConfig, registry: &prometheus::Registry) -> anyhow::Result<QuicTransport> {
        if cfg.bind_addrs.is_empty() {
            cfg.bind_addrs = vec!["0.0.0.0".to_string()];
        }

        let metrics = TransportMetrics::new(&cfg.metrics_namespace, registry)?;

        // Capacity 1 is the closest tokio gets to a rendezvous channel: a slow membership
        //  consumer stalls the dispatcher tasks and ultimately the accept loops.
        let (packet_tx, packet_rx) = mpsc::channel(1);
        let (stream_tx, stream_rx) = mpsc::channel(1);

        let server_config = quinn::ServerConfig::with_crypto(cfg.tls.server.clone());

        let mut listeners = Vec::with_capacity(cfg.bind_addrs.len());
        if let Err(e) = bind_listeners(&cfg, server_config, &mut listeners) {
            // roll back whatever was bound before the failure
            for listener in &listeners {
                listener.close(VarInt::from_u32(0), b"");
            }
            return Err(e);
        }

        let shared = Arc::new(TransportShared {
            cfg,
            packet_tx,
            stream_tx,
            shutdown: AtomicBool::new(false),
            advertise_addr: RwLock::new(String::new()),
            metrics,
        });

        let acceptors = listeners.iter()
            .map(|listener| tokio::spawn(shared.clone().accept_loop(listener.clone())))
            .collect::<Vec<_>>();

        Ok(QuicTransport {
            shared,
            listeners,
            acceptors: Mutex::new(acceptors),
            packet_rx: Mutex::new(Some(packet_rx)),
            stream_rx: Mutex::new(Some(stream_rx)),
        })
    }
}

fn bind_listeners(
    cfg: &QuicTransportConfig,
    server_config: quinn::ServerConfig,
    listeners: &mut Vec<Endpoint>,
) -> anyhow::Result<()> {
    let mut port = cfg.bind_port;

    for addr in &cfg.bind_addrs {
        let ip = addr.parse::<IpAddr>()
            .with_context(|| format!("could not parse bind addr {:?} as IP address", addr))?;

        let listener = Endpoint::server(server_config.clone(), SocketAddr::new(ip, port))
            .with_context(|| format!("failed to start QUIC listener on {:?} port {}", addr, port))?;

        // If the configured port was 0, the first listener picks a free port and all further
        //  listeners share it.
        if port == 0 {
            port = listener.local_addr()
                .context("failed to read local address of fresh listener")?
                .port();
        }

        listeners.push(listener);
    }
    Ok(())
}

#[async_trait::async_trait]
impl Transport for QuicTransport {
    async fn take_packet_ch(&self) -> anyhow::Result<mpsc::Receiver<Packet>> {
        self.packet_rx.lock().await
            .take()
            .ok_or_else(|| anyhow!("packet channel was already taken"))
    }

    async fn take_stream_ch(&self) -> anyhow::Result<mpsc::Receiver<GossipStream>> {
        self.stream_rx.lock().await
            .take()
            .ok_or_else(|| anyhow!("stream channel was already taken"))
    }

    async fn write_to(&self, msg: &[u8], addr: &str) -> Instant {
        self.shared.metrics.sent_packets.inc();
        self.shared.metrics.sent_packets_bytes.inc_by(msg.len() as u64);

        if let Err(e) = self.shared.send_packet(msg, addr).await {
            self.shared.metrics.sent_packets_errors.inc();

            let err = format!("{:#}", e);
            if err.contains("connection refused") {
                // Common when the target node is shutting down - not a warning condition on
                //  the sender side.
                if self.shared.cfg.transport_debug {
                    debug!(addr, error = %err, "sending packet failed");
                }
            } else {
                warn!(addr, error = %err, "sending packet failed");
            }
        }

        Instant::now()
    }

    async fn dial_timeout(&self, addr: &str, timeout: Duration) -> anyhow::Result<GossipStream> {
        self.shared.metrics.outgoing_streams.inc();

        match self.shared.open_stream(addr, timeout).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.shared.metrics.outgoing_stream_errors.inc();
                Err(e)
            }
        }
    }

    async fn final_advertise_addr(&self, ip: Option<&str>, port: u16) -> anyhow::Result<(IpAddr, u16)> {
        let (advertise_ip, advertise_port) = match ip {
            Some(ip) if !ip.is_empty() => {
                let parsed = ip.parse::<IpAddr>()
                    .with_context(|| format!("failed to parse advertise address {:?}", ip))?;
                (parsed, port)
            }
            _ => {
                let ip = match self.shared.cfg.bind_addrs[0].as_str() {
                    // Not bound to a specific IP, so pick a suitable one from the host's
                    //  interfaces.
                    "0.0.0.0" => net::preferred_private_ipv4()
                        .context("failed to get interface addresses")?,
                    "::" => net::preferred_ipv6()
                        .context("failed to get interface addresses")?,
                    _ => self.listeners[0].local_addr()
                        .context("failed to read listener address")?
                        .ip(),
                };
                (ip, self.auto_bind_port())
            }
        };

        debug!(ip = %advertise_ip, port = advertise_port, "final advertise address");

        *self.shared.advertise_addr.write().await =
            SocketAddr::new(advertise_ip, advertise_port).to_string();

        Ok((advertise_ip, advertise_port))
    }

    fn auto_bind_port(&self) -> u16 {
        // There is at least one listener, and its port was applied to all the others for the
        //  dynamic bind case.
        self.listeners[0].local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        // silences the accept loops' error logging for the regular exit path
        self.shared.shutdown.store(true, Ordering::SeqCst);

        for listener in &self.listeners {
            listener.close(VarInt::from_u32(0), b"");
        }

        // Only the acceptor workers are awaited. Dispatcher tasks still reading a frame get
        //  their streams torn down by the endpoint close and exit on their own.
        for acceptor in self.acceptors.lock().await.drain(..) {
            if let Err(e) = acceptor.await {
                warn!(error = %e, "acceptor worker exited abnormally");
            }
        }
        Ok(())
    }
}

impl TransportShared {
    /// Long-running worker pulling incoming connections off one listener. Each accepted
    ///  connection is dispatched on its own task so a slow handshake or a blocked handoff
    ///  never stalls the accept loop itself.
    async fn accept_loop(self: Arc<Self>, listener: Endpoint) {
        let mut backoff = AcceptBackoff::new();

        loop {
            match listener.accept().await {
                Some(connecting) => {
                    backoff.reset();
                    tokio::spawn(self.clone().handle_connection(connecting));
                }
                None => {
                    // The endpoint yields nothing once it is closed. During shutdown that is
                    //  the regular exit; otherwise back off and retry.
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }

                    let delay = backoff.next_delay();
                    error!(?delay, "error accepting QUIC connection, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Classifies one accepted connection by the first byte of its first stream and routes it
    ///  to packet or stream delivery.
    async fn handle_connection(self: Arc<Self>, connecting: Connecting) {
        let conn = match connecting.await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to complete incoming handshake");
                return;
            }
        };

        if self.cfg.transport_debug {
            debug!(remote = %conn.remote_address(), "new connection");
        }

        let (send, mut recv) = match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                warn!(error = %e, remote = %conn.remote_address(), "failed to accept stream");
                return;
            }
        };

        let mut msg_type = [0u8; 1];
        if let Err(e) = recv.read_exact(&mut msg_type).await {
            warn!(error = %e, remote = %conn.remote_address(), "failed to read message type");
            return;
        }

        match MessageType::try_from(msg_type[0]) {
            Ok(MessageType::Stream) => {
                self.metrics.incoming_streams.inc();

                // Hand the connection over; the membership layer owns it from here on,
                //  including closing it.
                let stream = GossipStream::incoming(conn, send, recv);
                if self.stream_tx.send(stream).await.is_err() {
                    warn!("stream channel receiver is gone, dropping incoming stream");
                }
            }
            Ok(MessageType::Packet) => {
                self.metrics.received_packets.inc();
                self.read_packet(&conn, recv).await;
                conn.close(VarInt::from_u32(0), b"");
            }
            Err(_) => {
                self.metrics.unknown_connections.inc();
                error!(msg_type = msg_type[0], remote = %conn.remote_address(), "unknown message type");
                conn.close(VarInt::from_u32(0), b"");
            }
        }
    }

    /// Reads one packet frame off `recv` and delivers it to the packet channel. All read and
    ///  parse failures are counted and end the delivery; there are no retries within a frame.
    async fn read_packet(&self, conn: &Connection, mut recv: RecvStream) {
        let remote = conn.remote_address();

        let mut addr_len = [0u8; 1];
        if let Err(e) = recv.read_exact(&mut addr_len).await {
            self.metrics.received_packets_errors.inc();
            warn!(error = %e, remote = %remote, "error reading sender address length from packet");
            return;
        }

        let mut addr_buf = vec![0u8; addr_len[0] as usize];
        if let Err(e) = recv.read_exact(&mut addr_buf).await {
            self.metrics.received_packets_errors.inc();
            warn!(error = %e, remote = %remote, "error reading sender address from packet");
            return;
        }

        // the rest of the stream is the payload followed by its digest
        let buf = match recv.read_to_end(frame::MAX_PACKET_SIZE).await {
            Ok(buf) => buf,
            Err(e) => {
                self.metrics.received_packets_errors.inc();
                warn!(error = %e, remote = %remote, "error reading packet data");
                return;
            }
        };

        let (payload, digest_ok) = match frame::split_digest(buf) {
            Ok(split) => split,
            Err(e) => {
                self.metrics.received_packets_errors.inc();
                warn!(error = %e, remote = %remote, "discarding truncated packet");
                return;
            }
        };
        if !digest_ok {
            // counted and logged, but the packet is still delivered
            self.metrics.received_packets_errors.inc();
            warn!(remote = %remote, size = payload.len(), "packet digest mismatch");
        }

        let from = String::from_utf8_lossy(&addr_buf).into_owned();
        if self.cfg.transport_debug {
            debug!(from = %from, size = payload.len(), "received packet");
        }

        self.metrics.received_packets_bytes.inc_by(payload.len() as u64);

        let packet = Packet {
            buf: payload,
            from,
            timestamp: Instant::now(),
        };
        if self.packet_tx.send(packet).await.is_err() {
            warn!("packet channel receiver is gone, dropping packet");
        }
    }

    /// Opens a fresh connection to `addr`. Outbound connections are never reused, and every
    ///  one gets a new socket with a random source port - which is why packet frames carry the
    ///  advertised address.
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> anyhow::Result<(Endpoint, Connection)> {
        let bind_addr = if addr.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };

        let endpoint = Endpoint::client(bind_addr)
            .context("failed to bind outbound socket")?;

        let client_config = quinn::ClientConfig::new(self.cfg.tls.client.clone());
        let connecting = endpoint.connect_with(client_config, addr, &addr.ip().to_string())
            .with_context(|| format!("dialing {}", addr))?;

        let conn = if timeout.is_zero() {
            connecting.await
        } else {
            tokio::time::timeout(timeout, connecting).await
                .map_err(|_| anyhow!("connect timeout after {:?}", timeout))?
        };

        Ok((endpoint, conn.with_context(|| format!("dialing {}", addr))?))
    }

    async fn send_packet(&self, msg: &[u8], addr: &str) -> anyhow::Result<()> {
        let peer = addr.parse::<SocketAddr>()
            .with_context(|| format!("could not parse target address {:?}", addr))?;

        let (_endpoint, conn) = self.connect(peer, self.cfg.packet_dial_timeout).await?;
        let (mut send, _recv) = conn.open_bi().await.context("opening stream")?;

        // The digest and the header are prepared before the write deadline starts ticking, so
        //  their cost is not charged against the write timeout.
        let digest = frame::payload_digest(msg);
        let header = frame::packet_header(&self.advertised_addr().await)?;

        let deadline = if self.cfg.packet_write_timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + self.cfg.packet_write_timeout)
        };

        write_with_deadline(&mut send, &header, deadline).await.context("sending local address")?;
        write_with_deadline(&mut send, msg, deadline).await.context("sending data")?;
        write_with_deadline(&mut send, &digest, deadline).await.context("digest")?;

        // finish is synchronous: it only flags the FIN, the data writes above are what the
        //  deadline bounds
        send.finish().await.context("close")?;
        conn.close(VarInt::from_u32(0), b"");

        if self.cfg.transport_debug {
            debug!(addr, size = msg.len(), "packet sent");
        }
        Ok(())
    }

    async fn open_stream(&self, addr: &str, timeout: Duration) -> anyhow::Result<GossipStream> {
        let peer = addr.parse::<SocketAddr>()
            .with_context(|| format!("could not parse target address {:?}", addr))?;

        let (endpoint, conn) = self.connect(peer, timeout).await?;
        let (mut send, recv) = conn.open_bi().await.context("opening stream")?;

        if let Err(e) = send.write_all(&[MessageType::Stream.into()]).await {
            conn.close(VarInt::from_u32(0), b"");
            return Err(anyhow!(e).context("sending stream marker"));
        }

        Ok(GossipStream::outgoing(endpoint, conn, send, recv))
    }

    async fn advertised_addr(&self) -> String {
        self.advertise_addr.read().await.clone()
    }
}

async fn write_with_deadline(
    send: &mut SendStream,
    buf: &[u8],
    deadline: Option<tokio::time::Instant>,
) -> anyhow::Result<()> {
    match deadline {
        Some(deadline) => {
            tokio::time::timeout_at(deadline, send.write_all(buf)).await
                .map_err(|_| anyhow!("write timeout"))??;
        }
        None => send.write_all(buf).await?,
    }
    Ok(())
}


#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use crate::test_util::{test_config, test_tls_material};

    use super::*;

    async fn test_transport() -> (QuicTransport, mpsc::Receiver<Packet>, mpsc::Receiver<GossipStream>, String) {
        let cfg = test_config(vec!["127.0.0.1".to_string()], 0);
        let transport = QuicTransport::new(cfg, &prometheus::Registry::new()).unwrap();

        let packet_rx = transport.take_packet_ch().await.unwrap();
        let stream_rx = transport.take_stream_ch().await.unwrap();

        let (ip, port) = transport.final_advertise_addr(None, 0).await.unwrap();
        let addr = format!("{}:{}", ip, port);

        (transport, packet_rx, stream_rx, addr)
    }

    #[tokio::test]
    async fn test_packet_round_trip() {
        let (a, _a_packets, _a_streams, a_addr) = test_transport().await;
        let (b, mut b_packets, _b_streams, b_addr) = test_transport().await;

        a.write_to(b"hello", &b_addr).await;

        let packet = timeout(Duration::from_secs(1), b_packets.recv()).await
            .expect("no packet within 1s")
            .expect("packet channel closed");
        assert_eq!(packet.buf, b"hello");
        assert_eq!(packet.from, a_addr);

        assert_eq!(a.shared.metrics.sent_packets.get(), 1);
        assert_eq!(a.shared.metrics.sent_packets_errors.get(), 0);
        assert_eq!(b.shared.metrics.received_packets.get(), 1);
        assert_eq!(b.shared.metrics.received_packets_bytes.get(), 5);
        assert_eq!(b.shared.metrics.received_packets_errors.get(), 0);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_packet_round_trip() {
        let (a, _a_packets, _a_streams, _a_addr) = test_transport().await;
        let (b, mut b_packets, _b_streams, b_addr) = test_transport().await;

        a.write_to(b"", &b_addr).await;

        let packet = timeout(Duration::from_secs(1), b_packets.recv()).await
            .expect("no packet within 1s")
            .expect("packet channel closed");
        assert!(packet.buf.is_empty());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (a, _a_packets, _a_streams, _a_addr) = test_transport().await;
        let (b, _b_packets, mut b_streams, b_addr) = test_transport().await;

        let mut dialed = a.dial_timeout(&b_addr, Duration::from_secs(1)).await.unwrap();
        dialed.write_all(b"ping").await.unwrap();

        let mut accepted = timeout(Duration::from_secs(1), b_streams.recv()).await
            .expect("no stream within 1s")
            .expect("stream channel closed");

        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        dialed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(a.shared.metrics.outgoing_streams.get(), 1);
        assert_eq!(a.shared.metrics.outgoing_stream_errors.get(), 0);
        assert_eq!(b.shared.metrics.incoming_streams.get(), 1);

        accepted.close();
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_bind_port_is_mirrored_across_listeners() {
        let cfg = test_config(vec!["127.0.0.1".to_string(), "127.0.0.2".to_string()], 0);
        let transport = QuicTransport::new(cfg, &prometheus::Registry::new()).unwrap();

        let port = transport.auto_bind_port();
        assert_ne!(port, 0);
        for listener in &transport.listeners {
            assert_eq!(listener.local_addr().unwrap().port(), port);
        }

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unparseable_bind_addr_fails_construction() {
        let cfg = test_config(vec!["not-an-ip".to_string()], 0);
        let err = QuicTransport::new(cfg, &prometheus::Registry::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("could not parse bind addr"));
    }

    #[tokio::test]
    async fn test_channels_can_only_be_taken_once() {
        let (transport, _packets, _streams, _addr) = test_transport().await;

        assert!(transport.take_packet_ch().await.is_err());
        assert!(transport.take_stream_ch().await.is_err());

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_to_a_dead_peer_is_counted_not_surfaced() {
        let (a, _a_packets, _a_streams, _a_addr) = test_transport().await;
        let (b, _b_packets, _b_streams, b_addr) = test_transport().await;
        b.shutdown().await.unwrap();

        a.write_to(b"probe", &b_addr).await;

        assert_eq!(a.shared.metrics.sent_packets.get(), 1);
        assert_eq!(a.shared.metrics.sent_packets_errors.get(), 1);

        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt_and_final() {
        let (transport, mut packets, _streams, _addr) = test_transport().await;

        timeout(Duration::from_secs(2), transport.shutdown()).await
            .expect("shutdown did not finish within 2s")
            .unwrap();

        assert!(packets.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_counted_and_dropped() {
        let (b, _b_packets, _b_streams, b_addr) = test_transport().await;

        let endpoint = Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        let client_config = quinn::ClientConfig::new(test_tls_material().client);
        let conn = endpoint
            .connect_with(client_config, b_addr.parse().unwrap(), "127.0.0.1")
            .unwrap()
            .await
            .unwrap();
        let (mut send, _recv) = conn.open_bi().await.unwrap();
        send.write_all(&[0x07]).await.unwrap();
        send.finish().await.unwrap();

        for _ in 0..100 {
            if b.shared.metrics.unknown_connections.get() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.shared.metrics.unknown_connections.get(), 1);
        assert_eq!(b.shared.metrics.received_packets.get(), 0);
        assert_eq!(b.shared.metrics.incoming_streams.get(), 0);

        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_advertise_hint_is_used_verbatim() {
        let (transport, _packets, _streams, _addr) = test_transport().await;

        let (ip, port) = transport.final_advertise_addr(Some("10.1.2.3"), 12345).await.unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(port, 12345);
        assert_eq!(*transport.shared.advertise_addr.read().await, "10.1.2.3:12345");

        assert!(transport.final_advertise_addr(Some("not-an-ip"), 1).await.is_err());

        transport.shutdown().await.unwrap();
    }
}
