use std::sync::Arc;
use std::time::Duration;

/// TLS material for the transport, prepared by certificate management outside this crate.
///  QUIC has no cleartext mode, so the transport cannot be constructed without it.
#[derive(Clone, Debug)]
pub struct TlsMaterial {
    pub client: Arc<rustls::ClientConfig>,
    pub server: Arc<rustls::ServerConfig>,
}

/// Configuration for [crate::transport::quic::QuicTransport]. Immutable once the transport is
///  constructed.
#[derive(Clone, Debug)]
pub struct QuicTransportConfig {
    /// IP addresses to bind to, as text. An empty list is treated as `["0.0.0.0"]`.
    pub bind_addrs: Vec<String>,

    /// Port to listen on, for each address above. 0 lets the kernel pick a free port, which is
    ///  then applied to all bind addresses so every socket shares it.
    pub bind_port: u16,

    /// Timeout used when connecting to another node to send a packet. Zero means no timeout.
    pub packet_dial_timeout: Duration,

    /// Timeout for writing packet data. Zero means no timeout.
    pub packet_write_timeout: Duration,

    /// The transport produces a lot of debug-level chatter, so it gets its own switch on top of
    ///  the global log level.
    pub transport_debug: bool,

    /// Prometheus namespace for the transport's counters. May be empty.
    pub metrics_namespace: String,

    pub tls: TlsMaterial,
}

impl QuicTransportConfig {
    pub fn new(tls: TlsMaterial) -> QuicTransportConfig {
        QuicTransportConfig {
            bind_addrs: vec!["0.0.0.0".to_string()],
            bind_port: 7946,
            packet_dial_timeout: Duration::from_secs(2),
            packet_write_timeout: Duration::from_secs(5),
            transport_debug: false,
            metrics_namespace: String::new(),
            tls,
        }
    }
}
