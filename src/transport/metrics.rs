use prometheus::{IntCounter, Opts, Registry};

const SUBSYSTEM: &str = "memberlist_quic_transport";

/// The transport's fixed counter set. Counters only - the transport is deliberately lossy, and
///  these are how losses become visible.
#[derive(Debug)]
pub struct TransportMetrics {
    pub incoming_streams: IntCounter,
    pub outgoing_streams: IntCounter,
    pub outgoing_stream_errors: IntCounter,

    pub received_packets: IntCounter,
    pub received_packets_bytes: IntCounter,
    pub received_packets_errors: IntCounter,
    pub sent_packets: IntCounter,
    pub sent_packets_bytes: IntCounter,
    pub sent_packets_errors: IntCounter,
    pub unknown_connections: IntCounter,
}

impl TransportMetrics {
    pub fn new(namespace: &str, registry: &Registry) -> anyhow::Result<TransportMetrics> {
        Ok(TransportMetrics {
            incoming_streams: counter(namespace, registry,
                "incoming_streams_total", "Number of incoming memberlist streams")?,
            outgoing_streams: counter(namespace, registry,
                "outgoing_streams_total", "Number of outgoing streams")?,
            outgoing_stream_errors: counter(namespace, registry,
                "outgoing_stream_errors_total", "Number of errors when opening memberlist stream to another node")?,
            received_packets: counter(namespace, registry,
                "packets_received_total", "Number of received memberlist packets")?,
            received_packets_bytes: counter(namespace, registry,
                "packets_received_bytes_total", "Total bytes received as packets")?,
            received_packets_errors: counter(namespace, registry,
                "packets_received_errors_total", "Number of errors when receiving memberlist packets")?,
            sent_packets: counter(namespace, registry,
                "packets_sent_total", "Number of memberlist packets sent")?,
            sent_packets_bytes: counter(namespace, registry,
                "packets_sent_bytes_total", "Total bytes sent as packets")?,
            sent_packets_errors: counter(namespace, registry,
                "packets_sent_errors_total", "Number of errors when sending memberlist packets")?,
            unknown_connections: counter(namespace, registry,
                "unknown_connections_total", "Number of unknown connections (not a packet or stream)")?,
        })
    }
}

fn counter(namespace: &str, registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntCounter> {
    let counter = IntCounter::with_opts(
        Opts::new(name, help)
            .namespace(namespace)
            .subsystem(SUBSYSTEM),
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
